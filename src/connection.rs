use std::io::Cursor;

use byteorder::{ReadBytesExt, WriteBytesExt};

use crate::{
    channel::{
        Channel, ChannelCounters, ChannelErrorLevel, ChannelPacketData,
        CONSERVATIVE_CHANNEL_HEADER_BITS, CONSERVATIVE_PACKET_HEADER_BITS,
    },
    config::ConnectionConfig,
    message::{Message, MessageFactory},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorLevel {
    /// No error. All is well.
    None,
    /// A channel is in an error state. Check the channels' error levels to
    /// find out which one and why.
    Channel,
    /// An incoming packet could not be deserialized.
    ReadPacketFailed,
}

/// A connection multiplexes a set of message channels over a single stream of
/// datagrams.
///
/// It is driven from outside by a packet endpoint: `generate_packet` fills
/// buffers the endpoint transmits (stamped with the endpoint's packet
/// sequence number), `process_packet` consumes reassembled inbound payloads,
/// and `process_acks` feeds back which packet sequences the peer reported
/// received. Time comes in through `advance_time`; nothing here blocks or
/// consults a clock.
pub struct Connection<F: MessageFactory> {
    config: ConnectionConfig,
    factory: F,
    channels: Vec<Channel<F::Payload>>,
    error_level: ConnectionErrorLevel,
}

impl<F: MessageFactory> Connection<F> {
    pub fn new(factory: F, config: ConnectionConfig, time: f64) -> Connection<F> {
        config.validate();

        let channels = (0..config.num_channels)
            .map(|index| Channel::new(config.channels[index], index, time))
            .collect();

        Connection {
            config,
            factory,
            channels,
            error_level: ConnectionErrorLevel::None,
        }
    }

    pub fn error_level(&self) -> ConnectionErrorLevel {
        self.error_level
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn can_send_message(&self, channel_index: usize) -> bool {
        self.channels[channel_index].can_send_message()
    }

    pub fn has_messages_to_send(&self, channel_index: usize) -> bool {
        self.channels[channel_index].has_messages_to_send()
    }

    /// Queue a message on a channel.
    ///
    /// The channel owns the message until it is delivered (or the channel is
    /// reset). Sending on a full reliable channel puts the channel in the
    /// `SendQueueFull` error state and discards the message.
    pub fn send_message(&mut self, channel_index: usize, message: Message<F::Payload>) {
        self.channels[channel_index].send_message(message, &self.factory);
    }

    /// Pop the next message delivered on a channel, if one is ready.
    pub fn receive_message(&mut self, channel_index: usize) -> Option<Message<F::Payload>> {
        self.channels[channel_index].receive_message()
    }

    pub fn channel_error_level(&self, channel_index: usize) -> ChannelErrorLevel {
        self.channels[channel_index].error_level()
    }

    pub fn channel_counters(&self, channel_index: usize) -> &ChannelCounters {
        self.channels[channel_index].counters()
    }

    pub fn reset_channel_counters(&mut self, channel_index: usize) {
        self.channels[channel_index].reset_counters();
    }

    /// Build an outgoing packet for the endpoint to transmit as
    /// `packet_sequence`.
    ///
    /// Each channel gets a shot at the remaining bit budget, in channel
    /// order. Returns the number of bytes written, or 0 if no channel had
    /// anything to say.
    pub fn generate_packet(&mut self, packet_sequence: u16, packet_buffer: &mut [u8]) -> usize {
        let mut available_bits =
            (packet_buffer.len() * 8).saturating_sub(CONSERVATIVE_PACKET_HEADER_BITS);

        let mut entries = Vec::new();
        for channel in self.channels.iter_mut() {
            if available_bits <= CONSERVATIVE_CHANNEL_HEADER_BITS {
                break;
            }
            available_bits -= CONSERVATIVE_CHANNEL_HEADER_BITS;

            if let Some((data, used_bits)) =
                channel.generate_packet_data(&self.factory, packet_sequence, available_bits)
            {
                available_bits = available_bits.saturating_sub(used_bits);
                entries.push(data);
            }
        }

        if entries.is_empty() {
            return 0;
        }

        let mut writer = Cursor::new(packet_buffer);
        if writer.write_u8(entries.len() as u8).is_err() {
            return 0;
        }
        debug_assert!(writer.position() as usize * 8 <= CONSERVATIVE_PACKET_HEADER_BITS);

        for entry in &entries {
            if let Err(err) = entry.serialize(&self.config, &self.factory, &mut writer) {
                // Budgets are conservative and payloads were measured, so
                // this indicates a non-deterministic message serializer.
                log::error!("failed to write channel packet data: {:?}", err);
                debug_assert!(false);
                return 0;
            }
        }

        writer.position() as usize
    }

    /// Consume a reassembled inbound packet payload.
    ///
    /// Returns false and puts the connection in the `ReadPacketFailed` state
    /// if the packet cannot be parsed.
    pub fn process_packet(&mut self, packet_sequence: u16, packet_data: &[u8]) -> bool {
        if self.error_level() != ConnectionErrorLevel::None {
            log::debug!("failed to read packet because connection is in error state");
            return false;
        }

        let mut reader = Cursor::new(packet_data);

        let num_entries = match reader.read_u8() {
            Ok(count) => count as usize,
            Err(_) => return self.fail_read("packet too short"),
        };
        if num_entries > self.config.num_channels {
            return self.fail_read("channel entry count out of range");
        }

        for _ in 0..num_entries {
            let data = match ChannelPacketData::<F::Payload>::deserialize(
                &self.config,
                &self.factory,
                packet_sequence,
                &mut reader,
            ) {
                Ok(data) => data,
                Err(err) => {
                    log::error!("failed to read channel packet data: {:?}", err);
                    return self.fail_read("bad channel entry");
                }
            };

            let channel_index = data.channel_index;
            let malformed = data.is_malformed();
            self.channels[channel_index].process_packet_data(data);

            // After a malformed message body the stream position is
            // meaningless; the channel is now errored, stop reading.
            if malformed {
                break;
            }
        }

        true
    }

    /// Feed packet-level acks from the endpoint to every channel.
    pub fn process_acks(&mut self, acks: &[u16]) {
        for &ack in acks {
            for channel in self.channels.iter_mut() {
                channel.process_ack(ack);
            }
        }
    }

    /// Advance time on every channel and surface channel failures.
    ///
    /// Every channel sees the new time, errored or not, so resend clocks on
    /// healthy channels never freeze behind a failed one. If any channel
    /// reports an error the connection latches `ChannelError`; the owner is
    /// expected to notice and disconnect the peer.
    pub fn advance_time(&mut self, time: f64) {
        for channel in self.channels.iter_mut() {
            channel.advance_time(time);
        }

        let channel_errored = self
            .channels
            .iter()
            .any(|channel| channel.error_level() != ChannelErrorLevel::None);
        if channel_errored && self.error_level == ConnectionErrorLevel::None {
            log::error!("connection has a channel in error state");
            self.error_level = ConnectionErrorLevel::Channel;
        }
    }

    /// Drop all queued messages and return every channel to a clean slate.
    pub fn reset(&mut self) {
        self.error_level = ConnectionErrorLevel::None;
        for channel in self.channels.iter_mut() {
            channel.reset();
        }
    }

    fn fail_read(&mut self, reason: &str) -> bool {
        log::error!("failed to read packet: {}", reason);
        self.error_level = ConnectionErrorLevel::ReadPacketFailed;
        false
    }
}
