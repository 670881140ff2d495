use std::rc::Rc;

use crate::{
    config::{ChannelConfig, ChannelType},
    message::{Message, MessageFactory},
};

use self::{reliable::Reliable, unreliable::Unreliable};

mod channel_packet_data;
mod queue;
mod reliable;
mod sequence_buffer;
mod unreliable;

pub(crate) use channel_packet_data::ChannelPacketData;

#[cfg(feature = "serialize_check")]
pub(crate) const SERIALIZE_CHECK_VALUE: u32 = 0x12345678;

pub(crate) const CONSERVATIVE_MESSAGE_HEADER_BITS: usize = 32;
pub(crate) const CONSERVATIVE_FRAGMENT_HEADER_BITS: usize = 64;
pub(crate) const CONSERVATIVE_CHANNEL_HEADER_BITS: usize = 32;
pub(crate) const CONSERVATIVE_PACKET_HEADER_BITS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelErrorLevel {
    /// No error. All is well.
    None,
    /// This channel has desynced: the receiver saw message or fragment state
    /// it cannot reconcile with its window, and the protocol cannot recover.
    /// The peer should be disconnected.
    ///
    /// The common cause is not draining received messages. The receive window
    /// falls behind, the sender keeps going, and eventually a message id
    /// lands beyond what the receive queue can hold.
    Desync,
    /// The user tried to send a message but the send queue was full.
    ///
    /// Either messages are being sent faster than the channel can move them,
    /// or (on reliable channels) acks are not coming back. Acks are carried
    /// per packet, so the remote peer has to send *something* on any channel
    /// for this side's send queue to drain.
    SendQueueFull,
    /// A block fragment arrived on a channel configured with
    /// `disable_blocks`.
    BlocksDisabled,
    /// An incoming channel entry's message bodies could not be parsed. Check
    /// that both endpoints use identical message factories.
    FailedToDeserialize,
    /// The channel tried to allocate memory and couldn't. Declared for API
    /// completeness; allocation failure aborts in this implementation.
    OutOfMemory,
}

/// Per-channel message counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelCounters {
    /// Messages accepted into the send queue.
    pub sent: usize,
    /// Messages handed to the application.
    pub received: usize,
    /// Unreliable messages discarded because they didn't fit a packet.
    pub dropped: usize,
}

impl ChannelCounters {
    fn reset(&mut self) {
        *self = ChannelCounters::default();
    }
}

/// An independent message stream within a connection, with a fixed
/// reliability and ordering policy chosen by [`ChannelType`].
pub struct Channel<P> {
    config: ChannelConfig,
    channel_index: usize,
    error_level: ChannelErrorLevel,
    counters: ChannelCounters,
    processor: ChannelProcessor<P>,
}

/// The two channel behaviours as a closed sum; dispatch is a `match`, not a
/// vtable.
enum ChannelProcessor<P> {
    Reliable(Reliable<P>),
    Unreliable(Unreliable<P>),
}

impl<P> Channel<P> {
    pub(crate) fn new(config: ChannelConfig, channel_index: usize, time: f64) -> Channel<P> {
        let processor = match config.kind {
            ChannelType::ReliableOrdered => ChannelProcessor::Reliable(Reliable::new(config, time)),
            ChannelType::UnreliableUnordered => {
                ChannelProcessor::Unreliable(Unreliable::new(config))
            }
        };
        Channel {
            config,
            channel_index,
            error_level: ChannelErrorLevel::None,
            counters: ChannelCounters::default(),
            processor,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.error_level = ChannelErrorLevel::None;
        match &mut self.processor {
            ChannelProcessor::Reliable(reliable) => reliable.reset(),
            ChannelProcessor::Unreliable(unreliable) => unreliable.reset(),
        }
        self.reset_counters();
    }

    pub fn counters(&self) -> &ChannelCounters {
        &self.counters
    }

    pub fn reset_counters(&mut self) {
        self.counters.reset();
    }

    pub fn error_level(&self) -> ChannelErrorLevel {
        self.error_level
    }

    /// Called by the connection for each channel when time advances.
    pub(crate) fn advance_time(&mut self, time: f64) {
        if let ChannelProcessor::Reliable(reliable) = &mut self.processor {
            reliable.advance_time(time);
        }
    }

    pub(crate) fn can_send_message(&self) -> bool {
        match &self.processor {
            ChannelProcessor::Reliable(reliable) => reliable.can_send_message(),
            ChannelProcessor::Unreliable(unreliable) => unreliable.can_send_message(),
        }
    }

    pub(crate) fn has_messages_to_send(&self) -> bool {
        match &self.processor {
            ChannelProcessor::Reliable(reliable) => reliable.has_messages_to_send(),
            ChannelProcessor::Unreliable(unreliable) => unreliable.has_messages_to_send(),
        }
    }

    pub(crate) fn send_message<F>(&mut self, message: Message<P>, factory: &F)
    where
        F: MessageFactory<Payload = P>,
    {
        if self.error_level() != ChannelErrorLevel::None {
            return;
        }

        if !self.can_send_message() {
            self.set_error_level(ChannelErrorLevel::SendQueueFull);
            return;
        }

        if let Some(block) = message.block() {
            assert!(
                !self.config.disable_blocks,
                "blocks are disabled on channel {}",
                self.channel_index
            );
            assert!(
                block.len() <= self.config.max_block_size,
                "block is larger than max_block_size"
            );
        }

        match &mut self.processor {
            ChannelProcessor::Reliable(reliable) => reliable.send_message(message, factory),
            ChannelProcessor::Unreliable(unreliable) => unreliable.send_message(message),
        }

        self.counters.sent += 1;
    }

    pub(crate) fn receive_message(&mut self) -> Option<Message<P>> {
        if self.error_level() != ChannelErrorLevel::None {
            return None;
        }

        let message = match &mut self.processor {
            ChannelProcessor::Reliable(reliable) => reliable.receive_message()?,
            ChannelProcessor::Unreliable(unreliable) => unreliable.receive_message()?,
        };

        self.counters.received += 1;

        // Every other reference was dropped when the carrying packet entry
        // was processed, so this unwrap transfers ownership to the caller.
        Some(
            Rc::try_unwrap(message)
                .ok()
                .expect("delivered messages are uniquely owned"),
        )
    }

    /// Produce this channel's contribution to an outgoing packet, within
    /// `available_bits`. Returns the payload and its cost in bits.
    pub(crate) fn generate_packet_data<F>(
        &mut self,
        factory: &F,
        packet_sequence: u16,
        available_bits: usize,
    ) -> Option<(ChannelPacketData<P>, usize)>
    where
        F: MessageFactory<Payload = P>,
    {
        match &mut self.processor {
            ChannelProcessor::Reliable(reliable) => {
                reliable.generate_packet_data(self.channel_index, packet_sequence, available_bits)
            }
            ChannelProcessor::Unreliable(unreliable) => unreliable.generate_packet_data(
                factory,
                &mut self.counters,
                self.channel_index,
                available_bits,
            ),
        }
    }

    pub(crate) fn process_packet_data(&mut self, data: ChannelPacketData<P>) {
        if self.error_level() != ChannelErrorLevel::None {
            return;
        }

        let result = match &mut self.processor {
            ChannelProcessor::Reliable(reliable) => reliable.process_packet_data(data),
            ChannelProcessor::Unreliable(unreliable) => unreliable.process_packet_data(data),
        };

        if let Err(error_level) = result {
            self.set_error_level(error_level);
        }
    }

    pub(crate) fn process_ack(&mut self, packet_sequence: u16) {
        if let ChannelProcessor::Reliable(reliable) = &mut self.processor {
            reliable.process_ack(packet_sequence);
        }
    }

    /// All errors funnel through here to make debug logging easier.
    fn set_error_level(&mut self, level: ChannelErrorLevel) {
        if self.error_level != level && level != ChannelErrorLevel::None {
            log::error!(
                "channel {} went into error state: {:?}",
                self.channel_index,
                level
            );
        }
        self.error_level = level;
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

    use super::*;
    use crate::config::ChannelConfig;

    struct TestFactory;

    impl MessageFactory for TestFactory {
        type Payload = u64;
        type Error = std::io::Error;

        fn max_message_type(&self) -> u16 {
            0
        }

        fn message_type(&self, _payload: &u64) -> u16 {
            0
        }

        fn serialize<W: Write>(&self, payload: &u64, mut writer: W) -> std::io::Result<()> {
            writer.write_u64::<LittleEndian>(*payload)
        }

        fn deserialize<R: Read>(&self, _message_type: u16, mut reader: R) -> std::io::Result<u64> {
            reader.read_u64::<LittleEndian>()
        }
    }

    #[test]
    fn send_queue_overflow_is_sticky() {
        let mut config = ChannelConfig::new(ChannelType::ReliableOrdered);
        config.message_send_queue_size = 8;
        let mut channel: Channel<u64> = Channel::new(config, 0, 100.0);

        for value in 0..9u64 {
            channel.send_message(Message::new(value), &TestFactory);
        }

        assert_eq!(channel.error_level(), ChannelErrorLevel::SendQueueFull);
        assert_eq!(channel.counters().sent, 8);

        // Sticky: no further sends are accepted, no receives are delivered.
        channel.send_message(Message::new(99), &TestFactory);
        assert_eq!(channel.counters().sent, 8);
        assert!(channel.receive_message().is_none());

        channel.reset();
        assert_eq!(channel.error_level(), ChannelErrorLevel::None);
        assert_eq!(channel.counters().sent, 0);
        assert!(channel.can_send_message());
    }

    #[test]
    fn reset_restores_a_working_channel() {
        let config = ChannelConfig::new(ChannelType::ReliableOrdered);
        let mut sender: Channel<u64> = Channel::new(config, 0, 100.0);
        let mut receiver: Channel<u64> = Channel::new(config, 0, 100.0);

        sender.send_message(Message::new(5), &TestFactory);
        sender.reset();
        assert!(!sender.has_messages_to_send());

        sender.send_message(Message::new(6), &TestFactory);
        let (data, _) = sender
            .generate_packet_data(&TestFactory, 0, 64 * 1024)
            .unwrap();
        receiver.process_packet_data(data);

        let message = receiver.receive_message().unwrap();
        assert_eq!(message.id(), 0);
        assert_eq!(*message.payload(), 6);
        assert_eq!(receiver.counters().received, 1);
    }
}
