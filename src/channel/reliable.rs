use std::{mem, rc::Rc};

use crate::{
    channel::{
        ChannelErrorLevel, CONSERVATIVE_FRAGMENT_HEADER_BITS, CONSERVATIVE_MESSAGE_HEADER_BITS,
    },
    config::{ChannelConfig, ChannelType},
    message::{measure_payload, Message, MessageFactory},
};

use super::{
    channel_packet_data::{
        relative_message_id_bits, BlockFragmentData, ChannelPacketContent, ChannelPacketData,
    },
    sequence_buffer::{sequence_greater_than, sequence_less_than, SequenceBuffer},
};

/// Extra wire cost of the per-message check value when the `serialize_check`
/// feature is enabled.
fn check_value_bits() -> usize {
    if cfg!(feature = "serialize_check") {
        32
    } else {
        0
    }
}

/// Messages sent across this channel are delivered to the receiving
/// application in send order, each exactly once, no matter how many packets
/// are lost or reordered underneath.
///
/// Packet-level acks from the endpoint are translated back into per-message
/// (and per-block-fragment) acks through the sent-packet buffer; anything not
/// yet acked is retransmitted on a timer.
pub(crate) struct Reliable<P> {
    time: f64,
    config: ChannelConfig,

    /// Id assigned to the next message the application sends.
    send_message_id: u16,
    /// Id of the next message the application will dequeue.
    receive_message_id: u16,
    /// Left edge of the retransmission window. Equal to `send_message_id`
    /// exactly when the send queue is empty.
    oldest_unacked_message_id: u16,

    /// Flat arena of message ids carried per sent packet. Each `sent_packets`
    /// entry references a run of this buffer at
    /// `(packet_sequence % sent_packet_buffer_size) * max_messages_per_packet`.
    sent_packet_message_ids: Vec<u16>,

    sent_packets: SequenceBuffer<SentPacketEntry>,
    message_send_queue: SequenceBuffer<SendQueueEntry<P>>,
    message_receive_queue: SequenceBuffer<Rc<Message<P>>>,

    send_block: SendBlockState,
    receive_block: ReceiveBlockState<P>,
}

struct SendQueueEntry<P> {
    message: Rc<Message<P>>,
    time_last_sent: f64,
    measured_bits: usize,
}

struct SentPacketEntry {
    /// The time the packet went out. Round trip estimation lives in the
    /// endpoint; this is kept for debugging.
    #[allow(dead_code)]
    time_sent: f64,
    acked: bool,
    content: SentPacketContent,
}

#[derive(Clone, Copy)]
enum SentPacketContent {
    /// Run of `sent_packet_message_ids` listing the messages this packet
    /// carried.
    Messages { first: usize, count: usize },
    BlockFragment { message_id: u16, fragment_id: u16 },
}

/// Progress of the single block currently being transmitted.
struct SendBlockState {
    active: bool,
    block_size: usize,
    num_fragments: usize,
    num_acked_fragments: usize,
    block_message_id: u16,
    acked_fragment: Vec<bool>,
    fragment_send_time: Vec<f64>,
}

impl SendBlockState {
    fn new() -> SendBlockState {
        SendBlockState {
            active: false,
            block_size: 0,
            num_fragments: 0,
            num_acked_fragments: 0,
            block_message_id: 0,
            acked_fragment: Vec::new(),
            fragment_send_time: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.active = false;
        self.block_size = 0;
        self.num_fragments = 0;
        self.num_acked_fragments = 0;
        self.block_message_id = 0;
        self.acked_fragment.clear();
        self.fragment_send_time.clear();
    }
}

/// Reassembly of the single block currently being received.
struct ReceiveBlockState<P> {
    active: bool,
    message_id: u16,
    num_fragments: usize,
    num_received_fragments: usize,
    /// Known once the final fragment arrives; 0 until then.
    block_size: usize,
    received_fragment: Vec<bool>,
    block_data: Vec<u8>,
    /// Carried by fragment 0; the block bytes attach to it on completion.
    message: Option<Rc<Message<P>>>,
}

impl<P> ReceiveBlockState<P> {
    fn new() -> ReceiveBlockState<P> {
        ReceiveBlockState {
            active: false,
            message_id: 0,
            num_fragments: 0,
            num_received_fragments: 0,
            block_size: 0,
            received_fragment: Vec::new(),
            block_data: Vec::new(),
            message: None,
        }
    }

    fn reset(&mut self) {
        self.active = false;
        self.message_id = 0;
        self.num_fragments = 0;
        self.num_received_fragments = 0;
        self.block_size = 0;
        self.received_fragment.clear();
        self.block_data.clear();
        self.message = None;
    }
}

impl<P> Reliable<P> {
    pub(crate) fn new(config: ChannelConfig, time: f64) -> Reliable<P> {
        assert!(matches!(config.kind, ChannelType::ReliableOrdered));

        let sent_packets = SequenceBuffer::new(config.sent_packet_buffer_size);
        let sent_packet_message_ids =
            vec![0u16; config.max_messages_per_packet * config.sent_packet_buffer_size];
        let message_send_queue = SequenceBuffer::new(config.message_send_queue_size);
        let message_receive_queue = SequenceBuffer::new(config.message_receive_queue_size);

        Reliable {
            time,
            config,

            send_message_id: 0,
            receive_message_id: 0,
            oldest_unacked_message_id: 0,

            sent_packet_message_ids,

            sent_packets,
            message_send_queue,
            message_receive_queue,

            send_block: SendBlockState::new(),
            receive_block: ReceiveBlockState::new(),
        }
    }

    pub(crate) fn advance_time(&mut self, new_time: f64) {
        self.time = new_time;
    }

    pub(crate) fn reset(&mut self) {
        self.send_message_id = 0;
        self.receive_message_id = 0;
        self.oldest_unacked_message_id = 0;

        self.sent_packets.reset();
        self.message_send_queue.reset();
        self.message_receive_queue.reset();

        self.send_block.reset();
        self.receive_block.reset();
    }

    /// There are messages in flight while the oldest unacked id trails the
    /// next send id.
    pub(crate) fn has_messages_to_send(&self) -> bool {
        self.oldest_unacked_message_id != self.send_message_id
    }

    pub(crate) fn can_send_message(&self) -> bool {
        self.message_send_queue.available(self.send_message_id)
    }

    /// True while the oldest unacked message is a block message, in which
    /// case outgoing packets carry block fragments instead of message lists.
    pub(crate) fn sending_block_message(&self) -> bool {
        self.has_messages_to_send()
            && self
                .message_send_queue
                .get(self.oldest_unacked_message_id)
                .map_or(false, |entry| entry.message.has_block())
    }

    pub(crate) fn receive_message(&mut self) -> Option<Rc<Message<P>>> {
        let message = self.message_receive_queue.take(self.receive_message_id)?;
        debug_assert_eq!(message.id, self.receive_message_id);
        self.receive_message_id = self.receive_message_id.wrapping_add(1);
        Some(message)
    }
}

impl<P> Reliable<P> {
    pub(crate) fn send_message<F>(&mut self, mut message: Message<P>, factory: &F)
    where
        F: MessageFactory<Payload = P>,
    {
        assert!(self.can_send_message());

        message.id = self.send_message_id;

        let measured_bits = measure_payload(factory, &message.payload)
            .expect("message payload failed to serialize during measurement");

        let inserted = self.message_send_queue.insert_with(self.send_message_id, || {
            SendQueueEntry {
                message: Rc::new(message),
                time_last_sent: -1.0,
                measured_bits,
            }
        });
        debug_assert!(inserted, "can_send_message was checked above");

        self.send_message_id = self.send_message_id.wrapping_add(1);
    }

    pub(crate) fn generate_packet_data(
        &mut self,
        channel_index: usize,
        packet_sequence: u16,
        available_bits: usize,
    ) -> Option<(ChannelPacketData<P>, usize)> {
        if !self.has_messages_to_send() {
            return None;
        }

        if self.sending_block_message() {
            self.generate_fragment_packet_data(channel_index, packet_sequence, available_bits)
        } else {
            self.generate_message_packet_data(channel_index, packet_sequence, available_bits)
        }
    }

    fn generate_message_packet_data(
        &mut self,
        channel_index: usize,
        packet_sequence: u16,
        available_bits: usize,
    ) -> Option<(ChannelPacketData<P>, usize)> {
        let (message_ids, used_bits) = self.select_messages_to_send(available_bits);
        if message_ids.is_empty() {
            return None;
        }

        let messages = message_ids
            .iter()
            .map(|id| {
                let entry = self
                    .message_send_queue
                    .get(*id)
                    .expect("selected ids are present in the send queue");
                Rc::clone(&entry.message)
            })
            .collect();

        self.record_message_packet(&message_ids, packet_sequence);

        let data = ChannelPacketData {
            channel_index,
            content: ChannelPacketContent::Messages(messages),
        };
        Some((data, used_bits))
    }

    /// Walk the send queue from the oldest unacked message and pick the
    /// messages to put in this packet.
    ///
    /// A message qualifies once its resend timer has elapsed and its measured
    /// size fits what is left of the budget. The walk gives up when the
    /// budget is nearly exhausted, the per-packet message cap is reached, or
    /// too many messages in a row failed to fit.
    fn select_messages_to_send(&mut self, mut available_bits: usize) -> (Vec<u16>, usize) {
        debug_assert!(self.has_messages_to_send());

        if let Some(budget) = self.config.packet_budget {
            available_bits = std::cmp::min(budget * 8, available_bits);
        }

        let give_up_bits = 4 * 8;
        let message_limit = std::cmp::min(
            self.message_send_queue.capacity(),
            self.message_receive_queue.capacity(),
        );

        let mut message_ids = Vec::new();
        let mut used_bits = CONSERVATIVE_MESSAGE_HEADER_BITS;
        let mut give_up_counter = 0;
        let mut previous_id = 0u16;

        for i in 0..message_limit {
            if available_bits.saturating_sub(used_bits) < give_up_bits {
                break;
            }
            if give_up_counter > self.message_send_queue.capacity() {
                break;
            }
            if message_ids.len() == self.config.max_messages_per_packet {
                break;
            }

            let message_id = self.oldest_unacked_message_id.wrapping_add(i as u16);
            let Some(entry) = self.message_send_queue.get_mut(message_id) else {
                continue;
            };

            // Block messages wait until they are the oldest unacked message
            // and go out as fragments.
            if entry.message.has_block() {
                continue;
            }

            if entry.time_last_sent + self.config.message_resend_time > self.time {
                continue;
            }
            if entry.measured_bits > available_bits {
                continue;
            }

            let id_bits = if message_ids.is_empty() {
                16
            } else {
                relative_message_id_bits(previous_id, message_id)
            };
            let message_bits = entry.measured_bits + 16 + id_bits + check_value_bits();

            if used_bits + message_bits > available_bits {
                give_up_counter += 1;
                continue;
            }

            used_bits += message_bits;
            entry.time_last_sent = self.time;
            previous_id = message_id;
            message_ids.push(message_id);
        }

        (message_ids, used_bits)
    }

    /// Record which message ids went out in packet `packet_sequence`, so a
    /// later ack for that packet can be translated back to message acks.
    fn record_message_packet(&mut self, message_ids: &[u16], packet_sequence: u16) {
        let first = (packet_sequence as usize % self.config.sent_packet_buffer_size)
            * self.config.max_messages_per_packet;
        let count = message_ids.len();
        let time_sent = self.time;
        self.sent_packets.insert_with_ordered(packet_sequence, || {
            for (i, id) in message_ids.iter().enumerate() {
                self.sent_packet_message_ids[first + i] = *id;
            }
            SentPacketEntry {
                time_sent,
                acked: false,
                content: SentPacketContent::Messages { first, count },
            }
        });
    }

    fn generate_fragment_packet_data(
        &mut self,
        channel_index: usize,
        packet_sequence: u16,
        mut available_bits: usize,
    ) -> Option<(ChannelPacketData<P>, usize)> {
        if !self.send_block.active {
            self.start_block_send();
        }

        if let Some(budget) = self.config.packet_budget {
            available_bits = std::cmp::min(budget * 8, available_bits);
        }

        let fragment_id = self.next_fragment_to_send()?;

        let entry = self
            .message_send_queue
            .get(self.send_block.block_message_id)
            .expect("the block message stays queued until every fragment is acked");
        let block = entry
            .message
            .block()
            .expect("the active send block has block bytes");
        debug_assert_eq!(block.len(), self.send_block.block_size);

        let fragment_start = fragment_id * self.config.block_fragment_size;
        let fragment_end = std::cmp::min(
            fragment_start + self.config.block_fragment_size,
            block.len(),
        );

        let mut fragment_bits =
            CONSERVATIVE_FRAGMENT_HEADER_BITS + (fragment_end - fragment_start) * 8;
        if fragment_id == 0 {
            fragment_bits += entry.measured_bits + 16 + check_value_bits();
        }
        if fragment_bits > available_bits {
            return None;
        }

        let fragment = BlockFragmentData {
            message_id: self.send_block.block_message_id,
            num_fragments: self.send_block.num_fragments as u16,
            fragment_id: fragment_id as u16,
            fragment_data: block[fragment_start..fragment_end].to_vec(),
            message: (fragment_id == 0).then(|| Rc::clone(&entry.message)),
        };

        self.send_block.fragment_send_time[fragment_id] = self.time;

        let time_sent = self.time;
        let message_id = self.send_block.block_message_id;
        self.sent_packets.insert_with_ordered(packet_sequence, || SentPacketEntry {
            time_sent,
            acked: false,
            content: SentPacketContent::BlockFragment {
                message_id,
                fragment_id: fragment_id as u16,
            },
        });

        let data = ChannelPacketData {
            channel_index,
            content: ChannelPacketContent::BlockFragment(fragment),
        };
        Some((data, fragment_bits))
    }

    /// Begin fragmenting the oldest unacked message's block.
    fn start_block_send(&mut self) {
        let entry = self
            .message_send_queue
            .get(self.oldest_unacked_message_id)
            .expect("sending_block_message was checked by the caller");
        let block_size = entry.message.block().map_or(0, |block| block.len());
        debug_assert!(block_size > 0);

        let num_fragments =
            (block_size + self.config.block_fragment_size - 1) / self.config.block_fragment_size;
        assert!(num_fragments <= self.config.max_fragments_per_block());

        self.send_block.active = true;
        self.send_block.block_size = block_size;
        self.send_block.num_fragments = num_fragments;
        self.send_block.num_acked_fragments = 0;
        self.send_block.block_message_id = self.oldest_unacked_message_id;
        self.send_block.acked_fragment.clear();
        self.send_block.acked_fragment.resize(num_fragments, false);
        self.send_block.fragment_send_time.clear();
        self.send_block.fragment_send_time.resize(num_fragments, -1.0);
    }

    /// Smallest unacked fragment whose resend timer has elapsed.
    fn next_fragment_to_send(&self) -> Option<usize> {
        for fragment_id in 0..self.send_block.num_fragments {
            if self.send_block.acked_fragment[fragment_id] {
                continue;
            }
            if self.send_block.fragment_send_time[fragment_id]
                + self.config.block_fragment_resend_time
                <= self.time
            {
                return Some(fragment_id);
            }
        }
        None
    }

    pub(crate) fn process_packet_data(
        &mut self,
        data: ChannelPacketData<P>,
    ) -> Result<(), ChannelErrorLevel> {
        match data.content {
            ChannelPacketContent::Malformed => Err(ChannelErrorLevel::FailedToDeserialize),
            ChannelPacketContent::BlockFragment(fragment) => {
                if self.config.disable_blocks {
                    return Err(ChannelErrorLevel::BlocksDisabled);
                }
                self.process_block_fragment(fragment)
            }
            ChannelPacketContent::Messages(messages) => self.process_messages(messages),
        }
    }

    fn process_messages(
        &mut self,
        messages: Vec<Rc<Message<P>>>,
    ) -> Result<(), ChannelErrorLevel> {
        let newest_acceptable_id = self
            .receive_message_id
            .wrapping_add(self.message_receive_queue.capacity() as u16 - 1);

        for message in messages {
            let message_id = message.id;

            // Already delivered.
            if sequence_less_than(message_id, self.receive_message_id) {
                continue;
            }
            // The sender ran ahead of what our receive window can hold; the
            // protocol cannot recover from this.
            if sequence_greater_than(message_id, newest_acceptable_id) {
                return Err(ChannelErrorLevel::Desync);
            }
            // Duplicate of a message already waiting for delivery.
            if self.message_receive_queue.exists(message_id) {
                continue;
            }

            let _ = self.message_receive_queue.insert(message_id, message);
        }

        Ok(())
    }

    fn process_block_fragment(
        &mut self,
        fragment: BlockFragmentData<P>,
    ) -> Result<(), ChannelErrorLevel> {
        if !self.receive_block.active {
            // Only start reassembly for the next message this queue expects;
            // anything else is a stale retransmit.
            let expected_message_id = self.message_receive_queue.next_sequence();
            if fragment.message_id != expected_message_id {
                return Ok(());
            }

            let num_fragments = fragment.num_fragments as usize;
            debug_assert!(
                num_fragments >= 1 && num_fragments <= self.config.max_fragments_per_block()
            );

            self.receive_block.active = true;
            self.receive_block.message_id = fragment.message_id;
            self.receive_block.num_fragments = num_fragments;
            self.receive_block.num_received_fragments = 0;
            self.receive_block.block_size = 0;
            self.receive_block.received_fragment.clear();
            self.receive_block.received_fragment.resize(num_fragments, false);
            self.receive_block.block_data.clear();
            self.receive_block
                .block_data
                .resize(num_fragments * self.config.block_fragment_size, 0);
            self.receive_block.message = None;
        }

        if fragment.message_id != self.receive_block.message_id {
            // Stale fragment for a block that already completed.
            return Ok(());
        }

        if fragment.num_fragments as usize != self.receive_block.num_fragments {
            return Err(ChannelErrorLevel::Desync);
        }

        let fragment_id = fragment.fragment_id as usize;
        if fragment_id >= self.receive_block.num_fragments {
            return Err(ChannelErrorLevel::Desync);
        }

        if self.receive_block.received_fragment[fragment_id] {
            return Ok(());
        }

        let last_fragment = fragment_id == self.receive_block.num_fragments - 1;
        if last_fragment {
            let block_size = (self.receive_block.num_fragments - 1)
                * self.config.block_fragment_size
                + fragment.fragment_data.len();
            if block_size > self.config.max_block_size {
                return Err(ChannelErrorLevel::Desync);
            }
            self.receive_block.block_size = block_size;
        } else if fragment.fragment_data.len() != self.config.block_fragment_size {
            return Err(ChannelErrorLevel::Desync);
        }

        self.receive_block.received_fragment[fragment_id] = true;
        self.receive_block.num_received_fragments += 1;

        let offset = fragment_id * self.config.block_fragment_size;
        self.receive_block.block_data[offset..offset + fragment.fragment_data.len()]
            .copy_from_slice(&fragment.fragment_data);

        if fragment_id == 0 {
            debug_assert!(fragment.message.is_some());
            self.receive_block.message = fragment.message;
        }

        if self.receive_block.num_received_fragments == self.receive_block.num_fragments {
            self.complete_block()?;
        }

        Ok(())
    }

    /// All fragments arrived: attach the block bytes to the message from
    /// fragment 0 and hand it to the receive queue.
    fn complete_block(&mut self) -> Result<(), ChannelErrorLevel> {
        let message_id = self.receive_block.message_id;

        let message = self
            .receive_block
            .message
            .take()
            .ok_or(ChannelErrorLevel::Desync)?;
        let mut message = Rc::try_unwrap(message)
            .ok()
            .expect("the block message is uniquely owned until delivery");

        let mut block = mem::take(&mut self.receive_block.block_data);
        block.truncate(self.receive_block.block_size);
        message.block = Some(block);

        if self.message_receive_queue.exists(message_id) {
            return Err(ChannelErrorLevel::Desync);
        }
        let _ = self.message_receive_queue.insert(message_id, Rc::new(message));

        self.receive_block.reset();
        Ok(())
    }

    pub(crate) fn process_ack(&mut self, ack: u16) {
        // An ack for a packet that already fell out of the buffer is ignored.
        let Some(entry) = self.sent_packets.get_mut(ack) else {
            return;
        };
        assert!(!entry.acked, "the endpoint reports each ack once");
        entry.acked = true;
        let content = entry.content;

        match content {
            SentPacketContent::Messages { first, count } => {
                for index in first..first + count {
                    let message_id = self.sent_packet_message_ids[index];
                    if let Some(entry) = self.message_send_queue.take(message_id) {
                        debug_assert_eq!(entry.message.id, message_id);
                        drop(entry);
                        self.oldest_unacked_message_id = advance_oldest_unacked_message_id(
                            self.oldest_unacked_message_id,
                            self.send_message_id,
                            &self.message_send_queue,
                        );
                    }
                }
            }
            SentPacketContent::BlockFragment {
                message_id,
                fragment_id,
            } => {
                if !self.send_block.active || self.send_block.block_message_id != message_id {
                    return;
                }
                let fragment_id = fragment_id as usize;
                if self.send_block.acked_fragment[fragment_id] {
                    return;
                }

                self.send_block.acked_fragment[fragment_id] = true;
                self.send_block.num_acked_fragments += 1;

                if self.send_block.num_acked_fragments == self.send_block.num_fragments {
                    if self.message_send_queue.take(message_id).is_some() {
                        self.oldest_unacked_message_id = advance_oldest_unacked_message_id(
                            self.oldest_unacked_message_id,
                            self.send_message_id,
                            &self.message_send_queue,
                        );
                    }
                    self.send_block.reset();
                }
            }
        }
    }
}

/// Advance the oldest unacked id past entries no longer in the send queue,
/// stopping at the next id to be assigned.
fn advance_oldest_unacked_message_id<P>(
    mut oldest_unacked_message_id: u16,
    send_message_id: u16,
    message_send_queue: &SequenceBuffer<SendQueueEntry<P>>,
) -> u16 {
    loop {
        if oldest_unacked_message_id == send_message_id
            || message_send_queue.exists(oldest_unacked_message_id)
        {
            break;
        }
        oldest_unacked_message_id = oldest_unacked_message_id.wrapping_add(1);
    }
    debug_assert!(!sequence_greater_than(
        oldest_unacked_message_id,
        send_message_id
    ));
    oldest_unacked_message_id
}
