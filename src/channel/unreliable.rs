use std::rc::Rc;

use crate::{
    channel::{ChannelCounters, ChannelErrorLevel, CONSERVATIVE_MESSAGE_HEADER_BITS},
    config::{ChannelConfig, ChannelType},
    message::{measure_payload, Message, MessageFactory},
};

use super::{
    channel_packet_data::{ChannelPacketContent, ChannelPacketData},
    queue::BoundedQueue,
};

/// Messages sent across this channel are not guaranteed to arrive and are
/// delivered in packet arrival order, which may differ from send order.
///
/// Best for time-critical data like snapshots and object state, where a stale
/// message is worth less than the bandwidth to resend it.
pub(crate) struct Unreliable<P> {
    config: ChannelConfig,
    message_send_queue: BoundedQueue<Rc<Message<P>>>,
    message_receive_queue: BoundedQueue<Rc<Message<P>>>,
}

impl<P> Unreliable<P> {
    pub(crate) fn new(config: ChannelConfig) -> Unreliable<P> {
        debug_assert_eq!(config.kind, ChannelType::UnreliableUnordered);

        Unreliable {
            message_send_queue: BoundedQueue::new(config.message_send_queue_size),
            message_receive_queue: BoundedQueue::new(config.message_receive_queue_size),
            config,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.message_send_queue.clear();
        self.message_receive_queue.clear();
    }

    pub(crate) fn can_send_message(&self) -> bool {
        !self.message_send_queue.is_full()
    }

    pub(crate) fn has_messages_to_send(&self) -> bool {
        !self.message_send_queue.is_empty()
    }

    pub(crate) fn send_message(&mut self, message: Message<P>) {
        let result = self.message_send_queue.push(Rc::new(message));
        debug_assert!(result.is_ok(), "can_send_message was checked by the caller");
    }

    pub(crate) fn receive_message(&mut self) -> Option<Rc<Message<P>>> {
        self.message_receive_queue.pop()
    }

    /// Pack as many queued messages as fit the budget.
    ///
    /// Messages are popped permanently: one that does not fit is dropped, not
    /// deferred, so a stale snapshot never jams the queue. Drops show up in
    /// the channel's `dropped` counter.
    pub(crate) fn generate_packet_data<F>(
        &mut self,
        factory: &F,
        counters: &mut ChannelCounters,
        channel_index: usize,
        mut available_bits: usize,
    ) -> Option<(ChannelPacketData<P>, usize)>
    where
        F: MessageFactory<Payload = P>,
    {
        if self.message_send_queue.is_empty() {
            return None;
        }

        if let Some(budget) = self.config.packet_budget {
            if budget == 0 {
                log::warn!("packet budget is 0, no messages can be written to this channel");
            }
            available_bits = std::cmp::min(budget * 8, available_bits);
        }

        let give_up_bits = 4 * 8;
        let mut used_bits = CONSERVATIVE_MESSAGE_HEADER_BITS;
        let mut messages = Vec::new();

        loop {
            if available_bits.saturating_sub(used_bits) < give_up_bits {
                break;
            }
            if messages.len() == self.config.max_messages_per_packet {
                break;
            }
            let Some(message) = self.message_send_queue.pop() else {
                break;
            };

            let mut message_bits = measure_payload(factory, &message.payload)
                .expect("message payload failed to serialize during measurement")
                + 16;
            if cfg!(feature = "serialize_check") {
                message_bits += 32;
            }
            if !self.config.disable_blocks {
                message_bits += 8;
                if let Some(block) = message.block() {
                    debug_assert!(block.len() <= self.config.max_block_size);
                    message_bits += 32 + block.len() * 8;
                }
            }

            if used_bits + message_bits > available_bits {
                log::debug!("unreliable message does not fit this packet, dropping it");
                counters.dropped += 1;
                continue;
            }

            used_bits += message_bits;
            debug_assert!(used_bits <= available_bits);
            messages.push(message);
        }

        if messages.is_empty() {
            return None;
        }

        let data = ChannelPacketData {
            channel_index,
            content: ChannelPacketContent::Messages(messages),
        };
        Some((data, used_bits))
    }

    pub(crate) fn process_packet_data(
        &mut self,
        data: ChannelPacketData<P>,
    ) -> Result<(), ChannelErrorLevel> {
        match data.content {
            ChannelPacketContent::Malformed => Err(ChannelErrorLevel::FailedToDeserialize),
            ChannelPacketContent::BlockFragment(_) => {
                // The codec refuses fragments addressed to unreliable
                // channels before they get here.
                log::warn!("ignoring block fragment on an unreliable channel");
                Ok(())
            }
            ChannelPacketContent::Messages(messages) => {
                // Ids were stamped with the packet sequence during decode.
                for message in messages {
                    if self.message_receive_queue.push(message).is_err() {
                        log::debug!("unreliable receive queue is full, dropping message");
                    }
                }
                Ok(())
            }
        }
    }
}
