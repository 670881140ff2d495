/// Hard limit on channels per connection; the packet codec reserves a single
/// byte for the channel count.
pub const MAX_CHANNELS: usize = 64;

/// Determines the reliability and ordering guarantees for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    /// Messages are delivered in send order, each exactly once. Messages are
    /// resent until the packet that carried them is acked.
    ReliableOrdered,
    /// Messages are delivered at most once, in packet arrival order, and are
    /// dropped rather than deferred when they don't fit or queues overflow.
    UnreliableUnordered,
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    pub kind: ChannelType,
    /// Refuse block messages on this channel. Receiving a block fragment on a
    /// channel with blocks disabled is a channel error.
    pub disable_blocks: bool,
    /// Entries in the sent-packet tracking buffer. Must divide 65536.
    pub sent_packet_buffer_size: usize,
    /// Entries in the message send queue. Must divide 65536.
    pub message_send_queue_size: usize,
    /// Entries in the message receive queue. Must divide 65536.
    pub message_receive_queue_size: usize,
    /// Most messages a single packet may carry for this channel. At most 256.
    pub max_messages_per_packet: usize,
    /// Cap on this channel's payload per packet, in bytes. None = use
    /// whatever budget remains in the packet.
    pub packet_budget: Option<usize>,
    /// Largest block that can be attached to a message, in bytes.
    pub max_block_size: usize,
    /// Bytes per block fragment. Blocks are cut into fragments of this size
    /// and reassembled on the receiver.
    pub block_fragment_size: usize,
    /// Seconds between transmissions of an unacked message.
    pub message_resend_time: f64,
    /// Seconds between transmissions of an unacked block fragment.
    pub block_fragment_resend_time: f64,
}

impl ChannelConfig {
    pub fn new(kind: ChannelType) -> Self {
        ChannelConfig {
            kind,
            disable_blocks: false,
            sent_packet_buffer_size: 1024,
            message_send_queue_size: 1024,
            message_receive_queue_size: 1024,
            max_messages_per_packet: 256,
            packet_budget: None,
            max_block_size: 256 * 1024,
            block_fragment_size: 1024,
            message_resend_time: 0.1,
            block_fragment_resend_time: 0.25,
        }
    }

    pub fn max_fragments_per_block(&self) -> usize {
        (self.max_block_size + self.block_fragment_size - 1) / self.block_fragment_size
    }

    pub(crate) fn validate(&self) {
        assert!(
            self.max_messages_per_packet >= 1 && self.max_messages_per_packet <= 256,
            "max_messages_per_packet must be in [1, 256]"
        );
        assert!(self.block_fragment_size >= 1 && self.block_fragment_size <= u16::MAX as usize);
        assert!(self.max_block_size >= 1);
        // Queue sizes are checked again by the sequence buffers themselves;
        // failing here names the offending field.
        for (name, size) in [
            ("sent_packet_buffer_size", self.sent_packet_buffer_size),
            ("message_send_queue_size", self.message_send_queue_size),
            (
                "message_receive_queue_size",
                self.message_receive_queue_size,
            ),
        ] {
            assert!(size > 0 && 65536 % size == 0, "{} must divide 65536", name);
        }
    }
}

#[derive(Clone)]
pub struct ConnectionConfig {
    /// Channels in use, in `[1, MAX_CHANNELS]`.
    pub num_channels: usize,
    /// Upper bound on generated packet size in bytes.
    pub max_packet_size: usize,
    /// Per-channel configuration; only the first `num_channels` entries are
    /// consulted.
    pub channels: [ChannelConfig; MAX_CHANNELS],
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            num_channels: 1,
            max_packet_size: 8 * 1024,
            channels: [ChannelConfig::new(ChannelType::ReliableOrdered); MAX_CHANNELS],
        }
    }
}

impl ConnectionConfig {
    pub(crate) fn validate(&self) {
        assert!(
            self.num_channels >= 1 && self.num_channels <= MAX_CHANNELS,
            "num_channels must be in [1, {}]",
            MAX_CHANNELS
        );
        assert!(self.max_packet_size > 0);
        for channel in &self.channels[..self.num_channels] {
            channel.validate();
        }
    }
}
