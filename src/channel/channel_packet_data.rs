use std::{
    io::{self, Cursor, Read, Write},
    rc::Rc,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{
    config::{ChannelType, ConnectionConfig},
    message::{Message, MessageFactory},
};

#[cfg(feature = "serialize_check")]
use crate::channel::SERIALIZE_CHECK_VALUE;

/// One channel's contribution to a connection packet.
pub(crate) struct ChannelPacketData<P> {
    pub(crate) channel_index: usize,
    pub(crate) content: ChannelPacketContent<P>,
}

pub(crate) enum ChannelPacketContent<P> {
    /// A batch of whole messages.
    Messages(Vec<Rc<Message<P>>>),
    /// A single fragment of a block message.
    BlockFragment(BlockFragmentData<P>),
    /// Message bodies could not be parsed on receive. Never serialized; the
    /// owning channel reacts by entering the failed-to-deserialize state.
    Malformed,
}

pub(crate) struct BlockFragmentData<P> {
    pub(crate) message_id: u16,
    pub(crate) num_fragments: u16,
    pub(crate) fragment_id: u16,
    pub(crate) fragment_data: Vec<u8>,
    /// The block message itself, carried only by fragment 0.
    pub(crate) message: Option<Rc<Message<P>>>,
}

#[derive(Debug)]
pub(crate) enum SerializeError<E> {
    Io(io::Error),
    /// The application's payload serializer failed.
    Message(E),
}

impl<E> From<io::Error> for SerializeError<E> {
    fn from(err: io::Error) -> Self {
        SerializeError::Io(err)
    }
}

#[derive(Debug)]
pub(crate) enum DeserializeError {
    Io(io::Error),
    Malformed(&'static str),
}

impl From<io::Error> for DeserializeError {
    fn from(err: io::Error) -> Self {
        DeserializeError::Io(err)
    }
}

/// Wire cost in bits of a message id encoded relative to the id before it.
///
/// Near-consecutive ids (delta in `[1, 255]`) pack into one byte; anything
/// else is an escape byte plus the full id. Deltas of zero cannot occur
/// because ids in a packet strictly increase.
pub(crate) fn relative_message_id_bits(previous: u16, id: u16) -> usize {
    let delta = id.wrapping_sub(previous);
    if (1..=255).contains(&delta) {
        8
    } else {
        24
    }
}

fn write_relative_message_id<W: Write>(
    writer: &mut W,
    previous: u16,
    id: u16,
) -> io::Result<()> {
    let delta = id.wrapping_sub(previous);
    if (1..=255).contains(&delta) {
        writer.write_u8(delta as u8)
    } else {
        writer.write_u8(0)?;
        writer.write_u16::<LittleEndian>(id)
    }
}

fn read_relative_message_id<R: Read>(reader: &mut R, previous: u16) -> io::Result<u16> {
    let delta = reader.read_u8()?;
    if delta == 0 {
        reader.read_u16::<LittleEndian>()
    } else {
        Ok(previous.wrapping_add(delta as u16))
    }
}

impl<P> ChannelPacketData<P> {
    /// True for the receive-side marker left behind when message bodies
    /// could not be parsed.
    pub(crate) fn is_malformed(&self) -> bool {
        matches!(self.content, ChannelPacketContent::Malformed)
    }

    pub(crate) fn serialize<F>(
        &self,
        config: &ConnectionConfig,
        factory: &F,
        writer: &mut Cursor<&mut [u8]>,
    ) -> Result<(), SerializeError<F::Error>>
    where
        F: MessageFactory<Payload = P>,
    {
        if config.num_channels > 1 {
            writer.write_u8(self.channel_index as u8)?;
        }

        let channel_config = &config.channels[self.channel_index];

        match &self.content {
            ChannelPacketContent::Messages(messages) => {
                writer.write_u8(0)?;
                serialize_messages(messages, channel_config.kind, channel_config, factory, writer)
            }
            ChannelPacketContent::BlockFragment(fragment) => {
                writer.write_u8(1)?;
                serialize_fragment(fragment, channel_config, factory, writer)
            }
            ChannelPacketContent::Malformed => {
                unreachable!("malformed entries are a receive-side marker")
            }
        }
    }

    /// Read one channel entry.
    ///
    /// A failed message body in the reliable form produces an
    /// `Ok(Malformed)` entry; the caller must stop reading the packet, since
    /// the stream position after a failed body is meaningless. Every other
    /// failure is an error and invalidates the whole packet.
    pub(crate) fn deserialize<F>(
        config: &ConnectionConfig,
        factory: &F,
        packet_sequence: u16,
        reader: &mut Cursor<&[u8]>,
    ) -> Result<ChannelPacketData<F::Payload>, DeserializeError>
    where
        F: MessageFactory<Payload = P>,
    {
        let channel_index = if config.num_channels > 1 {
            reader.read_u8()? as usize
        } else {
            0
        };
        if channel_index >= config.num_channels {
            return Err(DeserializeError::Malformed("channel index out of range"));
        }

        let channel_config = &config.channels[channel_index];
        let block_message = reader.read_u8()?;

        let content = match block_message {
            0 => deserialize_messages(
                channel_config.kind,
                channel_config,
                factory,
                packet_sequence,
                reader,
            )?,
            1 => {
                if channel_config.kind == ChannelType::UnreliableUnordered {
                    return Err(DeserializeError::Malformed(
                        "block fragment on an unreliable channel",
                    ));
                }
                ChannelPacketContent::BlockFragment(deserialize_fragment(
                    channel_config,
                    factory,
                    reader,
                )?)
            }
            _ => return Err(DeserializeError::Malformed("invalid block message flag")),
        };

        Ok(ChannelPacketData {
            channel_index,
            content,
        })
    }
}

fn serialize_messages<F>(
    messages: &[Rc<Message<F::Payload>>],
    kind: ChannelType,
    config: &crate::config::ChannelConfig,
    factory: &F,
    writer: &mut Cursor<&mut [u8]>,
) -> Result<(), SerializeError<F::Error>>
where
    F: MessageFactory,
{
    let has_messages = !messages.is_empty();
    writer.write_u8(has_messages as u8)?;
    if !has_messages {
        return Ok(());
    }

    debug_assert!(messages.len() <= config.max_messages_per_packet);
    writer.write_u8((messages.len() - 1) as u8)?;

    if kind == ChannelType::ReliableOrdered {
        let mut previous_id = 0;
        for (i, message) in messages.iter().enumerate() {
            if i == 0 {
                writer.write_u16::<LittleEndian>(message.id)?;
            } else {
                write_relative_message_id(writer, previous_id, message.id)?;
            }
            previous_id = message.id;
        }
    }

    for message in messages {
        let message_type = factory.message_type(&message.payload);
        debug_assert!(message_type <= factory.max_message_type());
        writer.write_u16::<LittleEndian>(message_type)?;

        factory
            .serialize(&message.payload, &mut *writer)
            .map_err(SerializeError::Message)?;

        #[cfg(feature = "serialize_check")]
        writer.write_u32::<LittleEndian>(SERIALIZE_CHECK_VALUE)?;

        if kind == ChannelType::UnreliableUnordered && !config.disable_blocks {
            match &message.block {
                Some(block) => {
                    debug_assert!(!block.is_empty() && block.len() <= config.max_block_size);
                    writer.write_u8(1)?;
                    writer.write_u32::<LittleEndian>(block.len() as u32)?;
                    writer.write_all(block)?;
                }
                None => writer.write_u8(0)?,
            }
        }
    }

    Ok(())
}

fn deserialize_messages<F>(
    kind: ChannelType,
    config: &crate::config::ChannelConfig,
    factory: &F,
    packet_sequence: u16,
    reader: &mut Cursor<&[u8]>,
) -> Result<ChannelPacketContent<F::Payload>, DeserializeError>
where
    F: MessageFactory,
{
    if reader.read_u8()? == 0 {
        return Ok(ChannelPacketContent::Messages(Vec::new()));
    }

    let count = reader.read_u8()? as usize + 1;
    if count > config.max_messages_per_packet {
        return Err(DeserializeError::Malformed("message count out of range"));
    }

    let reliable = kind == ChannelType::ReliableOrdered;

    let mut message_ids = Vec::with_capacity(count);
    if reliable {
        let mut previous_id = 0;
        for i in 0..count {
            let id = if i == 0 {
                reader.read_u16::<LittleEndian>()?
            } else {
                read_relative_message_id(reader, previous_id)?
            };
            message_ids.push(id);
            previous_id = id;
        }
    } else {
        message_ids.resize(count, packet_sequence);
    }

    let mut messages = Vec::with_capacity(count);
    for id in message_ids {
        let message_type = reader.read_u16::<LittleEndian>()?;
        if message_type > factory.max_message_type() {
            if reliable {
                log::debug!("unknown message type {}, marking entry malformed", message_type);
                return Ok(ChannelPacketContent::Malformed);
            }
            return Err(DeserializeError::Malformed("unknown message type"));
        }

        let payload = match factory.deserialize(message_type, &mut *reader) {
            Ok(payload) => payload,
            Err(err) => {
                if reliable {
                    log::debug!("message body failed to deserialize: {:?}", err);
                    return Ok(ChannelPacketContent::Malformed);
                }
                log::debug!("unreliable message body failed to deserialize: {:?}", err);
                return Err(DeserializeError::Malformed("message body"));
            }
        };

        #[cfg(feature = "serialize_check")]
        {
            let check_value = reader.read_u32::<LittleEndian>()?;
            assert_eq!(
                check_value, SERIALIZE_CHECK_VALUE,
                "expected check value {:#x} but found {:#x}",
                SERIALIZE_CHECK_VALUE, check_value
            );
        }

        let block = if kind == ChannelType::UnreliableUnordered && !config.disable_blocks {
            if reader.read_u8()? == 1 {
                let block_size = reader.read_u32::<LittleEndian>()? as usize;
                if block_size == 0 || block_size > config.max_block_size {
                    return Err(DeserializeError::Malformed("block size out of range"));
                }
                let mut block = vec![0u8; block_size];
                reader.read_exact(&mut block)?;
                Some(block)
            } else {
                None
            }
        } else {
            None
        };

        messages.push(Rc::new(Message {
            id,
            block,
            payload,
        }));
    }

    Ok(ChannelPacketContent::Messages(messages))
}

fn serialize_fragment<F>(
    fragment: &BlockFragmentData<F::Payload>,
    config: &crate::config::ChannelConfig,
    factory: &F,
    writer: &mut Cursor<&mut [u8]>,
) -> Result<(), SerializeError<F::Error>>
where
    F: MessageFactory,
{
    writer.write_u16::<LittleEndian>(fragment.message_id)?;

    if config.max_fragments_per_block() > 1 {
        writer.write_u16::<LittleEndian>(fragment.num_fragments)?;
    }
    if fragment.num_fragments > 1 {
        writer.write_u16::<LittleEndian>(fragment.fragment_id)?;
    }

    debug_assert!(
        !fragment.fragment_data.is_empty()
            && fragment.fragment_data.len() <= config.block_fragment_size
    );
    writer.write_u16::<LittleEndian>(fragment.fragment_data.len() as u16)?;
    writer.write_all(&fragment.fragment_data)?;

    if fragment.fragment_id == 0 {
        let message = fragment
            .message
            .as_ref()
            .expect("fragment 0 carries the block message");
        let message_type = factory.message_type(&message.payload);
        writer.write_u16::<LittleEndian>(message_type)?;
        factory
            .serialize(&message.payload, &mut *writer)
            .map_err(SerializeError::Message)?;

        #[cfg(feature = "serialize_check")]
        writer.write_u32::<LittleEndian>(SERIALIZE_CHECK_VALUE)?;
    }

    Ok(())
}

fn deserialize_fragment<F>(
    config: &crate::config::ChannelConfig,
    factory: &F,
    reader: &mut Cursor<&[u8]>,
) -> Result<BlockFragmentData<F::Payload>, DeserializeError>
where
    F: MessageFactory,
{
    let message_id = reader.read_u16::<LittleEndian>()?;

    let num_fragments = if config.max_fragments_per_block() > 1 {
        reader.read_u16::<LittleEndian>()?
    } else {
        1
    };
    if num_fragments == 0 || num_fragments as usize > config.max_fragments_per_block() {
        return Err(DeserializeError::Malformed("fragment count out of range"));
    }

    let fragment_id = if num_fragments > 1 {
        reader.read_u16::<LittleEndian>()?
    } else {
        0
    };
    if fragment_id >= num_fragments {
        return Err(DeserializeError::Malformed("fragment id out of range"));
    }

    let fragment_size = reader.read_u16::<LittleEndian>()? as usize;
    if fragment_size == 0 || fragment_size > config.block_fragment_size {
        return Err(DeserializeError::Malformed("fragment size out of range"));
    }
    let mut fragment_data = vec![0u8; fragment_size];
    reader.read_exact(&mut fragment_data)?;

    let message = if fragment_id == 0 {
        let message_type = reader.read_u16::<LittleEndian>()?;
        if message_type > factory.max_message_type() {
            return Err(DeserializeError::Malformed("unknown block message type"));
        }
        let payload = factory
            .deserialize(message_type, &mut *reader)
            .map_err(|err| {
                log::debug!("block message body failed to deserialize: {:?}", err);
                DeserializeError::Malformed("block message body")
            })?;

        #[cfg(feature = "serialize_check")]
        {
            let check_value = reader.read_u32::<LittleEndian>()?;
            assert_eq!(
                check_value, SERIALIZE_CHECK_VALUE,
                "expected check value {:#x} but found {:#x}",
                SERIALIZE_CHECK_VALUE, check_value
            );
        }

        Some(Rc::new(Message {
            id: message_id,
            block: None,
            payload,
        }))
    } else {
        None
    };

    Ok(BlockFragmentData {
        message_id,
        num_fragments,
        fragment_id,
        fragment_data,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, ChannelType, ConnectionConfig, MAX_CHANNELS};

    struct U32Factory;

    impl MessageFactory for U32Factory {
        type Payload = u32;
        type Error = io::Error;

        fn max_message_type(&self) -> u16 {
            0
        }

        fn message_type(&self, _payload: &u32) -> u16 {
            0
        }

        fn serialize<W: Write>(&self, payload: &u32, mut writer: W) -> Result<(), io::Error> {
            writer.write_u32::<LittleEndian>(*payload)
        }

        fn deserialize<R: Read>(&self, _message_type: u16, mut reader: R) -> Result<u32, io::Error> {
            reader.read_u32::<LittleEndian>()
        }
    }

    fn two_channel_config() -> ConnectionConfig {
        let mut channels = [ChannelConfig::new(ChannelType::ReliableOrdered); MAX_CHANNELS];
        channels[1] = ChannelConfig::new(ChannelType::UnreliableUnordered);
        ConnectionConfig {
            num_channels: 2,
            max_packet_size: 8 * 1024,
            channels,
        }
    }

    fn reliable_entry(ids: &[u16]) -> ChannelPacketData<u32> {
        let messages = ids
            .iter()
            .map(|&id| {
                Rc::new(Message {
                    id,
                    block: None,
                    payload: id as u32,
                })
            })
            .collect();
        ChannelPacketData {
            channel_index: 0,
            content: ChannelPacketContent::Messages(messages),
        }
    }

    fn round_trip(
        config: &ConnectionConfig,
        entry: &ChannelPacketData<u32>,
    ) -> ChannelPacketData<u32> {
        let mut buffer = vec![0u8; config.max_packet_size];
        let mut writer = Cursor::new(&mut buffer[..]);
        entry.serialize(config, &U32Factory, &mut writer).unwrap();
        let written = writer.position() as usize;

        let mut reader = Cursor::new(&buffer[..written]);
        ChannelPacketData::<u32>::deserialize(config, &U32Factory, 7, &mut reader).unwrap()
    }

    #[test]
    fn relative_ids_cover_consecutive_gappy_and_wrapped() {
        let config = two_channel_config();
        // Consecutive across the wrap, then a gap over 255 (escape form).
        let entry = reliable_entry(&[65530, 65531, 400, 401]);
        let decoded = round_trip(&config, &entry);

        match decoded.content {
            ChannelPacketContent::Messages(messages) => {
                let ids: Vec<u16> = messages.iter().map(|m| m.id).collect();
                assert_eq!(ids, vec![65530, 65531, 400, 401]);
                assert_eq!(*messages[0].payload(), 65530);
            }
            _ => panic!("expected messages"),
        }
    }

    #[test]
    fn relative_id_costing_matches_encoder() {
        assert_eq!(relative_message_id_bits(10, 11), 8);
        assert_eq!(relative_message_id_bits(10, 265), 8);
        assert_eq!(relative_message_id_bits(10, 266), 24);
        assert_eq!(relative_message_id_bits(65535, 0), 8);
        assert_eq!(relative_message_id_bits(0, 0), 24);
    }

    #[test]
    fn unreliable_messages_take_the_packet_sequence_as_id() {
        let config = two_channel_config();
        let messages = vec![
            Rc::new(Message {
                id: 0,
                block: None,
                payload: 1u32,
            }),
            Rc::new(Message {
                id: 0,
                block: Some(vec![9, 9, 9]),
                payload: 2u32,
            }),
        ];
        let entry = ChannelPacketData {
            channel_index: 1,
            content: ChannelPacketContent::Messages(messages),
        };
        let decoded = round_trip(&config, &entry);

        assert_eq!(decoded.channel_index, 1);
        match decoded.content {
            ChannelPacketContent::Messages(messages) => {
                assert!(messages.iter().all(|m| m.id == 7));
                assert_eq!(messages[1].block(), Some(&[9u8, 9, 9][..]));
            }
            _ => panic!("expected messages"),
        }
    }

    #[test]
    fn reliable_body_failure_yields_malformed_entry() {
        let config = two_channel_config();
        let entry = reliable_entry(&[3]);

        let mut buffer = vec![0u8; 256];
        let mut writer = Cursor::new(&mut buffer[..]);
        entry.serialize(&config, &U32Factory, &mut writer).unwrap();
        let written = writer.position() as usize;

        // Truncate inside the message body: the entry is marked malformed
        // instead of failing the packet.
        let mut reader = Cursor::new(&buffer[..written - 2]);
        let decoded =
            ChannelPacketData::<u32>::deserialize(&config, &U32Factory, 0, &mut reader).unwrap();
        assert!(matches!(decoded.content, ChannelPacketContent::Malformed));
    }

    #[test]
    fn fragment_round_trip_and_validation() {
        let config = two_channel_config();
        let fragment = BlockFragmentData {
            message_id: 42,
            num_fragments: 3,
            fragment_id: 0,
            fragment_data: vec![0xAB; config.channels[0].block_fragment_size],
            message: Some(Rc::new(Message {
                id: 42,
                block: None,
                payload: 9u32,
            })),
        };
        let entry = ChannelPacketData {
            channel_index: 0,
            content: ChannelPacketContent::BlockFragment(fragment),
        };
        let decoded = round_trip(&config, &entry);

        match decoded.content {
            ChannelPacketContent::BlockFragment(fragment) => {
                assert_eq!(fragment.message_id, 42);
                assert_eq!(fragment.num_fragments, 3);
                assert_eq!(fragment.fragment_id, 0);
                assert_eq!(fragment.fragment_data.len(), 1024);
                assert_eq!(*fragment.message.unwrap().payload(), 9);
            }
            _ => panic!("expected block fragment"),
        }
    }

    #[test]
    fn fragment_header_errors_fail_the_packet() {
        let config = two_channel_config();

        // channel 0, block flag, message id 1, num_fragments way out of range
        let mut buffer = Vec::new();
        buffer.write_u8(0).unwrap();
        buffer.write_u8(1).unwrap();
        buffer.write_u16::<LittleEndian>(1).unwrap();
        buffer.write_u16::<LittleEndian>(60000).unwrap();

        let mut reader = Cursor::new(&buffer[..]);
        let result = ChannelPacketData::<u32>::deserialize(&config, &U32Factory, 0, &mut reader);
        assert!(matches!(result, Err(DeserializeError::Malformed(_))));
    }

    #[test]
    fn fragment_on_unreliable_channel_fails_the_packet() {
        let config = two_channel_config();
        let mut buffer = Vec::new();
        buffer.write_u8(1).unwrap(); // unreliable channel index
        buffer.write_u8(1).unwrap(); // block flag

        let mut reader = Cursor::new(&buffer[..]);
        let result = ChannelPacketData::<u32>::deserialize(&config, &U32Factory, 0, &mut reader);
        assert!(matches!(result, Err(DeserializeError::Malformed(_))));
    }
}
