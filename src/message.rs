use std::{
    fmt::Debug,
    io::{self, Read, Write},
};

/// Creates and serializes application message payloads.
///
/// The factory is the only place the core learns anything about payloads: it
/// maps each payload to a numeric type tag, writes payload bodies on
/// serialize, and reconstructs them from a type tag on deserialize. Both
/// endpoints of a connection must use an identical factory or they will
/// desync.
pub trait MessageFactory {
    /// Application-defined payload carried by [`Message`].
    type Payload;
    type Error: Debug;

    /// Largest type tag [`MessageFactory::message_type`] can return.
    fn max_message_type(&self) -> u16;

    /// The type tag for a payload, in `[0, max_message_type]`.
    fn message_type(&self, payload: &Self::Payload) -> u16;

    fn serialize<W: Write>(&self, payload: &Self::Payload, writer: W)
        -> Result<(), Self::Error>;

    /// Reconstruct a payload of the given type from the wire.
    fn deserialize<R: Read>(&self, message_type: u16, reader: R)
        -> Result<Self::Payload, Self::Error>;
}

/// A message travelling over a connection channel.
///
/// Wraps an application payload with the header the core manages: the message
/// id (assigned by the reliable channel on send, or set to the packet
/// sequence on unreliable receive) and an optional block of bytes that may be
/// larger than a single packet.
pub struct Message<P> {
    pub(crate) id: u16,
    pub(crate) block: Option<Vec<u8>>,
    pub(crate) payload: P,
}

impl<P> Message<P> {
    pub fn new(payload: P) -> Message<P> {
        Message {
            id: 0,
            block: None,
            payload,
        }
    }

    /// Create a message carrying a block of bytes.
    ///
    /// The block length must not exceed the channel's `max_block_size`.
    pub fn with_block(payload: P, block: Vec<u8>) -> Message<P> {
        Message {
            id: 0,
            block: Some(block),
            payload,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }

    pub fn block(&self) -> Option<&[u8]> {
        self.block.as_deref()
    }

    /// Take ownership of the attached block, if any.
    pub fn take_block(&mut self) -> Option<Vec<u8>> {
        self.block.take()
    }

    pub fn has_block(&self) -> bool {
        self.block.is_some()
    }
}

/// A writer that discards its input and counts how much was written.
///
/// Stands in for the real packet writer when pre-sizing messages for packet
/// budgeting.
pub(crate) struct MeasureWriter {
    pub(crate) bytes: usize,
}

impl MeasureWriter {
    pub(crate) fn new() -> MeasureWriter {
        MeasureWriter { bytes: 0 }
    }

    pub(crate) fn bits(&self) -> usize {
        self.bytes * 8
    }
}

impl io::Write for MeasureWriter {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes += buf.len();
        Ok(buf.len())
    }

    #[inline]
    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        let total_len = bufs.iter().map(|b| b.len()).sum();
        self.bytes += total_len;
        Ok(total_len)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Serialize a payload into a counting stream and report its size in bits.
pub(crate) fn measure_payload<F: MessageFactory>(
    factory: &F,
    payload: &F::Payload,
) -> Result<usize, F::Error> {
    let mut writer = MeasureWriter::new();
    factory.serialize(payload, &mut writer)?;
    Ok(writer.bits())
}
