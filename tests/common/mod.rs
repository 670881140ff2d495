use std::collections::HashSet;
use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use netchan::{Connection, MessageFactory, NetworkSimulator};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestPayload {
    Value(u64),
    State { x: i32, y: i32, facing: i8 },
}

pub struct TestMessageFactory;

impl MessageFactory for TestMessageFactory {
    type Payload = TestPayload;
    type Error = bincode::Error;

    fn max_message_type(&self) -> u16 {
        1
    }

    fn message_type(&self, payload: &TestPayload) -> u16 {
        match payload {
            TestPayload::Value(_) => 0,
            TestPayload::State { .. } => 1,
        }
    }

    fn serialize<W: Write>(&self, payload: &TestPayload, writer: W) -> bincode::Result<()> {
        match payload {
            TestPayload::Value(value) => bincode::serialize_into(writer, value),
            TestPayload::State { x, y, facing } => {
                bincode::serialize_into(writer, &(*x, *y, *facing))
            }
        }
    }

    fn deserialize<R: Read>(&self, message_type: u16, reader: R) -> bincode::Result<TestPayload> {
        match message_type {
            0 => Ok(TestPayload::Value(bincode::deserialize_from(reader)?)),
            1 => {
                let (x, y, facing) = bincode::deserialize_from(reader)?;
                Ok(TestPayload::State { x, y, facing })
            }
            _ => Err(bincode::ErrorKind::Custom("unknown message type".into()).into()),
        }
    }
}

/// Plays the packet endpoint for a pair of connections: assigns packet
/// sequence numbers, frames packets with them, pushes them through a
/// [`NetworkSimulator`], discards duplicate deliveries, and reports delivered
/// sequences back to the sender as acks.
pub struct SimulatedLink {
    pub simulator: NetworkSimulator,
    next_sequence: [u16; 2],
    received_sequences: [HashSet<u16>; 2],
    pending_acks: [Vec<u16>; 2],
    buffer: Vec<u8>,
}

impl SimulatedLink {
    pub fn new(seed: u64, time: f64) -> SimulatedLink {
        SimulatedLink::with_start_sequence(seed, time, 0)
    }

    /// Start packet sequence numbers near a chosen value, e.g. just below the
    /// 16-bit wrap.
    pub fn with_start_sequence(seed: u64, time: f64, start_sequence: u16) -> SimulatedLink {
        SimulatedLink {
            simulator: NetworkSimulator::with_seed(4096, time, seed),
            next_sequence: [start_sequence; 2],
            received_sequences: [HashSet::new(), HashSet::new()],
            pending_acks: [Vec::new(), Vec::new()],
            buffer: vec![0u8; 16 * 1024],
        }
    }

    /// One tick: generate a packet from each side, deliver whatever the
    /// simulator has ready, feed acks back, and advance time everywhere.
    pub fn pump(
        &mut self,
        time: f64,
        a: &mut Connection<TestMessageFactory>,
        b: &mut Connection<TestMessageFactory>,
    ) {
        self.send_from(0, a);
        self.send_from(1, b);

        self.simulator.advance_time(time);

        self.deliver_to(0, a);
        self.deliver_to(1, b);

        let acks = std::mem::take(&mut self.pending_acks[0]);
        a.process_acks(&acks);
        let acks = std::mem::take(&mut self.pending_acks[1]);
        b.process_acks(&acks);

        a.advance_time(time);
        b.advance_time(time);
    }

    fn send_from(&mut self, side: usize, connection: &mut Connection<TestMessageFactory>) {
        let max_packet_size = connection.config().max_packet_size;
        let bytes = connection.generate_packet(
            self.next_sequence[side],
            &mut self.buffer[..max_packet_size],
        );
        if bytes == 0 {
            return;
        }

        let sequence = self.next_sequence[side];
        self.next_sequence[side] = sequence.wrapping_add(1);

        let mut framed = vec![0u8; bytes + 2];
        LittleEndian::write_u16(&mut framed[..2], sequence);
        framed[2..].copy_from_slice(&self.buffer[..bytes]);
        self.simulator.send_packet(1 - side, &framed);
    }

    fn deliver_to(&mut self, side: usize, connection: &mut Connection<TestMessageFactory>) {
        for packet in self.simulator.receive_packets(side) {
            if packet.len() < 2 {
                continue;
            }
            let sequence = LittleEndian::read_u16(&packet[..2]);

            // A real endpoint discards packet sequences it has already seen,
            // so duplicated packets never reach the connection twice.
            if !self.received_sequences[side].insert(sequence) {
                continue;
            }

            if connection.process_packet(sequence, &packet[2..]) {
                self.pending_acks[1 - side].push(sequence);
            }
        }
    }
}
