//! Message channels over unreliable datagrams, for real-time multiplayer
//! games.
//!
//! A [`Connection`] multiplexes independent message channels over a lossy,
//! unordered packet exchange. Reliable-ordered channels retransmit until
//! packet-level acks confirm delivery and hand messages to the application in
//! send order, exactly once; unreliable-unordered channels pack whatever fits
//! and drop the rest. Messages can carry blocks of bytes larger than a packet,
//! which reliable channels fragment and reassemble.
//!
//! The crate deliberately stops at the packet boundary: an external endpoint
//! owns sockets, packet sequence numbers, and ack detection, and drives the
//! connection through [`Connection::generate_packet`],
//! [`Connection::process_packet`], [`Connection::process_acks`] and
//! [`Connection::advance_time`].

pub mod config;
pub mod connection;
pub mod message;
pub mod network_simulator;

mod channel;

pub use channel::{ChannelCounters, ChannelErrorLevel};
pub use config::{ChannelConfig, ChannelType, ConnectionConfig, MAX_CHANNELS};
pub use connection::{Connection, ConnectionErrorLevel};
pub use message::{Message, MessageFactory};
pub use network_simulator::NetworkSimulator;
