mod common;

use common::{init_logging, SimulatedLink, TestMessageFactory, TestPayload};
use netchan::{Connection, ConnectionConfig, Message};

const TICK: f64 = 1.0 / 60.0;

/// Drive both connections until `done` reports success or the simulated
/// deadline passes.
fn run_until(
    link: &mut SimulatedLink,
    sender: &mut Connection<TestMessageFactory>,
    receiver: &mut Connection<TestMessageFactory>,
    time: &mut f64,
    deadline_seconds: f64,
    mut done: impl FnMut(&mut Connection<TestMessageFactory>) -> bool,
) -> bool {
    let deadline = *time + deadline_seconds;
    while *time < deadline {
        *time += TICK;
        link.pump(*time, sender, receiver);
        if done(receiver) {
            return true;
        }
    }
    false
}

#[test]
fn lossy_reliable_burst_delivers_everything_in_order() {
    init_logging();

    let mut time = 100.0;
    let mut sender = Connection::new(TestMessageFactory, ConnectionConfig::default(), time);
    let mut receiver = Connection::new(TestMessageFactory, ConnectionConfig::default(), time);

    let mut link = SimulatedLink::new(42, time);
    link.simulator.set_packet_loss(50.0);
    link.simulator.set_latency(30.0);
    link.simulator.set_jitter(20.0);

    for value in 0..1000u64 {
        sender.send_message(0, Message::new(TestPayload::Value(value)));
    }

    let mut delivered: Vec<u64> = Vec::new();
    let finished = run_until(
        &mut link,
        &mut sender,
        &mut receiver,
        &mut time,
        30.0,
        |receiver| {
            while let Some(message) = receiver.receive_message(0) {
                match message.payload() {
                    TestPayload::Value(value) => delivered.push(*value),
                    other => panic!("unexpected payload {:?}", other),
                }
            }
            delivered.len() == 1000
        },
    );

    assert!(finished, "only {} of 1000 messages arrived", delivered.len());
    let expected: Vec<u64> = (0..1000).collect();
    assert_eq!(delivered, expected);

    // Let the last acks drain so the sender's window closes completely.
    for _ in 0..120 {
        time += TICK;
        link.pump(time, &mut sender, &mut receiver);
    }
    assert!(!sender.has_messages_to_send(0));
    assert!(sender.can_send_message(0));
}

#[test]
fn block_survives_heavy_loss_intact() {
    init_logging();

    let mut config = ConnectionConfig::default();
    config.channels[0].max_block_size = 10_000;
    config.channels[0].block_fragment_size = 1024;

    let mut time = 100.0;
    let mut sender = Connection::new(TestMessageFactory, config.clone(), time);
    let mut receiver = Connection::new(TestMessageFactory, config, time);

    let mut link = SimulatedLink::new(7, time);
    link.simulator.set_packet_loss(25.0);
    link.simulator.set_latency(20.0);

    let block: Vec<u8> = (0..10_000u32).map(|i| ((i * 33 + 1) % 256) as u8).collect();
    sender.send_message(
        0,
        Message::with_block(TestPayload::Value(0), block.clone()),
    );

    let mut received = None;
    let finished = run_until(
        &mut link,
        &mut sender,
        &mut receiver,
        &mut time,
        30.0,
        |receiver| {
            if let Some(message) = receiver.receive_message(0) {
                received = Some(message);
            }
            received.is_some()
        },
    );
    assert!(finished, "block never completed");

    let message = received.unwrap();
    assert_eq!(message.id(), 0);
    assert_eq!(message.block(), Some(&block[..]));

    for _ in 0..240 {
        time += TICK;
        link.pump(time, &mut sender, &mut receiver);
    }
    assert!(!sender.has_messages_to_send(0));
}

#[test]
fn packet_sequence_wraparound_is_transparent() {
    init_logging();

    let mut time = 100.0;
    let mut sender = Connection::new(TestMessageFactory, ConnectionConfig::default(), time);
    let mut receiver = Connection::new(TestMessageFactory, ConnectionConfig::default(), time);

    // Packet sequences cross 65535 -> 0 partway through the run.
    let mut link = SimulatedLink::with_start_sequence(11, time, 65500);
    link.simulator.set_packet_loss(20.0);
    link.simulator.set_latency(10.0);

    for value in 0..200u64 {
        sender.send_message(0, Message::new(TestPayload::Value(value)));
    }

    let mut delivered: Vec<u64> = Vec::new();
    let finished = run_until(
        &mut link,
        &mut sender,
        &mut receiver,
        &mut time,
        20.0,
        |receiver| {
            while let Some(message) = receiver.receive_message(0) {
                match message.payload() {
                    TestPayload::Value(value) => delivered.push(*value),
                    other => panic!("unexpected payload {:?}", other),
                }
            }
            delivered.len() == 200
        },
    );

    assert!(finished, "only {} of 200 messages arrived", delivered.len());
    let expected: Vec<u64> = (0..200).collect();
    assert_eq!(delivered, expected);
}
