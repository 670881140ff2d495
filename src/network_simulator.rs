use std::collections::VecDeque;

use rand::{rngs::StdRng, Rng, SeedableRng};

/// Simulates latency, jitter, packet loss and duplicate packets on top of an
/// in-memory packet exchange.
///
/// Packets are addressed by a destination index so one simulator can sit
/// between any number of endpoints.
pub struct NetworkSimulator {
    latency: f32,
    jitter: f32,
    packet_loss: f32,
    duplicates: f32,
    active: bool,
    time: f64,
    rng: StdRng,
    max_packets: usize,
    entries: VecDeque<PacketEntry>,
}

struct PacketEntry {
    to: usize,
    delivery_time: f64,
    packet_data: Vec<u8>,
}

impl NetworkSimulator {
    /// Create an inactive simulator that can hold up to `max_packets` in
    /// flight. Additional packets are dropped.
    pub fn new(max_packets: usize, time: f64) -> NetworkSimulator {
        NetworkSimulator::with_seed(max_packets, time, 0)
    }

    /// Create a simulator whose loss, jitter and duplicate decisions replay
    /// deterministically for a given seed.
    pub fn with_seed(max_packets: usize, time: f64, seed: u64) -> NetworkSimulator {
        NetworkSimulator {
            latency: 0.0,
            jitter: 0.0,
            packet_loss: 0.0,
            duplicates: 0.0,
            active: false,
            time,
            rng: StdRng::seed_from_u64(seed),
            max_packets,
            entries: VecDeque::with_capacity(max_packets),
        }
    }

    /// Set the latency in milliseconds.
    ///
    /// Latency is added on packet send. To simulate a round trip time of
    /// 100ms, add 50ms of latency to both sides of the connection.
    pub fn set_latency(&mut self, milliseconds: f32) {
        self.latency = milliseconds;
        self.update_active();
    }

    /// Set the packet jitter in milliseconds.
    ///
    /// Jitter is applied +/- this amount in milliseconds. To be truly
    /// effective, jitter must be applied together with some latency.
    pub fn set_jitter(&mut self, milliseconds: f32) {
        self.jitter = milliseconds;
        self.update_active();
    }

    /// Set the amount of packet loss to apply on send, as a percent.
    ///
    /// 0% = no packet loss, 100% = all packets are dropped.
    pub fn set_packet_loss(&mut self, percent: f32) {
        self.packet_loss = percent;
        self.update_active();
    }

    /// Set the percentage chance of packet duplicates.
    ///
    /// If the duplicate chance succeeds, a duplicate packet is added to the
    /// queue with a random delay of up to 1 second.
    ///
    /// 0% = no duplicate packets, 100% = all packets have a duplicate sent.
    pub fn set_duplicates(&mut self, percent: f32) {
        self.duplicates = percent;
        self.update_active();
    }

    /// Returns true if any simulated impairment is configured.
    pub fn active(&self) -> bool {
        self.active
    }

    /// Called after the `set_{property}` methods so that sends don't have to
    /// check each field.
    fn update_active(&mut self) {
        self.active = self.latency != 0.0
            || self.jitter != 0.0
            || self.packet_loss != 0.0
            || self.duplicates != 0.0;
    }

    pub fn advance_time(&mut self, time: f64) {
        self.time = time;
    }

    /// Queue a packet for delivery to endpoint `to`.
    pub fn send_packet(&mut self, to: usize, packet_data: &[u8]) {
        if self.packet_loss > 0.0 && self.rng.gen::<f32>() * 100.0 < self.packet_loss {
            return;
        }

        let delivery_time = self.time + self.delay();
        self.queue_packet(to, delivery_time, packet_data.to_vec());

        if self.duplicates > 0.0 && self.rng.gen::<f32>() * 100.0 < self.duplicates {
            let duplicate_delivery_time = delivery_time + self.rng.gen_range(0.0..1.0);
            self.queue_packet(to, duplicate_delivery_time, packet_data.to_vec());
        }
    }

    /// Take all packets for endpoint `to` whose delivery time has come.
    ///
    /// Jitter makes packets come due out of send order, so receivers see
    /// reordering as well as delay.
    pub fn receive_packets(&mut self, to: usize) -> Vec<Vec<u8>> {
        let mut delivered = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            let entry = &self.entries[index];
            if entry.to == to && entry.delivery_time <= self.time {
                let entry = self
                    .entries
                    .remove(index)
                    .expect("index is in bounds");
                delivered.push(entry.packet_data);
            } else {
                index += 1;
            }
        }
        delivered
    }

    /// Discard every packet in flight, e.g. before reusing the simulator.
    pub fn discard_packets(&mut self) {
        self.entries.clear();
    }

    fn delay(&mut self) -> f64 {
        let mut delay = self.latency as f64 / 1000.0;
        if self.jitter > 0.0 {
            delay += self.rng.gen_range(-self.jitter..=self.jitter) as f64 / 1000.0;
        }
        delay.max(0.0)
    }

    fn queue_packet(&mut self, to: usize, delivery_time: f64, packet_data: Vec<u8>) {
        if self.entries.len() >= self.max_packets {
            log::warn!("network simulator is full, dropping packet");
            return;
        }
        self.entries.push_back(PacketEntry {
            to,
            delivery_time,
            packet_data,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::NetworkSimulator;

    #[test]
    fn sets_active() {
        let mut n;
        n = NetworkSimulator::new(100, 100.0);
        assert!(!n.active());

        n.set_latency(0.0);
        n.set_jitter(0.0);
        n.set_packet_loss(0.0);
        n.set_duplicates(0.0);

        assert!(!n.active());

        n = NetworkSimulator::new(100, 100.0);
        assert!(!n.active());
        n.set_latency(32.0);
        assert!(n.active());

        n = NetworkSimulator::new(100, 100.0);
        assert!(!n.active());
        n.set_jitter(7.0);
        assert!(n.active());

        n = NetworkSimulator::new(100, 100.0);
        assert!(!n.active());
        n.set_packet_loss(0.5);
        assert!(n.active());

        n = NetworkSimulator::new(100, 100.0);
        assert!(!n.active());
        n.set_duplicates(0.5);
        assert!(n.active());
    }

    #[test]
    fn delivers_after_latency() {
        let mut n = NetworkSimulator::new(100, 100.0);
        n.set_latency(50.0);

        n.send_packet(0, &[1, 2, 3]);
        assert!(n.receive_packets(0).is_empty());

        n.advance_time(100.04);
        assert!(n.receive_packets(0).is_empty());

        n.advance_time(100.06);
        let packets = n.receive_packets(0);
        assert_eq!(packets, vec![vec![1, 2, 3]]);
        assert!(n.receive_packets(0).is_empty());
    }

    #[test]
    fn destinations_are_independent() {
        let mut n = NetworkSimulator::new(100, 100.0);
        n.send_packet(0, &[0]);
        n.send_packet(1, &[1]);

        assert_eq!(n.receive_packets(1), vec![vec![1]]);
        assert_eq!(n.receive_packets(0), vec![vec![0]]);
    }

    #[test]
    fn total_loss_drops_everything() {
        let mut n = NetworkSimulator::new(100, 100.0);
        n.set_packet_loss(100.0);
        for _ in 0..32 {
            n.send_packet(0, &[7]);
        }
        n.advance_time(200.0);
        assert!(n.receive_packets(0).is_empty());
    }

    #[test]
    fn bounded_in_flight_packets() {
        let mut n = NetworkSimulator::new(2, 100.0);
        n.set_latency(1000.0);
        for _ in 0..5 {
            n.send_packet(0, &[7]);
        }
        n.advance_time(200.0);
        assert_eq!(n.receive_packets(0).len(), 2);
    }
}
