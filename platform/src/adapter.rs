// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Inter-PE network adapter: dimension-ordered routing over a 2-D mesh or
//! torus, with two dispatch paths.
//!
//! In packet mode spikes are wrapped into [`NetworkRequest`]s and pushed
//! through a [`PacketNetwork`] (the wire-level router is outside the model);
//! refused sends wait on a bounded retry queue drained by the
//! space-available callback. In direction-link mode the wrapped spike is
//! handed to the per-direction point-to-point link, which the fabric drains
//! every cycle.

use crate::spike::{Spike, WIRE_BYTES};
use crate::topology::{Direction, TopologyHandler};
use log::{trace, warn};
use std::collections::{HashMap, VecDeque};

/// Capacity of the retry queue for spikes refused by the packet interface.
pub const PENDING_SPIKE_DEPTH: usize = 64;
/// Capacity of each direction link's egress queue.
const EGRESS_DEPTH: usize = 256;
/// Estimated cycles per fabric hop, seeding the latency average.
const CYCLES_PER_HOP: u64 = 10;
/// Port utilization above this fraction counts as a congestion event.
const CONGESTION_THRESHOLD: f64 = 0.8;

/// A `SimpleNetwork`-style packet: head == tail == true, one spike payload.
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkRequest {
    pub src: u32,
    pub dest: u32,
    pub vn: u32,
    pub size_in_bits: usize,
    pub head: bool,
    pub tail: bool,
    pub payload: Vec<u8>,
}

impl NetworkRequest {
    pub fn for_spike(spike: &Spike, src: u32) -> Self {
        Self {
            src,
            dest: spike.dst_node,
            vn: 0,
            size_in_bits: WIRE_BYTES * 8,
            head: true,
            tail: true,
            payload: spike.encode().to_vec(),
        }
    }
}

/// The underlying wire-level network, modeled only by its flow control.
pub trait PacketNetwork {
    fn space_to_send(&self, vn: u32, size_in_bits: usize) -> bool;
    /// `false` means the request was refused and stays with the caller.
    fn send(&mut self, request: NetworkRequest, vn: u32) -> bool;
    fn recv(&mut self, vn: u32) -> Option<NetworkRequest>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AdapterStatistics {
    pub spikes_routed: u64,
    pub local_spikes: u64,
    pub remote_spikes: u64,
    pub xy_routes: u64,
    pub adaptive_routes: u64,
    pub congestion_events: u64,
    pub total_hops: u64,
    pub max_hops: u64,
    pub avg_latency_cycles: u64,
    pub bandwidth_bytes: u64,
    pub packets_dropped: u64,
}

pub struct NetworkAdapter {
    topology: TopologyHandler,
    packet_network: Option<Box<dyn PacketNetwork>>,
    pending: VecDeque<Spike>,
    egress: VecDeque<(Direction, NetworkRequest)>,
    port_counters: HashMap<Direction, u64>,
    stats: AdapterStatistics,
}

impl NetworkAdapter {
    /// Direction-link mode: routed requests queue per direction for the
    /// fabric to move.
    pub fn new(topology: TopologyHandler) -> Self {
        Self {
            topology,
            packet_network: None,
            pending: VecDeque::new(),
            egress: VecDeque::new(),
            port_counters: HashMap::new(),
            stats: AdapterStatistics::default(),
        }
    }

    /// Packet mode: routed requests go through the given network interface.
    pub fn with_packet_network(
        topology: TopologyHandler,
        network: Box<dyn PacketNetwork>,
    ) -> Self {
        let mut adapter = Self::new(topology);
        adapter.packet_network = Some(network);
        adapter
    }

    pub fn node_id(&self) -> u32 {
        self.topology.node_id()
    }

    pub fn topology(&self) -> &TopologyHandler {
        &self.topology
    }

    pub fn stats(&self) -> AdapterStatistics {
        self.stats
    }

    pub fn status(&self) -> String {
        format!(
            "NetworkAdapter[{}] - Routed: {}, Local: {}, Remote: {}, Topology: {}",
            self.node_id(),
            self.stats.spikes_routed,
            self.stats.local_spikes,
            self.stats.remote_spikes,
            self.topology.description()
        )
    }

    /// Route one spike. A spike addressed to this node comes straight back
    /// to the caller; everything else is dispatched toward its destination.
    pub fn send_spike(&mut self, spike: Spike) -> Option<Spike> {
        self.stats.spikes_routed += 1;
        if spike.dst_node == self.node_id() {
            self.stats.local_spikes += 1;
            return Some(spike);
        }
        self.stats.remote_spikes += 1;

        let direction = self.topology.route(spike.dst_node);
        if direction == Direction::Local {
            // Remote node id mapping onto our own coordinates means the
            // destination is outside the fabric.
            warn!(
                "adapter {}: no route to node {}, packet dropped",
                self.node_id(),
                spike.dst_node
            );
            self.stats.packets_dropped += 1;
            return None;
        }

        let hops = self.topology.hops(spike.dst_node) as u64;
        self.stats.total_hops += hops;
        self.stats.max_hops = self.stats.max_hops.max(hops);
        self.stats.avg_latency_cycles =
            (self.stats.avg_latency_cycles + hops * CYCLES_PER_HOP) / 2;
        self.stats.bandwidth_bytes += WIRE_BYTES as u64;
        self.stats.xy_routes += 1;
        self.note_port_load(direction);

        trace!(
            "adapter {}: spike for node {} via {:?} ({} hops)",
            self.node_id(),
            spike.dst_node,
            direction,
            hops
        );

        if self.packet_network.is_some() {
            self.send_packet(spike);
        } else {
            let request = NetworkRequest::for_spike(&spike, self.node_id());
            if self.egress.len() < EGRESS_DEPTH {
                self.egress.push_back((direction, request));
            } else {
                self.stats.packets_dropped += 1;
            }
        }
        None
    }

    fn send_packet(&mut self, spike: Spike) {
        let request = NetworkRequest::for_spike(&spike, self.node_id());
        let network = self.packet_network.as_mut().expect("packet mode");
        let sent = network.space_to_send(0, request.size_in_bits) && network.send(request, 0);
        if sent {
            return;
        }
        // No space downstream: park the spike for the space-available
        // callback, or drop when the retry queue itself is full.
        if self.pending.len() < PENDING_SPIKE_DEPTH {
            self.pending.push_back(spike);
        } else {
            warn!(
                "adapter {}: retry queue full, spike for node {} dropped",
                self.node_id(),
                spike.dst_node
            );
            self.stats.packets_dropped += 1;
        }
    }

    /// Space-available callback from the packet interface: drain the retry
    /// queue while the interface accepts traffic.
    pub fn space_available(&mut self) {
        while let Some(&spike) = self.pending.front() {
            let request = NetworkRequest::for_spike(&spike, self.node_id());
            let network = match self.packet_network.as_mut() {
                Some(network) => network,
                None => return,
            };
            if !(network.space_to_send(0, request.size_in_bits) && network.send(request, 0)) {
                return;
            }
            self.pending.pop_front();
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Unwrap an arriving request into a spike, charging one hop. Malformed
    /// payloads are dropped and counted.
    pub fn handle_request(&mut self, request: NetworkRequest) -> Option<Spike> {
        match Spike::decode(&request.payload) {
            Ok(mut spike) => {
                spike.hop_count += 1;
                trace!(
                    "adapter {}: received spike {} -> {} (hop {})",
                    self.node_id(),
                    spike.src_neuron,
                    spike.dst_neuron,
                    spike.hop_count
                );
                Some(spike)
            }
            Err(error) => {
                warn!("adapter {}: {}", self.node_id(), error);
                self.stats.packets_dropped += 1;
                None
            }
        }
    }

    /// Pull every spike the packet interface has delivered.
    pub fn poll_received(&mut self) -> Vec<Spike> {
        let mut received = Vec::new();
        loop {
            let request = match self.packet_network.as_mut() {
                Some(network) => network.recv(0),
                None => None,
            };
            match request {
                Some(request) => {
                    if let Some(spike) = self.handle_request(request) {
                        received.push(spike);
                    }
                }
                None => break,
            }
        }
        received
    }

    /// Drain the per-direction egress queues (direction-link mode).
    pub fn take_egress(&mut self) -> Vec<(Direction, NetworkRequest)> {
        self.egress.drain(..).collect()
    }

    fn note_port_load(&mut self, direction: Direction) {
        let counter = self.port_counters.entry(direction).or_insert(0);
        *counter += 1;
        if *counter % 100 == 0 {
            let utilization = (*counter as f64 / 1000.0).min(1.0);
            if utilization > CONGESTION_THRESHOLD {
                self.stats.congestion_events += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TopologyConfiguration, TopologyType};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    fn topology(node: u32) -> TopologyHandler {
        let config = TopologyConfiguration {
            topology_type: TopologyType::Mesh2d,
            topology_shape: "4x4".to_string(),
        };
        TopologyHandler::new(&config, node).unwrap()
    }

    /// Packet interface with a fixed buffer, shared with the test body.
    #[derive(Default)]
    struct MockNetworkInner {
        capacity: usize,
        queue: VecDeque<NetworkRequest>,
    }

    struct MockNetwork(Rc<RefCell<MockNetworkInner>>);

    impl PacketNetwork for MockNetwork {
        fn space_to_send(&self, _vn: u32, _size_in_bits: usize) -> bool {
            let inner = self.0.borrow();
            inner.queue.len() < inner.capacity
        }
        fn send(&mut self, request: NetworkRequest, _vn: u32) -> bool {
            let mut inner = self.0.borrow_mut();
            if inner.queue.len() < inner.capacity {
                inner.queue.push_back(request);
                true
            } else {
                false
            }
        }
        fn recv(&mut self, _vn: u32) -> Option<NetworkRequest> {
            self.0.borrow_mut().queue.pop_front()
        }
    }

    fn packet_adapter(node: u32, capacity: usize) -> (NetworkAdapter, Rc<RefCell<MockNetworkInner>>) {
        let inner = Rc::new(RefCell::new(MockNetworkInner {
            capacity,
            queue: VecDeque::new(),
        }));
        let adapter = NetworkAdapter::with_packet_network(
            topology(node),
            Box::new(MockNetwork(Rc::clone(&inner))),
        );
        (adapter, inner)
    }

    #[test]
    fn local_spike_bounces_back() {
        let mut adapter = NetworkAdapter::new(topology(5));
        let spike = Spike::new(1, 2, 5, 0.5, 0);
        assert_eq!(adapter.send_spike(spike), Some(spike));
        assert_eq!(adapter.stats().local_spikes, 1);
        assert_eq!(adapter.stats().remote_spikes, 0);
    }

    #[test]
    fn remote_spike_routes_by_direction() {
        let mut adapter = NetworkAdapter::new(topology(5));
        assert!(adapter.send_spike(Spike::new(0, 0, 6, 0.5, 0)).is_none());
        assert!(adapter.send_spike(Spike::new(0, 0, 1, 0.5, 0)).is_none());
        let egress = adapter.take_egress();
        assert_eq!(egress.len(), 2);
        assert_eq!(egress[0].0, Direction::East);
        assert_eq!(egress[1].0, Direction::South);
        assert_eq!(egress[0].1.dest, 6);
        assert_eq!(egress[0].1.src, 5);
        assert_eq!(egress[0].1.size_in_bits, WIRE_BYTES * 8);
        assert!(egress[0].1.head && egress[0].1.tail);
        let stats = adapter.stats();
        assert_eq!(stats.remote_spikes, 2);
        assert_eq!(stats.total_hops, 2);
        assert_eq!(stats.max_hops, 1);
        assert!(stats.avg_latency_cycles > 0);
        assert_eq!(stats.bandwidth_bytes, 2 * WIRE_BYTES as u64);
    }

    #[test]
    fn packet_mode_sends_and_receives() {
        let (mut adapter, inner) = packet_adapter(0, 4);
        let spike = Spike::new(3, 40, 3, 0.25, 7);
        adapter.send_spike(spike);
        assert_eq!(inner.borrow().queue.len(), 1);

        // Round-trip through the wire: one hop is charged.
        let request = inner.borrow_mut().queue.pop_front().unwrap();
        let mut receiver = NetworkAdapter::new(topology(3));
        let received = receiver.handle_request(request).unwrap();
        assert_eq!(received.hop_count, spike.hop_count + 1);
        assert_eq!(received.dst_neuron, 40);
    }

    #[test]
    fn refused_sends_wait_then_drain() {
        let (mut adapter, inner) = packet_adapter(0, 2);
        for i in 0..5 {
            adapter.send_spike(Spike::new(i, 0, 15, 0.1, 0));
        }
        // Two went out, three wait for space.
        assert_eq!(inner.borrow().queue.len(), 2);
        assert_eq!(adapter.pending_len(), 3);
        assert_eq!(adapter.stats().packets_dropped, 0);

        inner.borrow_mut().queue.clear();
        adapter.space_available();
        assert_eq!(inner.borrow().queue.len(), 2);
        assert_eq!(adapter.pending_len(), 1);
    }

    #[test]
    fn retry_queue_overflow_drops() {
        let (mut adapter, _inner) = packet_adapter(0, 0);
        for i in 0..(PENDING_SPIKE_DEPTH + 3) {
            adapter.send_spike(Spike::new(i as u32, 0, 15, 0.1, 0));
        }
        assert_eq!(adapter.pending_len(), PENDING_SPIKE_DEPTH);
        assert_eq!(adapter.stats().packets_dropped, 3);
    }

    #[test]
    fn malformed_payload_is_counted() {
        let mut adapter = NetworkAdapter::new(topology(0));
        let request = NetworkRequest {
            src: 1,
            dest: 0,
            vn: 0,
            size_in_bits: 8,
            head: true,
            tail: true,
            payload: vec![0xff; 5],
        };
        assert!(adapter.handle_request(request).is_none());
        assert_eq!(adapter.stats().packets_dropped, 1);
    }

    #[test]
    fn poll_received_unwraps_everything() {
        let (mut adapter, inner) = packet_adapter(3, 8);
        for i in 0..3 {
            let spike = Spike::new(i, i + 10, 3, 0.5, 0);
            inner
                .borrow_mut()
                .queue
                .push_back(NetworkRequest::for_spike(&spike, 0));
        }
        let received = adapter.poll_received();
        assert_eq!(received.len(), 3);
        assert!(received.iter().all(|s| s.hop_count == 1));
    }
}
