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

//! The whole system: a mesh or torus of PEs joined by one-cycle direction
//! links.
//!
//! The graph of PEs is held in a petgraph digraph; each directed edge
//! carries the link buffer for one direction. A step drains every link into
//! its destination PE, ticks every PE, then moves freshly produced egress
//! onto the outgoing links, so a packet sent in cycle `c` is absorbed in
//! cycle `c + 1`.

use crate::adapter::{NetworkAdapter, NetworkRequest};
use crate::config::Config;
use crate::error::Error;
use crate::memory::{MemoryPort, MemoryStore};
use crate::pe::Pe;
use crate::source::{SpikeMux, SpikeSource};
use crate::spike::Spike;
use crate::topology::{Direction, TopologyHandler};
use crate::Cycle;
use itertools::Itertools;
use log::{debug, warn};
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Simulator cycles per dataset microsecond (1 GHz clock).
const CYCLES_PER_MICROSECOND: Cycle = 1000;

/// One direction link between adjacent PEs.
struct FabricLink {
    direction: Direction,
    queue: VecDeque<NetworkRequest>,
}

/// Totals printed at the end of a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FabricReport {
    pub nodes: usize,
    pub spikes_processed: u64,
    pub neurons_fired: u64,
    pub unroutable_drops: u64,
}

pub struct Fabric {
    graph: DiGraph<u32, FabricLink>,
    node_handles: Vec<NodeIndex>,
    pes: Vec<Pe>,
    stores: Vec<Rc<RefCell<MemoryStore>>>,
    source: Option<SpikeSource>,
    mux: SpikeMux,
    cycle: Cycle,
    unroutable_drops: u64,
}

impl Fabric {
    /// Build the full system: one PE per fabric node, each with its own
    /// adapter and weight memory, and a pair of opposing links for every
    /// adjacent node pair.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let (width, height) = config.topology.dimensions()?;
        let node_count = width * height;

        let mut graph = DiGraph::new();
        let node_handles: Vec<NodeIndex> = (0..node_count)
            .map(|node| graph.add_node(node as u32))
            .collect();

        let mut pes = Vec::with_capacity(node_count);
        let mut stores = Vec::with_capacity(node_count);
        for node in 0..node_count {
            let mut pe_config = config.pe.clone();
            pe_config.node_id = node as u32;
            pe_config.global_neuron_base = (node * config.pe.total_neurons()) as u64;
            let mut pe = Pe::new(&pe_config)?;

            let topology = TopologyHandler::new(&config.topology, node as u32)?;
            pe.attach_adapter(NetworkAdapter::new(topology));

            let store = MemoryStore::shared();
            for unit in 0..pe_config.num_cores {
                pe.attach_core_memory(
                    unit,
                    Box::new(MemoryPort::new(Rc::clone(&store), config.memory_latency)),
                )?;
            }
            stores.push(store);
            pes.push(pe);
        }

        for (y, x) in (0..height).cartesian_product(0..width) {
            let node = y * width + x;
            let topology = TopologyHandler::new(&config.topology, node as u32)?;
            for direction in [
                Direction::North,
                Direction::South,
                Direction::East,
                Direction::West,
            ] {
                if let Some(neighbor) = topology.neighbor_in(direction) {
                    graph.add_edge(
                        node_handles[node],
                        node_handles[neighbor as usize],
                        FabricLink {
                            direction,
                            queue: VecDeque::new(),
                        },
                    );
                }
            }
        }

        debug!(
            "fabric: {} nodes, {} links, {:?}",
            node_count,
            graph.edge_count(),
            config.topology.topology_type
        );

        Ok(Self {
            graph,
            node_handles,
            pes,
            stores,
            source: None,
            mux: SpikeMux::new(node_count, config.pe.total_neurons() as u64),
            cycle: 0,
            unroutable_drops: 0,
        })
    }

    pub fn node_count(&self) -> usize {
        self.pes.len()
    }

    pub fn link_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn cycle(&self) -> Cycle {
        self.cycle
    }

    pub fn pe(&self, node: usize) -> &Pe {
        &self.pes[node]
    }

    pub fn pe_mut(&mut self, node: usize) -> &mut Pe {
        &mut self.pes[node]
    }

    /// The weight memory backing one node, for loaders and inspection.
    pub fn memory_store(&self, node: usize) -> Rc<RefCell<MemoryStore>> {
        Rc::clone(&self.stores[node])
    }

    /// A zero-latency port onto one node's weight memory.
    pub fn weight_port(&self, node: usize) -> MemoryPort {
        MemoryPort::new(self.memory_store(node), 0)
    }

    pub fn set_source(&mut self, source: SpikeSource) {
        self.source = Some(source);
    }

    /// Hand a spike to the PE owning its destination neuron, through the
    /// inbound demultiplexer.
    pub fn inject(&mut self, spike: Spike) {
        let mut routed = Vec::new();
        self.mux.route(spike, self.cycle, &mut routed);
        for (port, spike) in routed {
            self.pes[port].handle_external_spike(spike);
        }
    }

    pub fn mux(&self) -> &SpikeMux {
        &self.mux
    }

    /// Advance every link and PE by one cycle.
    pub fn step(&mut self) {
        let cycle = self.cycle;

        // Dataset replay feeds the owning PE directly.
        if let Some(source) = self.source.as_mut() {
            let mut due = Vec::new();
            source.tick(cycle / CYCLES_PER_MICROSECOND, &mut due);
            for spike in due {
                self.inject(spike);
            }
        }

        // Comms first: drain what arrived on every link, then compute.
        for edge in self.graph.edge_indices().collect::<Vec<_>>() {
            let (_, dst) = self.graph.edge_endpoints(edge).unwrap();
            let arrived: Vec<NetworkRequest> =
                self.graph[edge].queue.drain(..).collect();
            let node = self.graph[dst] as usize;
            for request in arrived {
                self.pes[node].receive_packet(request);
            }
        }

        for pe in self.pes.iter_mut() {
            pe.tick(cycle);
        }

        // Freshly produced egress lands on the links for the next cycle.
        for node in 0..self.pes.len() {
            for (direction, request) in self.pes[node].take_egress() {
                match self.find_link(node, direction) {
                    Some(edge) => self.graph[edge].queue.push_back(request),
                    None => {
                        warn!(
                            "fabric: node {} has no {:?} link, packet dropped",
                            node, direction
                        );
                        self.unroutable_drops += 1;
                    }
                }
            }
        }

        self.cycle += 1;
    }

    fn find_link(&self, node: usize, direction: Direction) -> Option<EdgeIndex> {
        use petgraph::visit::EdgeRef;
        self.graph
            .edges(self.node_handles[node])
            .find(|edge| edge.weight().direction == direction)
            .map(|edge| edge.id())
    }

    pub fn run(&mut self, cycles: Cycle) {
        for _ in 0..cycles {
            self.step();
        }
    }

    /// Print each PE's summary line and return the aggregate.
    pub fn finish(&self) -> FabricReport {
        let mut report = FabricReport {
            nodes: self.pes.len(),
            unroutable_drops: self.unroutable_drops + self.mux.dropped(),
            ..Default::default()
        };
        for pe in &self.pes {
            let (spikes, fired) = pe.finish();
            report.spikes_processed += spikes;
            report.neurons_fired += fired;
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        Config, FiringPolicyKind, PeConfiguration, TopologyConfiguration, TopologyType,
        WeightFetchConfiguration,
    };

    fn config(kind: TopologyType, shape: &str) -> Config {
        Config {
            topology: TopologyConfiguration {
                topology_type: kind,
                topology_shape: shape.to_string(),
            },
            pe: PeConfiguration {
                num_cores: 4,
                neurons_per_core: 4,
                firing_policy: FiringPolicyKind::Silent,
                weight_fetch: WeightFetchConfiguration {
                    use_event_weight_fallback: true,
                    ..Default::default()
                },
                ..Default::default()
            },
            memory_latency: 2,
        }
    }

    #[test]
    fn mesh_link_shape() {
        let fabric = Fabric::new(&config(TopologyType::Mesh2d, "4x4")).unwrap();
        assert_eq!(fabric.node_count(), 16);
        // 2 * (w-1) * h horizontal plus 2 * w * (h-1) vertical links.
        assert_eq!(fabric.link_count(), 48);
        assert_eq!(fabric.graph.edges(fabric.node_handles[0]).count(), 2);
        assert_eq!(fabric.graph.edges(fabric.node_handles[5]).count(), 4);
    }

    #[test]
    fn torus_link_shape() {
        let fabric = Fabric::new(&config(TopologyType::Torus2d, "4x4")).unwrap();
        assert_eq!(fabric.node_count(), 16);
        // Every node has all four outgoing links on a torus.
        assert_eq!(fabric.link_count(), 64);
        for handle in &fabric.node_handles {
            assert_eq!(fabric.graph.edges(*handle).count(), 4);
        }
    }

    #[test]
    fn per_node_neuron_bases_tile_the_id_space() {
        let fabric = Fabric::new(&config(TopologyType::Mesh2d, "2x2")).unwrap();
        assert_eq!(fabric.pe(0).determine_target_unit(0), Some(0));
        assert_eq!(fabric.pe(0).determine_target_unit(16), None);
        assert_eq!(fabric.pe(1).determine_target_unit(16), Some(0));
        assert_eq!(fabric.pe(3).determine_target_unit(63), Some(3));
    }

    #[test]
    fn mesh_relay_east_chain() {
        // Node 0 -> node 3 crosses two intermediate PEs.
        let mut fabric = Fabric::new(&config(TopologyType::Mesh2d, "4x1")).unwrap();
        let spike = Spike::new(0, 3 * 16, 3, 1.5, 0);
        fabric.pe_mut(0).handle_external_spike(spike);
        fabric.run(10);
        assert_eq!(fabric.pe(3).unit_state(0).neurons_fired, 1);
        assert_eq!(fabric.pe(3).stats().hop_expired_drops, 0);
        // Relays counted the spike as remote traffic.
        assert_eq!(fabric.pe(1).adapter().unwrap().stats().remote_spikes, 1);
        assert_eq!(fabric.pe(2).adapter().unwrap().stats().remote_spikes, 1);
    }

    #[test]
    fn torus_shortest_path_wraps() {
        // (0,0) to (2,3): East, East, then South with a wrap; three hops.
        let mut fabric = Fabric::new(&config(TopologyType::Torus2d, "4x4")).unwrap();
        let spike = Spike::new(0, 14 * 16, 14, 1.5, 0);
        fabric.pe_mut(0).handle_external_spike(spike);
        fabric.run(10);
        assert_eq!(fabric.pe(14).unit_state(0).neurons_fired, 1);
        let hops: u64 = (0..16)
            .filter_map(|node| fabric.pe(node).adapter().map(|a| a.stats().remote_spikes))
            .sum();
        assert_eq!(hops, 3, "one remote dispatch per wire hop");
    }

    #[test]
    fn hop_budget_allows_one_last_forward() {
        use crate::spike::MAX_HOPS;
        let mut fabric = Fabric::new(&config(TopologyType::Mesh2d, "4x1")).unwrap();
        let mut spike = Spike::new(0, 16, 1, 1.5, 0);
        spike.hop_count = MAX_HOPS - 1;
        // One hop below the budget: node 0 still forwards it, the arrival
        // hop at node 1 exhausts the budget and drops it before any core.
        fabric.pe_mut(0).handle_external_spike(spike);
        fabric.run(4);
        assert_eq!(fabric.pe(0).stats().external_spikes_sent, 1);
        assert_eq!(fabric.pe(1).stats().hop_expired_drops, 1);
        assert_eq!(fabric.pe(1).stats().spikes_processed, 0);
    }

    #[test]
    fn injected_spike_outside_the_fabric_is_dropped() {
        let mut fabric = Fabric::new(&config(TopologyType::Mesh2d, "2x2")).unwrap();
        // Neuron 999 is beyond every node's range.
        fabric.inject(Spike::new(0, 999, 99, 1.0, 0));
        assert_eq!(fabric.mux().dropped(), 1);
        assert_eq!(fabric.finish().unroutable_drops, 1);
    }

    #[test]
    fn dataset_replay_reaches_the_owning_core() {
        use std::io::Write;
        let path = std::env::temp_dir().join("platform_fabric_dataset.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        // Neuron 17 lives on node 1; due at t=0.
        file.write_all(b"17 0\n").unwrap();
        drop(file);

        let mut fabric = Fabric::new(&config(TopologyType::Mesh2d, "2x2")).unwrap();
        let source = SpikeSource::from_text_file(&path, 16, 1.0, 0, 0).unwrap();
        fabric.set_source(source);
        fabric.run(5);
        assert_eq!(fabric.pe(1).core(0).stats().spikes_received, 1);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn report_aggregates_all_nodes() {
        let mut fabric = Fabric::new(&config(TopologyType::Mesh2d, "2x2")).unwrap();
        for node in 0..4u32 {
            let spike = Spike::new(0, node * 16, node, 1.5, 0);
            fabric.inject(spike);
        }
        fabric.run(3);
        let report = fabric.finish();
        assert_eq!(report.nodes, 4);
        assert_eq!(report.spikes_processed, 4);
        assert_eq!(report.neurons_fired, 4);
    }
}
