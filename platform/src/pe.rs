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

//! The multi-core processing element.
//!
//! A PE owns its neuron cores, the on-chip ring between them, and the
//! external network adapter, and moves every spike between those three.
//! Each spike ends in exactly one of: delivery to a local core, a ring
//! transfer, a NIC dispatch, or a counted drop (hop-expired, invalid
//! target, out of buffer, self-addressed, unroutable).

use crate::adapter::{NetworkAdapter, NetworkRequest};
use crate::balance::LoadController;
use crate::config::{PeConfiguration, TestTrafficConfiguration};
use crate::core::{FiringPolicy, NeuronCore};
use crate::error::Error;
use crate::memory::MemoryChannel;
use crate::neuron::LifParameters;
use crate::ring::{Ring, RingMessage, RingPayload};
use crate::spike::Spike;
use crate::topology::Direction;
use crate::Cycle;
use log::{debug, trace, warn};
use std::collections::VecDeque;

/// Capacity of the inbound external-spike FIFO.
const EXTERNAL_QUEUE_DEPTH: usize = 1024;
/// Cycles between load-imbalance evaluations.
const LOAD_CHECK_PERIOD: Cycle = 100;
/// Cycles between best-effort ring deadlock scans.
const DEADLOCK_SCAN_PERIOD: Cycle = 1000;
/// Raw utilization spread that triggers a rebalance request.
const LOAD_IMBALANCE_THRESHOLD: f64 = 0.3;
/// Ring priority class used for spike messages.
const SPIKE_PRIORITY: usize = 1;

/// Public per-core status, refreshed by the PE every tick from the core's
/// statistics snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessingUnitState {
    pub unit_id: usize,
    pub neuron_id_start: u64,
    pub neuron_count: usize,
    pub is_active: bool,
    pub spikes_processed: u64,
    pub neurons_fired: u64,
    pub utilization: f64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PeStatistics {
    pub external_spikes_received: u64,
    pub external_spikes_sent: u64,
    pub spikes_processed: u64,
    pub inter_core_messages: u64,
    pub hop_expired_drops: u64,
    pub invalid_target_drops: u64,
    pub buffer_drops: u64,
    pub self_loop_drops: u64,
    pub no_route_drops: u64,
}

pub struct Pe {
    node_id: u32,
    num_cores: usize,
    neurons_per_core: usize,
    total_neurons: usize,
    global_neuron_base: u64,

    cores: Vec<NeuronCore>,
    ring: Option<Ring>,
    adapter: Option<NetworkAdapter>,
    external_queue: VecDeque<Spike>,
    unit_states: Vec<ProcessingUnitState>,
    load: LoadController,
    test_traffic: TestTrafficConfiguration,
    test_cycle_counter: Cycle,
    test_spikes_sent: u32,

    cycle: Cycle,
    stats: PeStatistics,
    fired_scratch: Vec<Spike>,
}

impl Pe {
    pub fn new(config: &PeConfiguration) -> Result<Self, Error> {
        config.validate()?;
        let params = LifParameters::from(config.neuron);
        let policy = FiringPolicy::from(config.firing_policy);
        let n = config.neurons_per_core;
        let block_bytes = (n * n) as u64 * 4;

        let cores = (0..config.num_cores)
            .map(|unit| {
                let base = config.global_neuron_base + (unit * n) as u64;
                // Each core fetches from its own block of the weight memory.
                let mut fetch = config.weight_fetch;
                fetch.base_addr += unit as u64 * block_bytes;
                NeuronCore::new(
                    unit,
                    config.node_id,
                    base,
                    n,
                    params,
                    fetch,
                    config.verify,
                    policy,
                )
            })
            .collect::<Vec<_>>();

        // A single core has no one to talk to on-chip.
        let ring = if config.num_cores > 1 {
            Some(Ring::new(
                config.num_cores,
                config.ring.num_vcs,
                config.ring.credits_per_vc,
            )?)
        } else {
            None
        };

        let unit_states = (0..config.num_cores)
            .map(|unit| ProcessingUnitState {
                unit_id: unit,
                neuron_id_start: config.global_neuron_base + (unit * n) as u64,
                neuron_count: n,
                ..Default::default()
            })
            .collect();

        debug!(
            "pe {}: {} cores x {} neurons, base {}",
            config.node_id, config.num_cores, n, config.global_neuron_base
        );

        Ok(Self {
            node_id: config.node_id,
            num_cores: config.num_cores,
            neurons_per_core: n,
            total_neurons: config.total_neurons(),
            global_neuron_base: config.global_neuron_base,
            cores,
            ring,
            adapter: None,
            external_queue: VecDeque::new(),
            unit_states,
            load: LoadController::new(config.num_cores),
            test_traffic: config.test_traffic,
            test_cycle_counter: 0,
            test_spikes_sent: 0,
            cycle: 0,
            stats: PeStatistics::default(),
            fired_scratch: Vec::new(),
        })
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn attach_adapter(&mut self, adapter: NetworkAdapter) {
        self.adapter = Some(adapter);
    }

    pub fn adapter(&self) -> Option<&NetworkAdapter> {
        self.adapter.as_ref()
    }

    pub fn attach_core_memory(
        &mut self,
        unit: usize,
        channel: Box<dyn MemoryChannel>,
    ) -> Result<(), Error> {
        let core = self.cores.get_mut(unit).ok_or(Error::InvalidUnit(unit))?;
        core.attach_memory(channel);
        Ok(())
    }

    pub fn core(&self, unit: usize) -> &NeuronCore {
        &self.cores[unit]
    }

    pub fn stats(&self) -> PeStatistics {
        self.stats
    }

    pub fn unit_state(&self, unit: usize) -> &ProcessingUnitState {
        &self.unit_states[unit]
    }

    pub fn load_controller(&self) -> &LoadController {
        &self.load
    }

    /// The core owning a global neuron id, or `None` when the id is outside
    /// `[base, base + num_cores * neurons_per_core)`.
    pub fn determine_target_unit(&self, neuron: u32) -> Option<usize> {
        let neuron = neuron as u64;
        if neuron < self.global_neuron_base {
            return None;
        }
        let local = (neuron - self.global_neuron_base) as usize;
        if local >= self.total_neurons {
            return None;
        }
        Some(local / self.neurons_per_core)
    }

    /// Entry point for spikes from outside the PE: dataset replay, test
    /// traffic from peers, and unwrapped wire packets.
    pub fn handle_external_spike(&mut self, spike: Spike) {
        if spike.is_expired() {
            debug!(
                "pe {}: hop budget exhausted, spike {} -> {} dropped",
                self.node_id, spike.src_neuron, spike.dst_neuron
            );
            self.stats.hop_expired_drops += 1;
            return;
        }
        self.stats.external_spikes_received += 1;

        if spike.dst_node == self.node_id {
            if self.external_queue.len() < EXTERNAL_QUEUE_DEPTH {
                self.external_queue.push_back(spike);
            } else {
                warn!("pe {}: external queue full, spike dropped", self.node_id);
                self.stats.buffer_drops += 1;
            }
        } else if let Some(unit) = self.determine_target_unit(spike.dst_neuron) {
            // Misaddressed node id but the neuron lives here; deliver it.
            self.deliver_spike_to_core(unit, spike);
        } else {
            self.send_external_spike(spike);
        }
    }

    /// Unwrap an arriving wire packet and absorb its spike.
    pub fn receive_packet(&mut self, request: NetworkRequest) {
        let spike = match self.adapter.as_mut() {
            Some(adapter) => adapter.handle_request(request),
            None => {
                warn!("pe {}: packet arrived without an adapter", self.node_id);
                self.stats.no_route_drops += 1;
                None
            }
        };
        if let Some(spike) = spike {
            self.handle_external_spike(spike);
        }
    }

    /// Direction-link egress accumulated by the adapter this cycle.
    pub fn take_egress(&mut self) -> Vec<(Direction, NetworkRequest)> {
        self.adapter
            .as_mut()
            .map(|adapter| adapter.take_egress())
            .unwrap_or_default()
    }

    pub fn deliver_spike_to_core(&mut self, unit: usize, spike: Spike) {
        if unit >= self.num_cores {
            warn!("pe {}: no core {}, spike dropped", self.node_id, unit);
            self.stats.invalid_target_drops += 1;
            return;
        }
        trace!(
            "pe {}: spike for neuron {} -> core {}",
            self.node_id,
            spike.dst_neuron,
            unit
        );
        self.cores[unit].deliver_spike(spike);
        self.stats.spikes_processed += 1;
        self.load.note_work(unit);
    }

    /// Post a spike onto the on-chip ring. A refused send (ring full) drops
    /// the spike and counts it.
    pub fn route_internal_spike(&mut self, src_core: usize, dst_core: usize, spike: Spike) {
        if src_core >= self.num_cores || dst_core >= self.num_cores {
            warn!(
                "pe {}: invalid core pair {} -> {}",
                self.node_id, src_core, dst_core
            );
            self.stats.invalid_target_drops += 1;
            return;
        }
        if self.num_cores <= 1 || src_core == dst_core {
            self.deliver_spike_to_core(dst_core, spike);
            return;
        }
        let mut message = RingMessage::spike(src_core, dst_core, spike);
        message.timestamp = self.cycle;
        let ring = self.ring.as_mut().expect("multi-core PE without a ring");
        if ring.send_message(src_core, dst_core, message, SPIKE_PRIORITY) {
            self.stats.inter_core_messages += 1;
        } else {
            debug!(
                "pe {}: ring refused {} -> {}, spike dropped",
                self.node_id, src_core, dst_core
            );
            self.stats.buffer_drops += 1;
        }
    }

    /// Hand a spike to the NIC. Spikes addressed back to this node are a
    /// routing loop and are dropped here.
    pub fn send_external_spike(&mut self, spike: Spike) {
        if spike.dst_node == self.node_id {
            warn!(
                "pe {}: refusing to send spike to self (neuron {})",
                self.node_id, spike.dst_neuron
            );
            self.stats.self_loop_drops += 1;
            return;
        }
        match self.adapter.as_mut() {
            Some(adapter) => {
                // The self-target guard above makes a local bounce
                // impossible; anything returned would be a routing bug.
                if adapter.send_spike(spike).is_none() {
                    self.stats.external_spikes_sent += 1;
                }
            }
            None => {
                debug!(
                    "pe {}: no network interface, spike for node {} dropped",
                    self.node_id, spike.dst_node
                );
                self.stats.no_route_drops += 1;
            }
        }
    }

    /// One simulation step.
    pub fn tick(&mut self, cycle: Cycle) {
        self.cycle = cycle;

        // Packet mode: absorb whatever the wire delivered.
        let arrived = self
            .adapter
            .as_mut()
            .map(|adapter| adapter.poll_received())
            .unwrap_or_default();
        for spike in arrived {
            self.handle_external_spike(spike);
        }

        // 1. Drain the external FIFO into the owning cores.
        while let Some(spike) = self.external_queue.pop_front() {
            match self.determine_target_unit(spike.dst_neuron) {
                Some(unit) => self.deliver_spike_to_core(unit, spike),
                None if spike.dst_node != self.node_id => self.send_external_spike(spike),
                None => {
                    warn!(
                        "pe {}: neuron {} not resident, spike dropped",
                        self.node_id, spike.dst_neuron
                    );
                    self.stats.invalid_target_drops += 1;
                }
            }
        }

        // 2. Tick every core and route what fired.
        for unit in 0..self.num_cores {
            let mut fired = std::mem::take(&mut self.fired_scratch);
            self.cores[unit].tick(cycle, &mut fired);
            for spike in fired.drain(..) {
                match self.determine_target_unit(spike.dst_neuron) {
                    Some(dst_unit) => self.route_internal_spike(unit, dst_unit, spike),
                    None => self.send_external_spike(spike),
                }
            }
            self.fired_scratch = fired;
        }

        // 3. Refresh the public per-unit counters.
        for (unit, state) in self.unit_states.iter_mut().enumerate() {
            let snapshot = self.cores[unit].stats();
            state.spikes_processed = snapshot.spikes_received;
            state.neurons_fired = snapshot.neurons_fired;
            state.utilization = self.cores[unit].utilization();
            state.is_active = self.cores[unit].has_work();
        }

        // 4. Ring transfer and ejection delivery.
        if let Some(ring) = self.ring.as_mut() {
            ring.tick(cycle);
            if cycle > 0 && cycle % DEADLOCK_SCAN_PERIOD == 0 && ring.detect_deadlock() {
                warn!("pe {}: ring deadlock suspected at cycle {}", self.node_id, cycle);
            }
        }
        for unit in 0..self.num_cores {
            loop {
                let message = match self.ring.as_mut() {
                    Some(ring) => ring.receive_message(unit),
                    None => None,
                };
                let Some(message) = message else { break };
                if let RingPayload::Spike(spike) = message.payload {
                    self.deliver_spike_to_core(unit, spike);
                }
            }
        }

        // 5. Load smoothing, with a periodic imbalance check.
        let raw: Vec<f64> = self.unit_states.iter().map(|s| s.utilization).collect();
        self.load.tick(&raw);
        if cycle % LOAD_CHECK_PERIOD == 0 && self.num_cores > 1 {
            let max = raw.iter().cloned().fold(0.0f64, f64::max);
            let min = raw.iter().cloned().fold(1.0f64, f64::min);
            if max - min > LOAD_IMBALANCE_THRESHOLD {
                debug!(
                    "pe {}: load imbalance {:.2} (max {:.2}, min {:.2})",
                    self.node_id,
                    max - min,
                    max,
                    min
                );
                self.load.balance_load();
            }
        }

        // 6. Synthetic traffic.
        if self.test_traffic.enable_test_traffic {
            self.generate_test_traffic(cycle);
        }
    }

    /// Deterministic burst generator: a function of cycle and
    /// configuration only.
    fn generate_test_traffic(&mut self, cycle: Cycle) {
        let config = self.test_traffic;
        if config.test_max_spikes > 0 && self.test_spikes_sent >= config.test_max_spikes {
            return;
        }
        self.test_cycle_counter += 1;
        if self.test_cycle_counter < config.test_period {
            return;
        }
        self.test_cycle_counter = 0;

        let mut burst = config.test_spikes_per_burst;
        if config.test_max_spikes > 0 {
            burst = burst.min(config.test_max_spikes - self.test_spikes_sent);
        }
        let total = self.total_neurons as u32;
        for i in 0..burst {
            let src = self.node_id * total + (i % total);
            let dst_neuron = config.test_target_node * total + (i % total);
            let spike = Spike::new(
                src,
                dst_neuron,
                config.test_target_node,
                config.test_weight,
                cycle,
            );
            self.send_external_spike(spike);
            self.test_spikes_sent += 1;
        }
        trace!(
            "pe {}: test burst of {} ({} total)",
            self.node_id,
            burst,
            self.test_spikes_sent
        );
    }

    /// Final per-node summary. Returns `(spikes_processed, neurons_fired)`.
    pub fn finish(&self) -> (u64, u64) {
        let spikes: u64 = self.unit_states.iter().map(|s| s.spikes_processed).sum();
        let fired: u64 = self.unit_states.iter().map(|s| s.neurons_fired).sum();
        println!("NODE{}: 脉冲={}, 激发={}", self.node_id, spikes, fired);
        (spikes, fired)
    }
}
