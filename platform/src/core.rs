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

//! A neuron core: a block of LIF neurons with an inbound spike FIFO and
//! demand-fetched synaptic weights.
//!
//! Weights live in the memory hierarchy behind a [`MemoryChannel`]. Misses
//! are merged into cache-line or row reads, bounded by an outstanding-request
//! cap; the triggering spike is processed immediately with a configured
//! fallback weight and the response fills the cache for later spikes.

use crate::config::{FiringPolicyKind, VerifyConfiguration, WeightFetchConfiguration};
use crate::memory::{MemoryChannel, MemoryRequest, MemoryResponse, RequestId};
use crate::neuron::{LifParameters, NeuronState};
use crate::spike::Spike;
use crate::Cycle;
use log::{debug, trace, warn};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use std::collections::{HashMap, VecDeque};

const BYTES_PER_WEIGHT: u64 = 4;
const VERIFY_RNG_SEED: u64 = 0x87654321FEDCBA09;

/// Destination selection for spikes emitted by firing neurons.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiringPolicy {
    /// The reference 16-node feed-forward network: nodes 0-3 are the input
    /// layer, 4-11 the hidden layer, 12-15 the output layer.
    FeedForward16,
    /// Fires are recorded but emit no outbound spikes.
    Silent,
}

impl From<FiringPolicyKind> for FiringPolicy {
    fn from(kind: FiringPolicyKind) -> Self {
        match kind {
            FiringPolicyKind::FeedForward16 => Self::FeedForward16,
            FiringPolicyKind::Silent => Self::Silent,
        }
    }
}

impl FiringPolicy {
    /// `(dst_neuron, dst_node, weight)` for a fire of `neuron_idx` on
    /// `node_id`, or `None` when the layer does not project forward.
    pub fn route(&self, node_id: u32, neuron_idx: u32) -> Option<(u32, u32, f32)> {
        match self {
            Self::Silent => None,
            Self::FeedForward16 => match node_id {
                0..=3 => {
                    // Input layer fans out: nodes 0,1 feed hidden nodes 4-7,
                    // nodes 2,3 feed hidden nodes 8-11.
                    let hidden_base = if node_id < 2 { 4 } else { 8 };
                    let hidden_node = hidden_base + (node_id % 2) * 2 + (neuron_idx % 2);
                    let dst_neuron = 8 + (hidden_node - 4) * 4 + neuron_idx;
                    Some((dst_neuron, hidden_node, 0.0))
                }
                4..=11 => {
                    // Hidden layer fans in: each output node collects two
                    // hidden nodes.
                    let output_node = 12 + (node_id - 4) / 2;
                    let dst_neuron = 40 + (output_node - 12) * 2 + (neuron_idx % 2);
                    Some((dst_neuron, output_node, 0.0))
                }
                _ => None,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RequestOrigin {
    Synapse,
    Verify,
}

/// A read in flight: enough to place every returned float in the cache and
/// to deliver the one requested element to its origin.
#[derive(Clone, Debug)]
struct PendingRequest {
    addr: u64,
    size: usize,
    pre: u32,
    post_start: u32,
    count_floats: u32,
    is_row: bool,
    target_post: u32,
    origin: RequestOrigin,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CoreStatistics {
    pub spikes_received: u64,
    pub spikes_generated: u64,
    pub neurons_fired: u64,
    pub memory_requests: u64,
    pub weight_cache_hits: u64,
    pub weight_cache_misses: u64,
    pub merged_reads_rows: u64,
    pub merged_reads_lines: u64,
    pub dropped_unmappable: u64,
    pub unmatched_responses: u64,
    pub verify_completed: u32,
    pub verify_mismatches: u64,
    pub verify_sum: f64,
}

pub struct NeuronCore {
    core_id: usize,
    node_id: u32,
    num_neurons: usize,
    global_neuron_base: u64,
    params: LifParameters,
    fetch: WeightFetchConfiguration,
    verify: VerifyConfiguration,
    policy: FiringPolicy,

    neurons: Vec<NeuronState>,
    inbound: VecDeque<Spike>,
    weight_cache: HashMap<(u32, u32), f32>,
    pending: HashMap<RequestId, PendingRequest>,
    next_request_id: RequestId,
    memory: Option<Box<dyn MemoryChannel>>,

    verify_started: bool,
    verify_requested: u32,
    verify_rng: Xoshiro256StarStar,
    event_fallback_warned: bool,

    total_cycles: u64,
    active_cycles: u64,
    stats: CoreStatistics,
}

impl NeuronCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        core_id: usize,
        node_id: u32,
        global_neuron_base: u64,
        num_neurons: usize,
        params: LifParameters,
        fetch: WeightFetchConfiguration,
        verify: VerifyConfiguration,
        policy: FiringPolicy,
    ) -> Self {
        let neurons = vec![NeuronState::new(params.v_rest); num_neurons];
        Self {
            core_id,
            node_id,
            num_neurons,
            global_neuron_base,
            params,
            fetch,
            verify,
            policy,
            neurons,
            inbound: VecDeque::new(),
            weight_cache: HashMap::new(),
            pending: HashMap::new(),
            next_request_id: 1,
            memory: None,
            verify_started: false,
            verify_requested: 0,
            verify_rng: Xoshiro256StarStar::seed_from_u64(VERIFY_RNG_SEED ^ core_id as u64),
            event_fallback_warned: false,
            total_cycles: 0,
            active_cycles: 0,
            stats: CoreStatistics::default(),
        }
    }

    pub fn attach_memory(&mut self, channel: Box<dyn MemoryChannel>) {
        self.memory = Some(channel);
    }

    pub fn core_id(&self) -> usize {
        self.core_id
    }

    pub fn global_neuron_base(&self) -> u64 {
        self.global_neuron_base
    }

    /// Queue a spike for processing on this core's next tick.
    pub fn deliver_spike(&mut self, spike: Spike) {
        trace!(
            "core {}: spike {} -> {} queued",
            self.core_id,
            spike.src_neuron,
            spike.dst_neuron
        );
        self.inbound.push_back(spike);
        self.stats.spikes_received += 1;
    }

    pub fn has_work(&self) -> bool {
        !self.inbound.is_empty() || self.neurons.iter().any(|n| n.v_mem > 0.1)
    }

    pub fn utilization(&self) -> f64 {
        if self.total_cycles == 0 {
            return 0.0;
        }
        self.active_cycles as f64 / self.total_cycles as f64
    }

    pub fn stats(&self) -> CoreStatistics {
        self.stats
    }

    pub fn neuron(&self, index: usize) -> &NeuronState {
        &self.neurons[index]
    }

    /// Advance the core one cycle. Fired outbound spikes are appended to
    /// `outbox` for the owning PE to route.
    pub fn tick(&mut self, cycle: Cycle, outbox: &mut Vec<Spike>) {
        self.total_cycles += 1;
        let had_work = !self.inbound.is_empty();

        if let Some(memory) = self.memory.as_mut() {
            memory.tick(cycle);
        }
        self.drain_memory_responses();

        while let Some(spike) = self.inbound.pop_front() {
            self.process_spike(&spike, cycle, outbox);
        }

        self.issue_verify_probe(cycle);

        // Refractory countdown and leak. A neuron that fired this cycle
        // keeps its full window; the countdown starts next cycle.
        for neuron in self.neurons.iter_mut() {
            if neuron.is_refractory() {
                if neuron.last_spike_cycle != cycle {
                    neuron.refractory_timer -= 1;
                }
                continue;
            }
            neuron.leak(&self.params);
        }

        for index in 0..self.num_neurons {
            self.check_and_fire(index, cycle, outbox);
        }

        if had_work {
            self.active_cycles += 1;
        }
    }

    fn process_spike(&mut self, spike: &Spike, cycle: Cycle, outbox: &mut Vec<Spike>) {
        let dst = spike.dst_neuron as u64;
        let base = self.global_neuron_base;
        if dst < base || dst >= base + self.num_neurons as u64 {
            warn!(
                "core {}: spike for unmappable neuron {} dropped",
                self.core_id, spike.dst_neuron
            );
            self.stats.dropped_unmappable += 1;
            return;
        }
        let post_local = (dst - base) as u32;

        if self.neurons[post_local as usize].is_refractory() {
            trace!(
                "core {}: neuron {} refractory, spike ignored",
                self.core_id,
                post_local
            );
            return;
        }

        let weight = self
            .fetched_weight(spike, post_local)
            .unwrap_or_else(|| self.fallback_weight(spike));
        self.neurons[post_local as usize].integrate(weight);
        trace!(
            "core {}: neuron {} v_mem={:.3} (+{:.3})",
            self.core_id,
            post_local,
            self.neurons[post_local as usize].v_mem,
            weight
        );
        self.check_and_fire(post_local as usize, cycle, outbox);
    }

    /// Probe the weight cache; on a miss under the outstanding cap, start a
    /// read. Either way the answer for this spike is immediate: the cached
    /// value or `None` for the fallback.
    fn fetched_weight(&mut self, spike: &Spike, post_local: u32) -> Option<f32> {
        if !self.fetch.enable_weight_fetch || self.memory.is_none() {
            return None;
        }
        let pre_local = self.pre_local(spike.src_neuron);
        let key = (pre_local, post_local);
        if let Some(&weight) = self.weight_cache.get(&key) {
            self.stats.weight_cache_hits += 1;
            return Some(weight);
        }
        self.stats.weight_cache_misses += 1;
        if self.pending.len() < self.fetch.max_outstanding_requests {
            self.issue_weight_request(pre_local, post_local, RequestOrigin::Synapse);
        }
        None
    }

    fn fallback_weight(&mut self, spike: &Spike) -> f32 {
        if self.fetch.use_event_weight_fallback {
            if !self.event_fallback_warned {
                warn!(
                    "core {}: using event-carried weights as the miss fallback",
                    self.core_id
                );
                self.event_fallback_warned = true;
            }
            spike.weight
        } else {
            0.0
        }
    }

    /// Row index for a pre-synaptic neuron. Sources outside this core fold
    /// modulo the matrix: each core's weight block is indexed by the
    /// source's position within its own core.
    fn pre_local(&self, src_neuron: u32) -> u32 {
        let src = src_neuron as u64;
        let base = self.global_neuron_base;
        let n = self.num_neurons as u64;
        if src >= base && src < base + n {
            (src - base) as u32
        } else {
            let pe_base = base.wrapping_sub(self.core_id as u64 * n);
            (src.wrapping_sub(pe_base) % n) as u32
        }
    }

    fn check_and_fire(&mut self, index: usize, cycle: Cycle, outbox: &mut Vec<Spike>) {
        if !self.neurons[index].try_fire(&self.params, cycle) {
            return;
        }
        self.stats.neurons_fired += 1;
        debug!(
            "core {}: neuron {} fired at cycle {}",
            self.core_id, index, cycle
        );
        let Some((dst_neuron, dst_node, weight)) = self.policy.route(self.node_id, index as u32)
        else {
            return;
        };
        let src_global = (self.global_neuron_base + index as u64) as u32;
        outbox.push(Spike::new(src_global, dst_neuron, dst_node, weight, cycle));
        self.stats.spikes_generated += 1;
    }

    /// Address of one weight: `base + (pre * N + post) * 4`.
    fn weight_addr(&self, pre: u32, post: u32) -> u64 {
        self.fetch.base_addr + (pre as u64 * self.num_neurons as u64 + post as u64) * BYTES_PER_WEIGHT
    }

    fn issue_weight_request(&mut self, pre: u32, post: u32, origin: RequestOrigin) {
        let n = self.num_neurons as u32;
        let mut post_start = post;
        let mut count_floats = 1;
        let mut is_row = false;

        if self.fetch.merge_read_row {
            is_row = true;
            post_start = 0;
            count_floats = n;
            self.stats.merged_reads_rows += 1;
        } else if self.fetch.merge_read_cacheline {
            let floats_per_line = (self.fetch.line_size_bytes / BYTES_PER_WEIGHT as u32).max(1);
            post_start = (post / floats_per_line) * floats_per_line;
            count_floats = floats_per_line.min(n - post_start);
            self.stats.merged_reads_lines += 1;
        }

        let addr = self.weight_addr(pre, post_start);
        let size = count_floats as usize * BYTES_PER_WEIGHT as usize;
        let id = self.next_request_id;
        self.next_request_id += 1;
        self.pending.insert(
            id,
            PendingRequest {
                addr,
                size,
                pre,
                post_start,
                count_floats,
                is_row,
                target_post: post,
                origin,
            },
        );
        trace!(
            "core {}: read id={} pre={} post={} addr={:#x} size={} row={}",
            self.core_id,
            id,
            pre,
            post,
            addr,
            size,
            is_row
        );
        self.memory
            .as_mut()
            .expect("issue_weight_request without memory")
            .send(MemoryRequest::Read { id, addr, size });
        self.stats.memory_requests += 1;
    }

    fn drain_memory_responses(&mut self) {
        loop {
            let Some(response) = self.memory.as_mut().and_then(|memory| memory.poll()) else {
                return;
            };
            self.handle_memory_response(response);
        }
    }

    fn handle_memory_response(&mut self, response: MemoryResponse) {
        let Some(request) = self.pending.remove(&response.id()) else {
            warn!(
                "core {}: memory response {} has no pending request",
                self.core_id,
                response.id()
            );
            self.stats.unmatched_responses += 1;
            return;
        };
        let data = match response {
            MemoryResponse::ReadResp { data, .. } => data,
            MemoryResponse::WriteResp { .. } => return,
        };

        for (offset, chunk) in data.chunks_exact(BYTES_PER_WEIGHT as usize).enumerate() {
            let post = request.post_start + offset as u32;
            if post >= self.num_neurons as u32 {
                break;
            }
            let value = f32::from_le_bytes(chunk.try_into().unwrap());
            if self.weight_cache.len() >= self.fetch.max_cache_entries {
                // Wholesale eviction keeps the bookkeeping trivial.
                self.weight_cache.clear();
            }
            self.weight_cache.insert((request.pre, post), value);
        }
        trace!(
            "core {}: cached pre={} posts {}..{} from {:#x} ({} bytes, row={})",
            self.core_id,
            request.pre,
            request.post_start,
            request.post_start + request.count_floats,
            request.addr,
            request.size,
            request.is_row
        );

        if request.origin == RequestOrigin::Verify {
            let value = self
                .weight_cache
                .get(&(request.pre, request.target_post))
                .copied()
                .unwrap_or(0.0);
            self.stats.verify_completed += 1;
            self.stats.verify_sum += value as f64;
            if (value - self.verify.expected_weight_value).abs() > self.verify.verify_epsilon {
                self.stats.verify_mismatches += 1;
                debug!(
                    "core {}: weight mismatch at ({}, {}): {} != {}",
                    self.core_id,
                    request.pre,
                    request.target_post,
                    value,
                    self.verify.expected_weight_value
                );
            }
        }
    }

    /// Sample reads against the expected constant, one probe per cycle
    /// after the warmup window, bounded by the outstanding cap.
    fn issue_verify_probe(&mut self, cycle: Cycle) {
        if !self.verify.verify_weights
            || self.memory.is_none()
            || cycle < self.fetch.memory_warmup_cycles
        {
            return;
        }
        if !self.verify_started {
            self.verify_started = true;
            debug!("core {}: weight verification started", self.core_id);
        }
        let in_flight = self.verify_requested - self.stats.verify_completed;
        if self.verify_requested >= self.verify.weight_verify_samples
            || in_flight as usize >= self.fetch.max_outstanding_requests
        {
            return;
        }
        let n = self.num_neurons as u32;
        let pre = self.verify_rng.gen_range(0..n);
        let post = self.verify_rng.gen_range(0..n);
        self.issue_weight_request(pre, post, RequestOrigin::Verify);
        self.verify_requested += 1;
    }
}
