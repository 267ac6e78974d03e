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

//! Bidirectional on-chip ring with virtual channels and credit-based flow
//! control.
//!
//! Nodes live in an arena indexed by unit id; neighbor references are plain
//! indices, never owning pointers. Messages are values moved between VC
//! buffers: injected at a source VC, forwarded one hop per cycle along the
//! shortest direction, and ejected at the destination. Full buffers cause
//! backpressure at the sender, not loss.

use crate::error::Error;
use crate::ring::arbiter::pick_vc;
use crate::spike::Spike;
use crate::Cycle;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::collections::VecDeque;

/// How often the aggregate counters are refreshed from per-node state.
const STATS_REFRESH_CYCLES: Cycle = 1000;

/// Payload carried by a ring message.
#[derive(Clone, Debug, PartialEq)]
pub enum RingPayload {
    Spike(Spike),
    MemRequest(u64),
    MemResponse(u64),
    Control(u32),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RingMessage {
    pub src_unit: usize,
    pub dst_unit: usize,
    pub timestamp: Cycle,
    /// 0 is the most urgent class.
    pub priority: usize,
    pub payload: RingPayload,
}

impl RingMessage {
    pub fn spike(src_unit: usize, dst_unit: usize, spike: Spike) -> Self {
        Self {
            src_unit,
            dst_unit,
            timestamp: 0,
            priority: 1,
            payload: RingPayload::Spike(spike),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RouteDirection {
    Clockwise,
    CounterClockwise,
    Local,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VcState {
    Idle,
    Routing,
    Blocked,
    Active,
}

/// A buffered message plus the cycle it last moved; a message advances at
/// most one hop per cycle so intra-cycle effects surface the next cycle.
#[derive(Clone, Debug)]
struct Slot {
    message: RingMessage,
    moved_at: Cycle,
}

/// One FIFO lane with its credit pool. `credits + buffer.len()` never
/// exceeds `max_credits`.
#[derive(Clone, Debug)]
pub struct VirtualChannel {
    pub id: usize,
    pub priority: usize,
    pub state: VcState,
    buffer: VecDeque<Slot>,
    credits: u32,
    max_credits: u32,
    pub last_activity_cycle: Cycle,
}

impl VirtualChannel {
    fn new(id: usize, priority: usize, max_credits: u32) -> Self {
        Self {
            id,
            priority,
            state: VcState::Idle,
            buffer: VecDeque::new(),
            credits: max_credits,
            max_credits,
            last_activity_cycle: 0,
        }
    }

    pub fn has_space(&self) -> bool {
        self.credits > 0 && self.buffer.len() < self.max_credits as usize
    }

    pub fn has_data(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn credits(&self) -> u32 {
        self.credits
    }

    pub fn occupancy(&self) -> usize {
        self.buffer.len()
    }

    fn push(&mut self, slot: Slot, cycle: Cycle) {
        debug_assert!(self.has_space());
        self.buffer.push_back(slot);
        self.credits -= 1;
        self.state = VcState::Active;
        self.last_activity_cycle = cycle;
    }

    fn pop(&mut self) -> Slot {
        let slot = self.buffer.pop_front().expect("pop from empty VC");
        if self.credits < self.max_credits {
            self.credits += 1;
        }
        if self.buffer.is_empty() {
            self.state = VcState::Idle;
        }
        slot
    }
}

mod arbiter {
    use super::VirtualChannel;
    use crate::Cycle;

    /// Pick the VC to service for one direction: the lowest numeric
    /// priority among VCs that hold data whose head has not already moved
    /// this cycle.
    pub(super) fn pick_vc(vcs: &[VirtualChannel], cycle: Cycle) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (index, vc) in vcs.iter().enumerate() {
            let eligible = vc
                .buffer
                .front()
                .map(|head| head.moved_at < cycle)
                .unwrap_or(false);
            if eligible && best.map_or(true, |b| vc.priority < vcs[b].priority) {
                best = Some(index);
            }
        }
        best
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingNodeStatistics {
    pub injected: u64,
    pub ejected: u64,
    pub forwarded: u64,
    pub latency_cycles: u64,
}

struct RingNode {
    node_id: usize,
    next_cw: usize,
    prev_cw: usize,
    next_ccw: usize,
    prev_ccw: usize,
    cw_vcs: Vec<VirtualChannel>,
    ccw_vcs: Vec<VirtualChannel>,
    local_vcs: Vec<VirtualChannel>,
    ejection: VecDeque<RingMessage>,
    stats: RingNodeStatistics,
}

impl RingNode {
    fn new(node_id: usize, num_vcs: usize, credits_per_vc: u32) -> Self {
        // VC id doubles as its priority class.
        let bank = || {
            (0..num_vcs)
                .map(|id| VirtualChannel::new(id, id, credits_per_vc))
                .collect::<Vec<_>>()
        };
        Self {
            node_id,
            next_cw: 0,
            prev_cw: 0,
            next_ccw: 0,
            prev_ccw: 0,
            cw_vcs: bank(),
            ccw_vcs: bank(),
            local_vcs: bank(),
            ejection: VecDeque::new(),
            stats: RingNodeStatistics::default(),
        }
    }

    fn vcs(&self, direction: RouteDirection) -> &[VirtualChannel] {
        match direction {
            RouteDirection::Clockwise => &self.cw_vcs,
            RouteDirection::CounterClockwise => &self.ccw_vcs,
            RouteDirection::Local => &self.local_vcs,
        }
    }

    fn vcs_mut(&mut self, direction: RouteDirection) -> &mut Vec<VirtualChannel> {
        match direction {
            RouteDirection::Clockwise => &mut self.cw_vcs,
            RouteDirection::CounterClockwise => &mut self.ccw_vcs,
            RouteDirection::Local => &mut self.local_vcs,
        }
    }

    /// Prefer a matching-priority VC with space, then any VC with space.
    fn select_output_vc(&self, direction: RouteDirection, priority: usize) -> Option<usize> {
        let vcs = self.vcs(direction);
        vcs.iter()
            .position(|vc| vc.priority == priority && vc.has_space())
            .or_else(|| vcs.iter().position(|vc| vc.has_space()))
    }

    fn can_accept(&self, direction: RouteDirection, priority: usize) -> bool {
        self.vcs(direction)
            .iter()
            .any(|vc| vc.priority <= priority && vc.has_space())
    }
}

/// The ring itself: an arena of nodes plus routing and flow-control state.
pub struct Ring {
    nodes: Vec<RingNode>,
    num_vcs: usize,
    credits_per_vc: u32,
    cycle: Cycle,
    // Routing is static; decisions are cached forever.
    route_cache: HashMap<(usize, usize), RouteDirection>,
    total_routed: u64,
    total_latency_cycles: u64,
    last_stats_cycle: Cycle,
}

impl Ring {
    pub fn new(num_nodes: usize, num_vcs: usize, credits_per_vc: u32) -> Result<Self, Error> {
        if num_nodes < 2 {
            return Err(Error::RingTooSmall(num_nodes));
        }
        if num_vcs == 0 {
            return Err(Error::InvalidConfiguration(
                "at least one virtual channel per direction is required".to_string(),
            ));
        }
        let mut nodes: Vec<RingNode> = (0..num_nodes)
            .map(|id| RingNode::new(id, num_vcs, credits_per_vc))
            .collect();
        for (id, node) in nodes.iter_mut().enumerate() {
            node.next_cw = (id + 1) % num_nodes;
            node.prev_cw = (id + num_nodes - 1) % num_nodes;
            node.next_ccw = (id + num_nodes - 1) % num_nodes;
            node.prev_ccw = (id + 1) % num_nodes;
        }
        let ring = Self {
            nodes,
            num_vcs,
            credits_per_vc,
            cycle: 0,
            route_cache: HashMap::new(),
            total_routed: 0,
            total_latency_cycles: 0,
            last_stats_cycle: 0,
        };
        debug_assert!(ring.verify_topology());
        Ok(ring)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Every node's neighbor links must invert each other.
    pub fn verify_topology(&self) -> bool {
        self.nodes.iter().enumerate().all(|(id, node)| {
            self.nodes[node.next_cw].prev_cw == id && self.nodes[node.next_ccw].prev_ccw == id
        })
    }

    /// Shortest-direction routing with a clockwise tie-break.
    pub fn select_route(&mut self, src: usize, dst: usize) -> RouteDirection {
        if src == dst {
            return RouteDirection::Local;
        }
        if let Some(&cached) = self.route_cache.get(&(src, dst)) {
            return cached;
        }
        let cw = self.hops(src, dst, RouteDirection::Clockwise);
        let ccw = self.hops(src, dst, RouteDirection::CounterClockwise);
        let direction = if cw <= ccw {
            RouteDirection::Clockwise
        } else {
            RouteDirection::CounterClockwise
        };
        self.route_cache.insert((src, dst), direction);
        direction
    }

    pub fn hops(&self, src: usize, dst: usize, direction: RouteDirection) -> usize {
        let n = self.nodes.len();
        match direction {
            RouteDirection::Clockwise => (dst + n - src) % n,
            RouteDirection::CounterClockwise => (src + n - dst) % n,
            RouteDirection::Local => 0,
        }
    }

    /// Inject a message at `src`. Returns `false` (backpressure) when the
    /// ids are invalid or no virtual channel in the routed direction has a
    /// credit; the caller decides whether to retry or drop.
    pub fn send_message(
        &mut self,
        src: usize,
        dst: usize,
        mut message: RingMessage,
        priority: usize,
    ) -> bool {
        let n = self.nodes.len();
        if src >= n || dst >= n {
            warn!("ring: invalid node ids src={} dst={}", src, dst);
            return false;
        }
        message.src_unit = src;
        message.dst_unit = dst;
        message.priority = priority;
        message.timestamp = self.cycle;
        if src == dst {
            let node = &mut self.nodes[src];
            node.ejection.push_back(message);
            node.stats.ejected += 1;
            return true;
        }
        let direction = self.select_route(src, dst);
        let cycle = self.cycle;
        let node = &mut self.nodes[src];
        let Some(vc_index) = node.select_output_vc(direction, priority) else {
            trace!(
                "ring: node {} backpressured toward {:?} priority {}",
                src,
                direction,
                priority
            );
            return false;
        };
        node.vcs_mut(direction)[vc_index].push(
            Slot {
                message,
                moved_at: cycle,
            },
            cycle,
        );
        node.stats.injected += 1;
        trace!("ring: injected {} -> {} via {:?}", src, dst, direction);
        true
    }

    /// Pop the next ejected message at `node`, updating latency counters.
    pub fn receive_message(&mut self, node: usize) -> Option<RingMessage> {
        let cycle = self.cycle;
        let entry = self.nodes.get_mut(node)?;
        let message = entry.ejection.pop_front()?;
        let latency = cycle.saturating_sub(message.timestamp);
        entry.stats.latency_cycles += latency;
        self.total_latency_cycles += latency;
        Some(message)
    }

    pub fn has_traffic(&self, node: usize) -> bool {
        self.nodes
            .get(node)
            .map(|n| !n.ejection.is_empty())
            .unwrap_or(false)
    }

    /// Advance the ring by one cycle: at every node, arbitrate one VC per
    /// direction and either eject its head or forward it one hop.
    pub fn tick(&mut self, cycle: Cycle) {
        self.cycle = cycle;
        for node in 0..self.nodes.len() {
            self.process_direction(node, RouteDirection::Clockwise);
            self.process_direction(node, RouteDirection::CounterClockwise);
        }
        if cycle - self.last_stats_cycle >= STATS_REFRESH_CYCLES {
            self.refresh_statistics();
            self.last_stats_cycle = cycle;
        }
    }

    fn process_direction(&mut self, node: usize, direction: RouteDirection) {
        let cycle = self.cycle;
        let Some(vc_index) = pick_vc(self.nodes[node].vcs(direction), cycle) else {
            return;
        };

        let (dst_unit, priority) = {
            let head = self.nodes[node].vcs(direction)[vc_index]
                .buffer
                .front()
                .expect("arbitration picked an empty VC");
            (head.message.dst_unit, head.message.priority)
        };

        if dst_unit == node {
            let entry = &mut self.nodes[node];
            let slot = entry.vcs_mut(direction)[vc_index].pop();
            entry.ejection.push_back(slot.message);
            entry.stats.ejected += 1;
            trace!("ring: node {} ejected a message", entry.node_id);
            return;
        }

        // Recompute the direction from here; it may differ from the one the
        // message was injected with.
        let next_direction = self.select_route(node, dst_unit);
        let neighbor = match next_direction {
            RouteDirection::Clockwise => self.nodes[node].next_cw,
            RouteDirection::CounterClockwise => self.nodes[node].next_ccw,
            RouteDirection::Local => unreachable!("dst_unit == node handled above"),
        };

        if !self.nodes[neighbor].can_accept(next_direction, priority) {
            self.nodes[node].vcs_mut(direction)[vc_index].state = VcState::Blocked;
            return;
        }
        let Some(out_vc) = self.nodes[neighbor].select_output_vc(next_direction, priority) else {
            self.nodes[node].vcs_mut(direction)[vc_index].state = VcState::Blocked;
            return;
        };

        let mut slot = self.nodes[node].vcs_mut(direction)[vc_index].pop();
        slot.moved_at = cycle;
        self.nodes[neighbor].vcs_mut(next_direction)[out_vc].push(slot, cycle);
        self.nodes[node].stats.forwarded += 1;
        trace!(
            "ring: node {} forwarded toward {} via {:?}",
            node,
            neighbor,
            next_direction
        );
    }

    fn refresh_statistics(&mut self) {
        self.total_routed = self
            .nodes
            .iter()
            .map(|node| node.stats.forwarded + node.stats.ejected)
            .sum();
        debug!(
            "ring stats @{}: routed={} avg_latency={:.2}",
            self.cycle,
            self.total_routed,
            self.average_latency()
        );
    }

    pub fn pending_messages(&self) -> usize {
        self.nodes
            .iter()
            .map(|node| {
                node.cw_vcs
                    .iter()
                    .chain(node.ccw_vcs.iter())
                    .chain(node.local_vcs.iter())
                    .map(|vc| vc.occupancy())
                    .sum::<usize>()
                    + node.ejection.len()
            })
            .sum()
    }

    pub fn node_statistics(&self, node: usize) -> RingNodeStatistics {
        self.nodes
            .get(node)
            .map(|n| n.stats)
            .unwrap_or_default()
    }

    pub fn total_messages_routed(&self) -> u64 {
        self.nodes
            .iter()
            .map(|node| node.stats.forwarded + node.stats.ejected)
            .sum()
    }

    pub fn average_latency(&self) -> f64 {
        let ejected: u64 = self.nodes.iter().map(|node| node.stats.ejected).sum();
        if ejected == 0 {
            0.0
        } else {
            self.total_latency_cycles as f64 / ejected as f64
        }
    }

    /// Fraction of directional VCs currently holding data.
    pub fn utilization(&self) -> f64 {
        let lanes = (self.nodes.len() * self.num_vcs * 2) as f64;
        let busy = self
            .nodes
            .iter()
            .map(|node| {
                node.cw_vcs
                    .iter()
                    .chain(node.ccw_vcs.iter())
                    .filter(|vc| vc.has_data())
                    .count()
            })
            .sum::<usize>() as f64;
        busy / lanes
    }

    pub fn vc_utilization(&self, node: usize, direction: RouteDirection, vc: usize) -> f64 {
        let Some(channel) = self
            .nodes
            .get(node)
            .and_then(|n| n.vcs(direction).get(vc))
        else {
            return 0.0;
        };
        channel.occupancy() as f64 / self.credits_per_vc as f64
    }

    /// Best-effort deadlock scan: every clockwise VC in the ring holds data
    /// and none has space to advance. The priority-class VCs prevent this by
    /// construction; the scan is an observability aid.
    pub fn detect_deadlock(&self) -> bool {
        self.nodes
            .iter()
            .all(|node| node.cw_vcs.iter().all(|vc| vc.has_data() && !vc.has_space()))
    }

    #[cfg(test)]
    fn check_credit_invariant(&self) {
        for node in &self.nodes {
            for vc in node
                .cw_vcs
                .iter()
                .chain(node.ccw_vcs.iter())
                .chain(node.local_vcs.iter())
            {
                assert!(
                    vc.credits() as usize + vc.occupancy() <= vc.max_credits as usize,
                    "credit invariant violated on node {} vc {}",
                    node.node_id,
                    vc.id
                );
            }
        }
    }
}
