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

//! Spike supply: dataset replay and the inbound demultiplexer.
//!
//! [`SpikeSource`] replays a TEXT dataset, one `<neuron_id>
//! <timestamp_microseconds>` record per line, `#` comments and blank lines
//! skipped, in timestamp order from a min-heap regardless of file order.
//! [`SpikeMux`] fans externally supplied spikes out to the PE ports that
//! own them, optionally through a latency queue per port.

use crate::error::Error;
use crate::spike::Spike;
use crate::Cycle;
use log::{debug, warn};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct SpikeRecord {
    timestamp: u64,
    neuron_id: u32,
}

pub struct SpikeSource {
    queue: BinaryHeap<Reverse<SpikeRecord>>,
    neurons_per_pe: u32,
    events_loaded: u64,
    events_sent: u64,
}

impl SpikeSource {
    /// Load a TEXT dataset.
    ///
    /// `time_scale` multiplies file timestamps; with `neuron_offset` > 0
    /// only neuron ids at or above the offset are replayed; `max_events`
    /// of 0 means unlimited. `neurons_per_pe` maps each record to its
    /// owning node as `dst_node = neuron_id / neurons_per_pe`.
    pub fn from_text_file(
        path: &Path,
        neurons_per_pe: u32,
        time_scale: f32,
        neuron_offset: u32,
        max_events: u64,
    ) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| Error::FileRead(path.display().to_string()))?;
        let mut queue = BinaryHeap::new();
        let mut loaded = 0u64;
        for (index, line) in text.lines().enumerate() {
            if max_events != 0 && loaded >= max_events {
                break;
            }
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let parsed = (
                fields.next().and_then(|f| f.parse::<u32>().ok()),
                fields.next().and_then(|f| f.parse::<u64>().ok()),
            );
            let (Some(neuron_id), Some(timestamp)) = parsed else {
                warn!("{}:{}: malformed record skipped", path.display(), index + 1);
                continue;
            };
            if neuron_offset > 0 && neuron_id < neuron_offset {
                continue;
            }
            let timestamp = (timestamp as f64 * time_scale as f64) as u64;
            queue.push(Reverse(SpikeRecord {
                timestamp,
                neuron_id,
            }));
            loaded += 1;
        }
        debug!("dataset {}: {} events loaded", path.display(), loaded);
        Ok(Self {
            queue,
            neurons_per_pe,
            events_loaded: loaded,
            events_sent: 0,
        })
    }

    #[cfg(test)]
    fn from_records(records: &[(u32, u64)], neurons_per_pe: u32) -> Self {
        let queue = records
            .iter()
            .map(|&(neuron_id, timestamp)| {
                Reverse(SpikeRecord {
                    timestamp,
                    neuron_id,
                })
            })
            .collect::<BinaryHeap<_>>();
        Self {
            events_loaded: queue.len() as u64,
            queue,
            neurons_per_pe,
            events_sent: 0,
        }
    }

    pub fn events_loaded(&self) -> u64 {
        self.events_loaded
    }

    pub fn events_sent(&self) -> u64 {
        self.events_sent
    }

    pub fn finished(&self) -> bool {
        self.queue.is_empty()
    }

    /// Emit every record due at or before `now_us`. Records become spikes
    /// addressed to their own neuron id on the owning node.
    pub fn tick(&mut self, now_us: u64, out: &mut Vec<Spike>) {
        while let Some(Reverse(record)) = self.queue.peek() {
            if record.timestamp > now_us {
                break;
            }
            let Reverse(record) = self.queue.pop().unwrap();
            let dst_node = record.neuron_id / self.neurons_per_pe;
            out.push(Spike::new(
                record.neuron_id,
                record.neuron_id,
                dst_node,
                1.0,
                record.timestamp,
            ));
            self.events_sent += 1;
        }
    }
}

/// Demultiplexes spikes onto per-PE output ports.
///
/// The port is the destination neuron's owning range,
/// `dst_neuron / per_pe_neurons`; the spike's `dst_node` is only trusted
/// when it agrees with that calculation, so a corrupted node id cannot
/// steer a spike into the wrong PE.
pub struct SpikeMux {
    num_ports: usize,
    per_pe_neurons: u64,
    /// 0 disables the bound.
    max_queue_depth: usize,
    /// 0 forwards immediately.
    fwd_latency_cycles: Cycle,
    queues: Vec<VecDeque<(Cycle, Spike)>>,
    forwarded: u64,
    dropped: u64,
    queue_peak: usize,
}

impl SpikeMux {
    pub fn new(num_ports: usize, per_pe_neurons: u64) -> Self {
        Self {
            num_ports,
            per_pe_neurons,
            max_queue_depth: 0,
            fwd_latency_cycles: 0,
            queues: vec![VecDeque::new(); num_ports],
            forwarded: 0,
            dropped: 0,
            queue_peak: 0,
        }
    }

    pub fn with_latency(mut self, cycles: Cycle, max_queue_depth: usize) -> Self {
        self.fwd_latency_cycles = cycles;
        self.max_queue_depth = max_queue_depth;
        self
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn queue_peak(&self) -> usize {
        self.queue_peak
    }

    /// The output port owning a spike's destination, if any.
    pub fn select_port(&self, spike: &Spike) -> Option<usize> {
        if self.per_pe_neurons == 0 || self.num_ports == 0 {
            return None;
        }
        let calculated = (spike.dst_neuron as u64 / self.per_pe_neurons) as usize;
        if calculated >= self.num_ports {
            return None;
        }
        Some(calculated)
    }

    /// Route one spike: forwarded pairs `(port, spike)` are appended to
    /// `out` immediately, or after the forwarding latency on a later
    /// [`tick`](Self::tick). Unroutable spikes and queue overflow are
    /// dropped with a count.
    pub fn route(&mut self, spike: Spike, now: Cycle, out: &mut Vec<(usize, Spike)>) {
        let Some(port) = self.select_port(&spike) else {
            warn!(
                "mux: no port for neuron {} (node {}), spike dropped",
                spike.dst_neuron, spike.dst_node
            );
            self.dropped += 1;
            return;
        };
        if self.fwd_latency_cycles == 0 {
            out.push((port, spike));
            self.forwarded += 1;
            return;
        }
        let queue = &mut self.queues[port];
        if self.max_queue_depth > 0 && queue.len() >= self.max_queue_depth {
            warn!("mux: port {} queue full, spike dropped", port);
            self.dropped += 1;
            return;
        }
        queue.push_back((now + self.fwd_latency_cycles, spike));
        self.queue_peak = self.queue_peak.max(queue.len());
    }

    /// Release everything whose forwarding latency has elapsed.
    pub fn tick(&mut self, now: Cycle, out: &mut Vec<(usize, Spike)>) {
        for (port, queue) in self.queues.iter_mut().enumerate() {
            while let Some(&(ready_at, spike)) = queue.front() {
                if ready_at > now {
                    break;
                }
                queue.pop_front();
                out.push((port, spike));
                self.forwarded += 1;
            }
        }
    }
}
