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

use log::debug;

/// EMA smoothing factor for per-core utilization.
const SMOOTHING: f64 = 0.1;
/// Smoothed-spread threshold below which a rebalance request is ignored.
const BALANCE_THRESHOLD: f64 = 0.2;
/// Fraction of the most loaded unit's work counter moved per rebalance.
const TRANSFER_DIVISOR: u64 = 10;

/// Tracks smoothed per-core load and redistributes work counters.
///
/// Rebalancing is a hint channel: the counters shift, no live neuron state
/// migrates.
pub struct LoadController {
    utilization: Vec<f64>,
    work: Vec<u64>,
    rebalances: u64,
}

impl LoadController {
    pub fn new(num_cores: usize) -> Self {
        Self {
            utilization: vec![0.0; num_cores],
            work: vec![0; num_cores],
            rebalances: 0,
        }
    }

    /// Fold this cycle's raw utilization samples into the moving averages.
    pub fn tick(&mut self, raw_utilization: &[f64]) {
        for (smoothed, &raw) in self.utilization.iter_mut().zip(raw_utilization) {
            *smoothed = SMOOTHING * raw + (1.0 - SMOOTHING) * *smoothed;
        }
    }

    /// Attribute one unit of work (a processed spike) to a core.
    pub fn note_work(&mut self, core: usize) {
        if let Some(count) = self.work.get_mut(core) {
            *count += 1;
        }
    }

    pub fn smoothed_utilization(&self, core: usize) -> f64 {
        self.utilization.get(core).copied().unwrap_or(0.0)
    }

    pub fn overall_utilization(&self) -> f64 {
        if self.utilization.is_empty() {
            return 0.0;
        }
        self.utilization.iter().sum::<f64>() / self.utilization.len() as f64
    }

    pub fn most_loaded(&self) -> usize {
        self.extreme(|a, b| a > b)
    }

    pub fn least_loaded(&self) -> usize {
        self.extreme(|a, b| a < b)
    }

    fn extreme(&self, better: impl Fn(f64, f64) -> bool) -> usize {
        let mut pick = 0;
        for core in 1..self.utilization.len() {
            if better(self.utilization[core], self.utilization[pick]) {
                pick = core;
            }
        }
        pick
    }

    pub fn work_count(&self, core: usize) -> u64 {
        self.work.get(core).copied().unwrap_or(0)
    }

    pub fn rebalances(&self) -> u64 {
        self.rebalances
    }

    /// Move 10% of the most loaded unit's work counter to the least loaded
    /// one, provided the smoothed spread exceeds the controller threshold.
    pub fn balance_load(&mut self) {
        let most = self.most_loaded();
        let least = self.least_loaded();
        if most == least {
            return;
        }
        let spread = self.utilization[most] - self.utilization[least];
        if spread <= BALANCE_THRESHOLD {
            return;
        }
        let transfer = self.work[most] / TRANSFER_DIVISOR;
        self.work[most] -= transfer;
        self.work[least] += transfer;
        self.rebalances += 1;
        debug!(
            "load balance: core {} ({:.2}) -> core {} ({:.2}), moved {} work units",
            most, self.utilization[most], least, self.utilization[least], transfer
        );
    }
}
