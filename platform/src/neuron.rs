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

use crate::config::NeuronConfiguration;
use crate::Cycle;

/// LIF dynamics shared by every neuron of a core.
#[derive(Clone, Copy, Debug)]
pub struct LifParameters {
    pub v_thresh: f32,
    pub v_reset: f32,
    pub v_rest: f32,
    pub tau_mem: f32,
    pub t_ref: u32,
}

impl From<NeuronConfiguration> for LifParameters {
    fn from(config: NeuronConfiguration) -> Self {
        Self {
            v_thresh: config.v_thresh,
            v_reset: config.v_reset,
            v_rest: config.v_rest,
            tau_mem: config.tau_mem,
            t_ref: config.t_ref,
        }
    }
}

/// Per-neuron mutable state.
#[derive(Clone, Copy, Debug)]
pub struct NeuronState {
    pub v_mem: f32,
    pub refractory_timer: u32,
    pub last_spike_cycle: Cycle,
}

impl NeuronState {
    pub fn new(v_rest: f32) -> Self {
        Self {
            v_mem: v_rest,
            refractory_timer: 0,
            last_spike_cycle: 0,
        }
    }

    pub fn is_refractory(&self) -> bool {
        self.refractory_timer > 0
    }

    /// Exponential decay toward the rest potential, one 1 ms step.
    pub fn leak(&mut self, params: &LifParameters) {
        if self.v_mem > params.v_rest {
            self.v_mem =
                params.v_rest + (self.v_mem - params.v_rest) * (-1.0 / params.tau_mem).exp();
        }
    }

    pub fn integrate(&mut self, weight: f32) {
        self.v_mem += weight;
    }

    /// Fire if the membrane crossed the threshold and the neuron is not in
    /// its refractory window. On fire the membrane is reset exactly to
    /// `v_reset` and the full refractory window starts.
    pub fn try_fire(&mut self, params: &LifParameters, cycle: Cycle) -> bool {
        if self.v_mem >= params.v_thresh && self.refractory_timer == 0 {
            self.v_mem = params.v_reset;
            self.refractory_timer = params.t_ref;
            self.last_spike_cycle = cycle;
            true
        } else {
            false
        }
    }
}
