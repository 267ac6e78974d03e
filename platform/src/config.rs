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

use crate::error::Error;
use crate::Cycle;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Most cores a PE will host.
pub const MAX_CORES: usize = 64;
/// Most neurons a core will host.
pub const MAX_NEURONS_PER_CORE: usize = 1024;

/// LIF neuron parameters, shared by every neuron of a core.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct NeuronConfiguration {
    pub v_thresh: f32,
    pub v_reset: f32,
    pub v_rest: f32,
    /// Membrane time constant in milliseconds; the leak step is 1 ms.
    pub tau_mem: f32,
    /// Refractory window in cycles.
    pub t_ref: u32,
}

impl Default for NeuronConfiguration {
    fn default() -> Self {
        Self {
            v_thresh: 1.0,
            v_reset: 0.0,
            v_rest: 0.0,
            tau_mem: 20.0,
            t_ref: 2,
        }
    }
}

/// Virtual-channel parameters of the on-chip ring.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct RingConfiguration {
    /// Virtual channels per direction at each node.
    pub num_vcs: usize,
    /// Credits (buffer slots) per virtual channel.
    pub credits_per_vc: u32,
}

impl Default for RingConfiguration {
    fn default() -> Self {
        Self {
            num_vcs: 2,
            credits_per_vc: 8,
        }
    }
}

/// Synaptic weight fetch behavior of a core.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct WeightFetchConfiguration {
    /// Fetch weights from memory instead of relying on event weights.
    pub enable_weight_fetch: bool,
    /// On a cache miss, fall back to the event-carried weight instead of 0.
    pub use_event_weight_fallback: bool,
    /// Merge a miss into an aligned cache-line read.
    pub merge_read_cacheline: bool,
    /// Merge a miss into a full weight-matrix row read. Wins over the
    /// cache-line merge when both are set.
    pub merge_read_row: bool,
    pub line_size_bytes: u32,
    /// In-flight read cap per core; misses beyond it use the fallback.
    pub max_outstanding_requests: usize,
    /// Weight cache capacity; the cache is cleared wholesale on overflow.
    pub max_cache_entries: usize,
    /// First byte of this core's weight block in memory.
    pub base_addr: u64,
    /// Cycles to wait before the first memory access.
    pub memory_warmup_cycles: Cycle,
}

impl Default for WeightFetchConfiguration {
    fn default() -> Self {
        Self {
            enable_weight_fetch: false,
            use_event_weight_fallback: false,
            merge_read_cacheline: true,
            merge_read_row: false,
            line_size_bytes: 64,
            max_outstanding_requests: 16,
            max_cache_entries: 4096,
            base_addr: 0,
            memory_warmup_cycles: 1000,
        }
    }
}

/// Deterministic synthetic traffic emitted by a PE.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct TestTrafficConfiguration {
    pub enable_test_traffic: bool,
    /// Cycles between bursts.
    pub test_period: Cycle,
    pub test_spikes_per_burst: u32,
    /// Total spike budget; 0 means unlimited.
    pub test_max_spikes: u32,
    pub test_target_node: u32,
    pub test_weight: f32,
}

impl Default for TestTrafficConfiguration {
    fn default() -> Self {
        Self {
            enable_test_traffic: false,
            test_period: 100,
            test_spikes_per_burst: 4,
            test_max_spikes: 10,
            test_target_node: 0,
            test_weight: 0.2,
        }
    }
}

/// Startup weight verification: sample reads compared against an expected
/// constant.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct VerifyConfiguration {
    pub verify_weights: bool,
    pub weight_verify_samples: u32,
    pub expected_weight_value: f32,
    pub verify_epsilon: f32,
}

impl Default for VerifyConfiguration {
    fn default() -> Self {
        Self {
            verify_weights: false,
            weight_verify_samples: 16,
            expected_weight_value: 0.0,
            verify_epsilon: 1e-4,
        }
    }
}

/// Destination selection for spikes emitted by firing neurons.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FiringPolicyKind {
    /// The reference 16-node feed-forward mapping: input nodes 0-3 fan out
    /// to hidden nodes 4-11, hidden nodes fan in to output nodes 12-15,
    /// output nodes emit nothing.
    FeedForward16,
    /// Fired neurons emit no outbound spikes.
    Silent,
}

impl Default for FiringPolicyKind {
    fn default() -> Self {
        Self::FeedForward16
    }
}

/// Everything needed to build one PE.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PeConfiguration {
    pub node_id: u32,
    pub num_cores: usize,
    pub neurons_per_core: usize,
    /// First global neuron id owned by this PE.
    pub global_neuron_base: u64,
    #[serde(default)]
    pub neuron: NeuronConfiguration,
    #[serde(default)]
    pub ring: RingConfiguration,
    #[serde(default)]
    pub weight_fetch: WeightFetchConfiguration,
    #[serde(default)]
    pub test_traffic: TestTrafficConfiguration,
    #[serde(default)]
    pub verify: VerifyConfiguration,
    #[serde(default)]
    pub firing_policy: FiringPolicyKind,
}

impl Default for PeConfiguration {
    fn default() -> Self {
        Self {
            node_id: 0,
            num_cores: 4,
            neurons_per_core: 64,
            global_neuron_base: 0,
            neuron: NeuronConfiguration::default(),
            ring: RingConfiguration::default(),
            weight_fetch: WeightFetchConfiguration::default(),
            test_traffic: TestTrafficConfiguration::default(),
            verify: VerifyConfiguration::default(),
            firing_policy: FiringPolicyKind::default(),
        }
    }
}

impl PeConfiguration {
    pub fn total_neurons(&self) -> usize {
        self.num_cores * self.neurons_per_core
    }

    /// Reject configurations the hardware cannot express. Fatal at
    /// construction; nothing is range-checked again at runtime.
    pub fn validate(&self) -> Result<(), Error> {
        if self.num_cores == 0 || self.num_cores > MAX_CORES {
            return Err(Error::InvalidConfiguration(format!(
                "num_cores must be in 1..={}, got {}",
                MAX_CORES, self.num_cores
            )));
        }
        if self.neurons_per_core == 0 || self.neurons_per_core > MAX_NEURONS_PER_CORE {
            return Err(Error::InvalidConfiguration(format!(
                "neurons_per_core must be in 1..={}, got {}",
                MAX_NEURONS_PER_CORE, self.neurons_per_core
            )));
        }
        if self.ring.num_vcs == 0 {
            return Err(Error::InvalidConfiguration(
                "at least one virtual channel per direction is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TopologyType {
    Mesh2d,
    Torus2d,
}

/// Shape of the inter-PE network.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TopologyConfiguration {
    pub topology_type: TopologyType,
    /// "WxH", e.g. "4x4".
    pub topology_shape: String,
}

impl Default for TopologyConfiguration {
    fn default() -> Self {
        Self {
            topology_type: TopologyType::Mesh2d,
            topology_shape: "4x4".to_string(),
        }
    }
}

impl TopologyConfiguration {
    /// Parse the "WxH" shape string. Zero-sized axes are invalid.
    pub fn dimensions(&self) -> Result<(usize, usize), Error> {
        let mut parts = self.topology_shape.split('x');
        let parse = |part: Option<&str>| {
            part.and_then(|p| p.parse::<usize>().ok())
                .filter(|&d| d > 0)
        };
        match (parse(parts.next()), parse(parts.next()), parts.next()) {
            (Some(w), Some(h), None) => Ok((w, h)),
            _ => Err(Error::InvalidShape(self.topology_shape.clone())),
        }
    }
}

/// Top-level simulator configuration, read from YAML.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub topology: TopologyConfiguration,
    #[serde(default)]
    pub pe: PeConfiguration,
    /// Read latency of the memory model, in cycles.
    #[serde(default = "default_memory_latency")]
    pub memory_latency: Cycle,
}

fn default_memory_latency() -> Cycle {
    4
}

impl Default for Config {
    fn default() -> Self {
        Self {
            topology: TopologyConfiguration::default(),
            pe: PeConfiguration::default(),
            memory_latency: default_memory_latency(),
        }
    }
}

impl Config {
    pub fn from_file(file_name: &str) -> Self {
        let file = File::open(Path::new(file_name))
            .unwrap_or_else(|e| panic!("File {} not found. {:?}", file_name, e));
        let reader = BufReader::new(file);
        serde_yaml::from_reader(reader).unwrap()
    }

    pub fn from_str(config: &str) -> Self {
        serde_yaml::from_str(config).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_yaml_config() {
        let conf_str = "---
topology:
  topology_type: torus2d
  topology_shape: 4x4
pe:
  node_id: 0
  num_cores: 4
  neurons_per_core: 4
  global_neuron_base: 0
  neuron:
    v_thresh: 1.0
    v_reset: 0.0
    v_rest: 0.0
    tau_mem: 20.0
    t_ref: 2
  ring:
    num_vcs: 2
    credits_per_vc: 8
memory_latency: 2
";
        let config = Config::from_str(conf_str);
        assert_eq!(config.topology.topology_type, TopologyType::Torus2d);
        assert_eq!(config.topology.dimensions().unwrap(), (4, 4));
        assert_eq!(config.pe.num_cores, 4);
        assert_eq!(config.pe.neurons_per_core, 4);
        assert_eq!(config.pe.total_neurons(), 16);
        assert_eq!(config.pe.ring.credits_per_vc, 8);
        assert_eq!(config.pe.firing_policy, FiringPolicyKind::FeedForward16);
        assert_eq!(config.memory_latency, 2);
        config.pe.validate().unwrap();
    }

    #[test]
    fn write_yaml_config() {
        let config = Config::default();
        let text = serde_yaml::to_string(&config).unwrap();
        let back = Config::from_str(&text);
        assert_eq!(back.pe.num_cores, config.pe.num_cores);
        assert_eq!(back.topology.topology_shape, "4x4");
    }

    #[test]
    fn core_count_bounds() {
        let mut pe = PeConfiguration::default();
        pe.validate().unwrap();
        pe.num_cores = 0;
        assert!(matches!(pe.validate(), Err(Error::InvalidConfiguration(_))));
        pe.num_cores = MAX_CORES + 1;
        assert!(matches!(pe.validate(), Err(Error::InvalidConfiguration(_))));
        pe.num_cores = MAX_CORES;
        pe.neurons_per_core = MAX_NEURONS_PER_CORE + 1;
        assert!(matches!(pe.validate(), Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn shape_parsing() {
        let mut topo = TopologyConfiguration::default();
        assert_eq!(topo.dimensions().unwrap(), (4, 4));
        topo.topology_shape = "8x2".to_string();
        assert_eq!(topo.dimensions().unwrap(), (8, 2));
        for bad in ["", "4", "4x", "x4", "0x4", "4x4x4", "axb"] {
            topo.topology_shape = bad.to_string();
            assert!(topo.dimensions().is_err(), "shape {:?} should fail", bad);
        }
    }
}
