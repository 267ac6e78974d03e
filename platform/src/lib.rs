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

//! Cycle-driven simulation of multi-core spiking-neural-network processing
//! elements (PEs) and their interconnect.
//!
//! A PE hosts a set of leaky-integrate-and-fire neuron cores, an on-chip
//! bidirectional ring with credit-controlled virtual channels, and a network
//! adapter that ships spikes across a 2-D mesh or torus of PEs. All
//! components advance on one shared clock; a [`Fabric`] steps links, PEs,
//! cores, and rings by one cycle per call.

mod adapter;
mod balance;
mod config;
mod core;
mod error;
mod fabric;
mod memory;
mod neuron;
mod pe;
mod ring;
mod source;
mod spike;
mod topology;
mod weights;

// Public types
// type to use for cycles
pub type Cycle = u64;

pub use crate::adapter::{
    AdapterStatistics, NetworkAdapter, NetworkRequest, PacketNetwork, PENDING_SPIKE_DEPTH,
};
pub use crate::balance::LoadController;
pub use crate::config::{
    Config, FiringPolicyKind, NeuronConfiguration, PeConfiguration, RingConfiguration,
    TestTrafficConfiguration, TopologyConfiguration, TopologyType, VerifyConfiguration,
    WeightFetchConfiguration,
};
pub use crate::core::{CoreStatistics, FiringPolicy, NeuronCore};
pub use crate::error::Error;
pub use crate::fabric::{Fabric, FabricReport};
pub use crate::memory::{
    MemoryChannel, MemoryPort, MemoryRequest, MemoryResponse, MemoryStore, RequestId,
};
pub use crate::neuron::{LifParameters, NeuronState};
pub use crate::pe::{Pe, PeStatistics, ProcessingUnitState};
pub use crate::ring::{
    Ring, RingMessage, RingNodeStatistics, RingPayload, RouteDirection, VcState, VirtualChannel,
};
pub use crate::source::{SpikeMux, SpikeSource};
pub use crate::spike::{Spike, MAX_HOPS, WIRE_BYTES};
pub use crate::topology::{Direction, TopologyHandler};
pub use crate::weights::{WeightFormat, WeightLoader};
