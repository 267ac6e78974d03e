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

/// Hop budget for a spike; a spike that arrives with this many hops is
/// dropped instead of being delivered or forwarded again.
pub const MAX_HOPS: u32 = 10;

/// Size of the inter-PE wire encoding of a spike, in bytes.
pub const WIRE_BYTES: usize = 28;

/// A single spike traveling between neurons.
///
/// Spikes are plain values: created by a firing neuron, a dataset replay, or
/// the test-traffic generator, owned by exactly one queue or in-flight slot,
/// and consumed on delivery or drop.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Spike {
    /// Global id of the neuron that fired.
    pub src_neuron: u32,
    /// Global id of the post-synaptic neuron.
    pub dst_neuron: u32,
    /// PE that owns the destination neuron.
    pub dst_node: u32,
    /// Synaptic weight carried with the event. Cores configured for memory
    /// weight fetch may ignore this in favor of the weight matrix.
    pub weight: f32,
    /// Cycle at which the spike was created.
    pub timestamp: Cycle,
    /// Number of PE-to-PE hops taken so far.
    pub hop_count: u32,
}

impl Spike {
    pub fn new(src_neuron: u32, dst_neuron: u32, dst_node: u32, weight: f32, timestamp: Cycle) -> Self {
        Self {
            src_neuron,
            dst_neuron,
            dst_node,
            weight,
            timestamp,
            hop_count: 0,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.hop_count >= MAX_HOPS
    }

    /// Encode into the little-endian wire layout carried by inter-PE
    /// packets: three u32 ids, an f32 weight, a u64 timestamp, and the u32
    /// hop count, 28 bytes total.
    pub fn encode(&self) -> [u8; WIRE_BYTES] {
        let mut bytes = [0u8; WIRE_BYTES];
        bytes[0..4].copy_from_slice(&self.src_neuron.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.dst_neuron.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.dst_node.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.weight.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.hop_count.to_le_bytes());
        bytes
    }

    /// Decode a wire payload. Anything that is not exactly [`WIRE_BYTES`]
    /// long is malformed and reported to the caller, which drops the packet
    /// and counts it.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != WIRE_BYTES {
            return Err(Error::MalformedPayload(bytes.len()));
        }
        let u32_at = |at: usize| u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
        Ok(Self {
            src_neuron: u32_at(0),
            dst_neuron: u32_at(4),
            dst_node: u32_at(8),
            weight: f32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            timestamp: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            hop_count: u32_at(24),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_layout_is_byte_exact() {
        let spike = Spike {
            src_neuron: 7,
            dst_neuron: 42,
            dst_node: 3,
            weight: 0.25,
            timestamp: 1000,
            hop_count: 2,
        };
        let bytes = spike.encode();
        assert_eq!(
            bytes,
            [
                0x07, 0x00, 0x00, 0x00, // src_neuron
                0x2a, 0x00, 0x00, 0x00, // dst_neuron
                0x03, 0x00, 0x00, 0x00, // dst_node
                0x00, 0x00, 0x80, 0x3e, // weight = 0.25
                0xe8, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // timestamp = 1000
                0x02, 0x00, 0x00, 0x00, // hop_count
            ]
        );
    }

    #[test]
    fn wire_round_trip() {
        let spike = Spike {
            src_neuron: u32::MAX,
            dst_neuron: 0,
            dst_node: 15,
            weight: -1.5e-3,
            timestamp: u64::MAX,
            hop_count: 9,
        };
        let decoded = Spike::decode(&spike.encode()).unwrap();
        assert_eq!(decoded, spike);
        assert_eq!(decoded.weight.to_bits(), spike.weight.to_bits());
    }

    #[test]
    fn short_and_long_payloads_are_malformed() {
        assert_eq!(Spike::decode(&[0u8; 27]), Err(Error::MalformedPayload(27)));
        assert_eq!(Spike::decode(&[0u8; 29]), Err(Error::MalformedPayload(29)));
        assert_eq!(Spike::decode(&[]), Err(Error::MalformedPayload(0)));
    }

    #[test]
    fn hop_budget() {
        let mut spike = Spike::new(0, 1, 0, 1.0, 0);
        assert!(!spike.is_expired());
        spike.hop_count = MAX_HOPS - 1;
        assert!(!spike.is_expired());
        spike.hop_count = MAX_HOPS;
        assert!(spike.is_expired());
    }
}
