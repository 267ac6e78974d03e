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

//! Request/response channel to the memory hierarchy.
//!
//! The hierarchy itself is outside the simulated PE; cores and the weight
//! loader only ever see the [`MemoryChannel`] trait. [`MemoryPort`] is the
//! in-process model used by tests and the simulator binary: a byte store
//! shared between ports, with a fixed response latency per port.

use crate::Cycle;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

pub type RequestId = u64;

#[derive(Clone, Debug, PartialEq)]
pub enum MemoryRequest {
    Read {
        id: RequestId,
        addr: u64,
        size: usize,
    },
    Write {
        id: RequestId,
        addr: u64,
        data: Vec<u8>,
        /// Posted writes complete silently; no response is generated.
        posted: bool,
    },
}

impl MemoryRequest {
    pub fn id(&self) -> RequestId {
        match self {
            Self::Read { id, .. } | Self::Write { id, .. } => *id,
        }
    }
}

/// Responses carry the request id for correlation; arrival order is a
/// property of the channel implementation, not a contract.
#[derive(Clone, Debug, PartialEq)]
pub enum MemoryResponse {
    ReadResp { id: RequestId, data: Vec<u8> },
    WriteResp { id: RequestId },
}

impl MemoryResponse {
    pub fn id(&self) -> RequestId {
        match self {
            Self::ReadResp { id, .. } | Self::WriteResp { id } => *id,
        }
    }
}

/// One core's view of the memory hierarchy.
pub trait MemoryChannel {
    fn send(&mut self, request: MemoryRequest);
    /// Pop the next response that has become available, if any.
    fn poll(&mut self) -> Option<MemoryResponse>;
    /// Advance the channel to `cycle`.
    fn tick(&mut self, cycle: Cycle);
}

/// Flat byte store backing one PE's weight memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    bytes: Vec<u8>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Byte-addressed read; bytes beyond the written extent read as zero.
    pub fn read(&self, addr: u64, size: usize) -> Vec<u8> {
        let start = addr as usize;
        let mut data = vec![0u8; size];
        if start < self.bytes.len() {
            let available = (self.bytes.len() - start).min(size);
            data[..available].copy_from_slice(&self.bytes[start..start + available]);
        }
        data
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) {
        let start = addr as usize;
        let end = start + data.len();
        if self.bytes.len() < end {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Fixed-latency port onto a shared [`MemoryStore`].
///
/// Writes take effect immediately (the store is the point of coherence);
/// only the response is delayed. Each core owns its own port, so in-flight
/// windows never mix between cores.
pub struct MemoryPort {
    store: Rc<RefCell<MemoryStore>>,
    latency: Cycle,
    now: Cycle,
    in_flight: VecDeque<(Cycle, MemoryResponse)>,
}

impl MemoryPort {
    pub fn new(store: Rc<RefCell<MemoryStore>>, latency: Cycle) -> Self {
        Self {
            store,
            latency,
            now: 0,
            in_flight: VecDeque::new(),
        }
    }
}

impl MemoryChannel for MemoryPort {
    fn send(&mut self, request: MemoryRequest) {
        let ready_at = self.now + self.latency;
        match request {
            MemoryRequest::Read { id, addr, size } => {
                let data = self.store.borrow().read(addr, size);
                self.in_flight
                    .push_back((ready_at, MemoryResponse::ReadResp { id, data }));
            }
            MemoryRequest::Write {
                id,
                addr,
                data,
                posted,
            } => {
                self.store.borrow_mut().write(addr, &data);
                if !posted {
                    self.in_flight
                        .push_back((ready_at, MemoryResponse::WriteResp { id }));
                }
            }
        }
    }

    fn poll(&mut self) -> Option<MemoryResponse> {
        match self.in_flight.front() {
            Some((ready_at, _)) if *ready_at <= self.now => {
                self.in_flight.pop_front().map(|(_, response)| response)
            }
            _ => None,
        }
    }

    fn tick(&mut self, cycle: Cycle) {
        self.now = cycle;
    }
}
