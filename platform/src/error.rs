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

use std::fmt;

/// Fatal construction-time and protocol errors.
///
/// Recoverable runtime events (dropped spikes, backpressure, unmatched
/// memory responses) are not errors; they are counted at the point where
/// they occur and the simulation continues.
#[derive(Debug, Eq, PartialEq)]
pub enum Error {
    InvalidConfiguration(String),
    InvalidShape(String),
    InvalidUnit(usize),
    RingTooSmall(usize),
    MalformedPayload(usize),
    FileRead(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidConfiguration(what) => {
                write!(f, "ERROR: Invalid configuration: {}", what)
            }
            Self::InvalidShape(shape) => {
                write!(f, "ERROR: Invalid topology shape \"{}\"", shape)
            }
            Self::InvalidUnit(unit) => write!(f, "ERROR: Invalid processing unit {}", unit),
            Self::RingTooSmall(nodes) => {
                write!(f, "ERROR: A ring requires at least 2 nodes, got {}", nodes)
            }
            Self::MalformedPayload(bytes) => {
                write!(f, "ERROR: Malformed wire payload of {} bytes", bytes)
            }
            Self::FileRead(path) => write!(f, "ERROR: Cannot read {}", path),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
