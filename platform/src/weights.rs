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

//! Loads synaptic weight matrices into memory through the request channel.
//!
//! Three sources: a single packed binary file holding every core's `N x N`
//! block back to back, per-core binary files named by a `{core}` /
//! `{core:02d}` template, or whitespace-separated text. Short inputs are
//! padded with the fill value; writes are posted, one element at a time.

use crate::error::Error;
use crate::memory::{MemoryChannel, MemoryRequest, RequestId};
use log::{debug, warn};
use std::path::Path;

const BYTES_PER_WEIGHT: u64 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WeightFormat {
    /// Tightly packed little-endian f32 array.
    Binary,
    /// Whitespace-separated decimal floats.
    Text,
}

pub struct WeightLoader {
    base_addr_start: u64,
    per_core_stride: u64,
    num_cores: usize,
    neurons_per_core: usize,
    fill_value: f32,
    row_major: bool,
    validate_length: bool,
    /// Skip this many per-core blocks at the front of a single file.
    file_core_offset: usize,
    next_request_id: RequestId,
    writes_issued: u64,
}

impl WeightLoader {
    pub fn new(
        base_addr_start: u64,
        per_core_stride: u64,
        num_cores: usize,
        neurons_per_core: usize,
        fill_value: f32,
    ) -> Self {
        Self {
            base_addr_start,
            per_core_stride,
            num_cores,
            neurons_per_core,
            fill_value,
            row_major: true,
            validate_length: true,
            file_core_offset: 0,
            next_request_id: 1,
            writes_issued: 0,
        }
    }

    pub fn column_major(mut self) -> Self {
        self.row_major = false;
        self
    }

    pub fn with_file_core_offset(mut self, cores: usize) -> Self {
        self.file_core_offset = cores;
        self
    }

    pub fn without_length_check(mut self) -> Self {
        self.validate_length = false;
        self
    }

    pub fn writes_issued(&self) -> u64 {
        self.writes_issued
    }

    /// One packed file carries `num_cores` consecutive `N x N` blocks,
    /// starting `file_core_offset` blocks in.
    pub fn load_single_file(
        &mut self,
        path: &Path,
        format: WeightFormat,
        memory: &mut dyn MemoryChannel,
    ) -> Result<(), Error> {
        let all = Self::read_file_floats(path, format)?;
        let per_core = self.neurons_per_core * self.neurons_per_core;
        let mut offset = self.file_core_offset * per_core;
        for core in 0..self.num_cores {
            let slice = if offset < all.len() {
                &all[offset..all.len().min(offset + per_core)]
            } else {
                &[]
            };
            self.write_core(core, slice, memory);
            offset += per_core;
        }
        debug!(
            "weights: loaded {} for {} cores ({} writes)",
            path.display(),
            self.num_cores,
            self.writes_issued
        );
        Ok(())
    }

    /// One file per core, named by substituting `{core:02d}` or `{core}`
    /// in the template. A missing file falls back to the fill value.
    pub fn load_per_core_files(
        &mut self,
        template: &str,
        format: WeightFormat,
        memory: &mut dyn MemoryChannel,
    ) -> Result<(), Error> {
        for core in 0..self.num_cores {
            let path = Self::expand_template(template, core);
            match Self::read_file_floats(Path::new(&path), format) {
                Ok(floats) => self.write_core(core, &floats, memory),
                Err(_) => {
                    warn!("weights: no file {} for core {}, using fill", path, core);
                    self.write_core(core, &[], memory);
                }
            }
        }
        debug!(
            "weights: per-core template {} done ({} writes)",
            template, self.writes_issued
        );
        Ok(())
    }

    /// No file at all: every cell gets the fill value.
    pub fn fill(&mut self, memory: &mut dyn MemoryChannel) {
        for core in 0..self.num_cores {
            self.write_core(core, &[], memory);
        }
    }

    fn expand_template(template: &str, core: usize) -> String {
        if template.contains("{core:02d}") {
            template.replace("{core:02d}", &format!("{:02}", core))
        } else {
            template.replace("{core}", &core.to_string())
        }
    }

    fn read_file_floats(path: &Path, format: WeightFormat) -> Result<Vec<f32>, Error> {
        match format {
            WeightFormat::Binary => {
                let bytes = std::fs::read(path)
                    .map_err(|_| Error::FileRead(path.display().to_string()))?;
                if bytes.is_empty() || bytes.len() % BYTES_PER_WEIGHT as usize != 0 {
                    return Err(Error::FileRead(path.display().to_string()));
                }
                Ok(bytes
                    .chunks_exact(BYTES_PER_WEIGHT as usize)
                    .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
                    .collect())
            }
            WeightFormat::Text => {
                let text = std::fs::read_to_string(path)
                    .map_err(|_| Error::FileRead(path.display().to_string()))?;
                let floats: Vec<f32> = text
                    .split_whitespace()
                    .filter_map(|token| token.parse::<f32>().ok())
                    .collect();
                if floats.is_empty() {
                    return Err(Error::FileRead(path.display().to_string()));
                }
                Ok(floats)
            }
        }
    }

    /// Write one core's `N x N` block element by element, padding short
    /// input with the fill value.
    fn write_core(&mut self, core: usize, floats: &[f32], memory: &mut dyn MemoryChannel) {
        let n = self.neurons_per_core;
        let expected = n * n;
        if self.validate_length && !floats.is_empty() && floats.len() < expected {
            warn!(
                "weights: core {} input short ({} < {}), padding with {}",
                core,
                floats.len(),
                expected,
                self.fill_value
            );
        }
        let base = self.base_addr_start + core as u64 * self.per_core_stride;
        for pre in 0..n {
            for post in 0..n {
                let index = if self.row_major {
                    pre * n + post
                } else {
                    post * n + pre
                };
                let value = floats.get(index).copied().unwrap_or(self.fill_value);
                let addr = base + (pre * n + post) as u64 * BYTES_PER_WEIGHT;
                let id = self.next_request_id;
                self.next_request_id += 1;
                memory.send(MemoryRequest::Write {
                    id,
                    addr,
                    data: value.to_le_bytes().to_vec(),
                    posted: true,
                });
                self.writes_issued += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryPort, MemoryStore};
    use std::io::Write;
    use std::rc::Rc;

    fn write_file(name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        path
    }

    fn matrix_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn read_cell(store: &Rc<std::cell::RefCell<MemoryStore>>, base: u64, n: u64, pre: u64, post: u64) -> f32 {
        let bytes = store.borrow().read(base + (pre * n + post) * 4, 4);
        f32::from_le_bytes(bytes.try_into().unwrap())
    }

    #[test]
    fn single_binary_file_round_trips() {
        // Two cores of 2x2, packed back to back.
        let values: Vec<f32> = (0..8).map(|i| i as f32 * 0.125).collect();
        let path = write_file("platform_weights_single.bin", &matrix_bytes(&values));

        let store = MemoryStore::shared();
        let mut port = MemoryPort::new(Rc::clone(&store), 0);
        let mut loader = WeightLoader::new(0x100, 16, 2, 2, 9.0);
        loader
            .load_single_file(&path, WeightFormat::Binary, &mut port)
            .unwrap();
        assert_eq!(loader.writes_issued(), 8);

        for core in 0..2u64 {
            for pre in 0..2u64 {
                for post in 0..2u64 {
                    let expected = values[(core * 4 + pre * 2 + post) as usize];
                    let got = read_cell(&store, 0x100 + core * 16, 2, pre, post);
                    assert_eq!(got.to_bits(), expected.to_bits());
                }
            }
        }
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn file_core_offset_skips_blocks() {
        let values: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let path = write_file("platform_weights_offset.bin", &matrix_bytes(&values));
        let store = MemoryStore::shared();
        let mut port = MemoryPort::new(Rc::clone(&store), 0);
        let mut loader = WeightLoader::new(0, 16, 1, 2, 0.0).with_file_core_offset(1);
        loader
            .load_single_file(&path, WeightFormat::Binary, &mut port)
            .unwrap();
        // Core 0 got the second block.
        assert_eq!(read_cell(&store, 0, 2, 0, 0), 4.0);
        assert_eq!(read_cell(&store, 0, 2, 1, 1), 7.0);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn per_core_template_expansion() {
        assert_eq!(
            WeightLoader::expand_template("w_{core}.bin", 3),
            "w_3.bin"
        );
        assert_eq!(
            WeightLoader::expand_template("w_{core:02d}.bin", 3),
            "w_03.bin"
        );
    }

    #[test]
    fn per_core_files_with_missing_fallback() {
        let dir = std::env::temp_dir();
        let path0 = dir.join("platform_weights_core0.bin");
        std::fs::write(&path0, matrix_bytes(&[1.0, 2.0, 3.0, 4.0])).unwrap();
        // Core 1's file does not exist; it gets the fill value.
        let template = dir
            .join("platform_weights_core{core}.bin")
            .display()
            .to_string();

        let store = MemoryStore::shared();
        let mut port = MemoryPort::new(Rc::clone(&store), 0);
        let mut loader = WeightLoader::new(0, 16, 2, 2, 0.5);
        loader
            .load_per_core_files(&template, WeightFormat::Binary, &mut port)
            .unwrap();
        assert_eq!(read_cell(&store, 0, 2, 0, 1), 2.0);
        assert_eq!(read_cell(&store, 16, 2, 0, 0), 0.5);
        assert_eq!(read_cell(&store, 16, 2, 1, 1), 0.5);
        std::fs::remove_file(path0).unwrap();
    }

    #[test]
    fn text_format_and_padding() {
        let path = write_file("platform_weights_text.txt", b"0.25 0.5\n0.75");
        let store = MemoryStore::shared();
        let mut port = MemoryPort::new(Rc::clone(&store), 0);
        let mut loader = WeightLoader::new(0, 0, 1, 2, 9.0);
        loader
            .load_single_file(&path, WeightFormat::Text, &mut port)
            .unwrap();
        assert_eq!(read_cell(&store, 0, 2, 0, 0), 0.25);
        assert_eq!(read_cell(&store, 0, 2, 0, 1), 0.5);
        assert_eq!(read_cell(&store, 0, 2, 1, 0), 0.75);
        // Short input: the last cell is padding.
        assert_eq!(read_cell(&store, 0, 2, 1, 1), 9.0);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn column_major_transposes() {
        let path = write_file(
            "platform_weights_colmajor.bin",
            &matrix_bytes(&[1.0, 2.0, 3.0, 4.0]),
        );
        let store = MemoryStore::shared();
        let mut port = MemoryPort::new(Rc::clone(&store), 0);
        let mut loader = WeightLoader::new(0, 0, 1, 2, 0.0).column_major();
        loader
            .load_single_file(&path, WeightFormat::Binary, &mut port)
            .unwrap();
        assert_eq!(read_cell(&store, 0, 2, 0, 1), 3.0);
        assert_eq!(read_cell(&store, 0, 2, 1, 0), 2.0);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn truncated_binary_is_rejected() {
        let path = write_file("platform_weights_bad.bin", &[1, 2, 3]);
        assert!(matches!(
            WeightLoader::read_file_floats(&path, WeightFormat::Binary),
            Err(Error::FileRead(_))
        ));
        std::fs::remove_file(path).unwrap();
    }
}
