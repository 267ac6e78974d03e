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

use bencher::Bencher;
use bencher::{benchmark_group, benchmark_main};

use platform::{Ring, RingMessage, Spike};

const NODES: usize = 8;

fn ring_forward(bench: &mut Bencher) {
    let mut ring = Ring::new(NODES, 2, 8).unwrap();
    let mut cycle = 0u64;
    bench.iter(|| {
        cycle += 1;
        for src in 0..NODES {
            let dst = (src + 3) % NODES;
            let spike = Spike::new(src as u32, dst as u32, 0, 0.5, cycle);
            let _ = ring.send_message(src, dst, RingMessage::spike(src, dst, spike), 1);
        }
        ring.tick(cycle);
        for node in 0..NODES {
            while ring.receive_message(node).is_some() {}
        }
    });
}

fn ring_contended(bench: &mut Bencher) {
    // Single credit per VC: most sends hit backpressure.
    let mut ring = Ring::new(NODES, 1, 1).unwrap();
    let mut cycle = 0u64;
    bench.iter(|| {
        cycle += 1;
        for src in 0..NODES {
            let dst = (src + NODES / 2) % NODES;
            let spike = Spike::new(src as u32, dst as u32, 0, 0.5, cycle);
            let _ = ring.send_message(src, dst, RingMessage::spike(src, dst, spike), 0);
        }
        ring.tick(cycle);
        for node in 0..NODES {
            while ring.receive_message(node).is_some() {}
        }
    });
}

benchmark_group!(benches, ring_forward, ring_contended);
benchmark_main!(benches);
