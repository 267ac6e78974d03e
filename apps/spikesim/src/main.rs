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

//! Command-line driver for the SNN fabric simulator: build the configured
//! mesh or torus of PEs, optionally load weights and a spike dataset, run
//! for a fixed number of cycles, and print the per-node summaries.

use platform::{Config, Fabric, SpikeSource, WeightFormat, WeightLoader};
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "spikesim", about = "A multi-core SNN fabric simulator")]
struct Opt {
    /// YAML configuration file; defaults apply when omitted.
    #[structopt(short, long)]
    config: Option<PathBuf>,

    /// Number of cycles to simulate.
    #[structopt(short = "n", long, default_value = "100000")]
    cycles: u64,

    /// TEXT spike dataset replayed into the fabric.
    #[structopt(short, long)]
    dataset: Option<PathBuf>,

    /// Packed binary weight file, loaded per node.
    #[structopt(short, long)]
    weights: Option<PathBuf>,

    /// Constant weight written everywhere when no file is given.
    #[structopt(long)]
    fill_weight: Option<f32>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let config = match &opt.config {
        Some(path) => Config::from_file(&path.display().to_string()),
        None => Config::default(),
    };
    config.pe.validate()?;

    let mut fabric = Fabric::new(&config)?;
    log::info!(
        "fabric up: {} nodes, {} links, {} cycles requested",
        fabric.node_count(),
        fabric.link_count(),
        opt.cycles
    );

    if opt.weights.is_some() || opt.fill_weight.is_some() {
        let n = config.pe.neurons_per_core;
        let stride = (n * n * 4) as u64;
        for node in 0..fabric.node_count() {
            let mut port = fabric.weight_port(node);
            let mut loader = WeightLoader::new(
                config.pe.weight_fetch.base_addr,
                stride,
                config.pe.num_cores,
                n,
                opt.fill_weight.unwrap_or(0.5),
            );
            match &opt.weights {
                Some(path) => {
                    loader.load_single_file(path, WeightFormat::Binary, &mut port)?
                }
                None => loader.fill(&mut port),
            }
        }
    }

    if let Some(path) = &opt.dataset {
        let source = SpikeSource::from_text_file(
            path,
            config.pe.total_neurons() as u32,
            1.0,
            0,
            0,
        )?;
        log::info!("dataset: {} events", source.events_loaded());
        fabric.set_source(source);
    }

    fabric.run(opt.cycles);

    let report = fabric.finish();
    log::info!(
        "done after {} cycles: {} spikes processed, {} neurons fired, {} unroutable",
        fabric.cycle(),
        report.spikes_processed,
        report.neurons_fired,
        report.unroutable_drops
    );
    Ok(())
}
