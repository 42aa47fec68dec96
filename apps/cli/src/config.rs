// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Run configuration shared by all subcommands.

use std::path::PathBuf;

use city_lite_processing::CopierConfig;
use clap::Args;

/// Arguments every subcommand accepts.
#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Input documents (JSON lines)
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Directory the processed documents are written to
    #[arg(short, long)]
    pub output: PathBuf,

    /// Copy referenced texture images and library objects next to the output
    #[arg(long)]
    pub copy_resources: bool,

    /// Print per-document statistics as JSON
    #[arg(long)]
    pub json: bool,

    /// Resource copy worker threads (default: number of CPUs)
    #[arg(long, env = "CITY_LITE_WORKERS")]
    pub workers: Option<usize>,

    /// Capacity of the resource copy queue
    #[arg(long, env = "CITY_LITE_QUEUE", default_value_t = 64)]
    pub queue: usize,
}

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub inputs: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub copy_resources: bool,
    pub json: bool,
    pub copier: CopierConfig,
}

impl Config {
    pub fn from_args(args: CommonArgs) -> Self {
        Self {
            inputs: args.inputs,
            output_dir: args.output,
            copy_resources: args.copy_resources,
            json: args.json,
            copier: CopierConfig {
                workers: args.workers.unwrap_or_else(num_cpus::get).max(1),
                queue: args.queue.max(1),
            },
        }
    }

    /// Where the processed copy of `input` is written.
    pub fn output_path(&self, input: &std::path::Path) -> PathBuf {
        match input.file_name() {
            Some(name) => self.output_dir.join(name),
            None => self.output_dir.join("output.jsonl"),
        }
    }
}
