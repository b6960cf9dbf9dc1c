//! Builds one test binary per (benchmark, configuration) pair, runs each
//! binary repeatedly inside or outside a container sandbox, and keeps a log
//! per configuration plus build timing statistics.

pub mod bootstrap;
pub mod command;
pub mod config;
pub mod env;
pub mod error;
pub mod executor;
pub mod layout;
pub mod matrix;
pub mod options;
pub mod orchestrator;
pub mod sandbox;
pub mod scheduler;
pub mod session;
pub mod toolchain;

#[cfg(test)]
mod testing;

pub use bootstrap::{init, InitReport, DEFAULT_BENCHMARKS_FILE, DEFAULT_CONFIGURATIONS_FILE};
pub use command::CommandSpec;
pub use config::{load_matrix, normalize, render_matrix};
pub use error::MatrixError;
pub use executor::{Captured, CommandRunner, OutputSink, SystemRunner};
pub use layout::Layout;
pub use matrix::{parse_name_set, Benchmark, BuildStat, Configuration, Matrix};
pub use options::RunOptions;
pub use sandbox::{SandboxHandle, SandboxNeeds};
pub use scheduler::{BuildScheduler, BuildTask, Permutation, RandomPermutation, ShufflePolicy};
pub use session::{load, run, run_with, MatrixRequest, RunSummary};
