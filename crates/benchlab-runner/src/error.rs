use std::path::PathBuf;

use thiserror::Error;

/// Problems with the requested matrix or the working directory that make a
/// run impossible. Everything else that goes wrong during a run is recorded
/// as a per-task failure instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatrixError {
    #[error("benchmark(s) {} requested but not declared in {}", .names.join(", "), .file)]
    UnknownBenchmarks { names: Vec<String>, file: String },
    #[error("configuration(s) {} requested but not declared in {}", .names.join(", "), .file)]
    UnknownConfigurations { names: Vec<String>, file: String },
    #[error("shuffle level ought to be between 0 and 3, inclusive, instead is {0}")]
    InvalidShuffle(u8),
    #[error("benchmark {0} has an empty Repo")]
    EmptyRepo(String),
    #[error(
        "building/running tests will trash {}; remove, rename or run in another directory",
        .0.display()
    )]
    UnsafeDirectory(PathBuf),
    #[error("missing 'Dockerfile', run `benchlab init` if you intend to use this directory")]
    NotInitialized,
    #[error("directory already initialized ({} exists); remove it to re-initialize", .0.display())]
    AlreadyInitialized(PathBuf),
}
