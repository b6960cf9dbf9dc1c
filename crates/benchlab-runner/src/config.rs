use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

use crate::env;
use crate::error::MatrixError;
use crate::matrix::Matrix;

/// Pattern handed to `-test.run=` / `-test.bench=` to select nothing.
pub const MATCH_NOTHING: &str = "none";

/// Flags that reshape the declared matrix before anything runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeOptions {
    /// Run tests instead of benchmarks.
    pub test_mode: bool,
    /// Run every benchmark outside the sandbox.
    pub no_sandbox: bool,
    /// Keep only what can run inside the sandbox.
    pub require_sandbox: bool,
    /// Whether the host can run sandbox binaries natively.
    pub host_is_linux: bool,
}

/// Reads and merges the benchmark and configuration documents. Either
/// document may declare either kind of table; declarations are appended in
/// file order.
pub fn load_matrix(benchmarks_file: &Path, configurations_file: &Path) -> Result<Matrix> {
    let bench_text = fs::read_to_string(benchmarks_file).with_context(|| {
        format!(
            "error opening or reading benchmark file {}",
            benchmarks_file.display()
        )
    })?;
    let conf_text = fs::read_to_string(configurations_file).with_context(|| {
        format!(
            "error opening or reading configuration file {}",
            configurations_file.display()
        )
    })?;
    let mut matrix = parse_matrix(&bench_text)
        .with_context(|| format!("error parsing {}", benchmarks_file.display()))?;
    let more = parse_matrix(&conf_text)
        .with_context(|| format!("error parsing {}", configurations_file.display()))?;
    matrix.benchmarks.extend(more.benchmarks);
    matrix.configurations.extend(more.configurations);
    Ok(matrix)
}

pub fn parse_matrix(text: &str) -> Result<Matrix> {
    Ok(toml::from_str(text)?)
}

/// Renders the (normalized) matrix back to TOML for inspection.
pub fn render_matrix(matrix: &Matrix) -> Result<String> {
    Ok(toml::to_string(matrix)?)
}

/// Applies the run-wide conventions to a freshly loaded matrix.
pub fn normalize(matrix: &mut Matrix, opts: NormalizeOptions) -> Result<(), MatrixError> {
    normalize_with(matrix, opts, |k| std::env::var(k).ok())
}

pub fn normalize_with<F>(
    matrix: &mut Matrix,
    opts: NormalizeOptions,
    lookup: F,
) -> Result<(), MatrixError>
where
    F: Fn(&str) -> Option<String>,
{
    for config in matrix.configurations.iter_mut() {
        config.root = config
            .root
            .take()
            .map(|r| env::expand_with(&r, &lookup))
            .filter(|r| !r.is_empty())
            .map(|r| if r.ends_with('/') { r } else { format!("{}/", r) });
        for entry in config.gc_env.iter_mut().chain(config.run_env.iter_mut()) {
            *entry = env::expand_with(entry, &lookup);
        }
    }

    for bench in matrix.benchmarks.iter_mut() {
        if bench.repo.is_empty() {
            return Err(MatrixError::EmptyRepo(bench.name.clone()));
        }
        if let Some(trimmed) = bench.repo.strip_suffix('/') {
            bench.repo = trimmed.to_string();
        }
        if bench.tests.is_empty() || !opts.test_mode {
            bench.tests = MATCH_NOTHING.to_string();
        }
        if bench.benchmarks.is_empty() || opts.test_mode {
            bench.benchmarks = MATCH_NOTHING.to_string();
        }
        if opts.no_sandbox {
            bench.not_sandboxed = true;
        }
        if opts.require_sandbox && bench.not_sandboxed {
            if opts.host_is_linux {
                warn!(benchmark = %bench.name, "removing sandbox exemption");
                bench.not_sandboxed = false;
            } else {
                warn!(benchmark = %bench.name, "disabling benchmark because it requires the sandbox");
                bench.disabled = true;
            }
        }
    }
    Ok(())
}
