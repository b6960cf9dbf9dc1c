use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::error::MatrixError;
use crate::layout::Layout;

pub const DEFAULT_BENCHMARKS_FILE: &str = "benchmarks-50.toml";
pub const DEFAULT_CONFIGURATIONS_FILE: &str = "configurations.toml";

/// The sandbox image is the harness directory itself.
const DOCKERFILE: &str = "\nFROM ubuntu\nADD . /\n";

const SAMPLE_BENCHMARKS: &str = r#"# Each [[Benchmarks]] table names a Go package whose tests are built and run
# under every configuration.

[[Benchmarks]]
  Name = "gonum_topo"
  Repo = "gonum.org/v1/gonum/graph/topo/"
  Tests = "Test"
  Benchmarks = "Benchmark(TarjanSCCGnp_1000_half|TarjanSCCGnp_10_tenth)"

[[Benchmarks]]
  Name = "ethereum_core"
  Repo = "github.com/ethereum/go-ethereum/core/"
  Tests = "Test"
  Benchmarks = "BenchmarkPendingDemotion10000"
  NotSandboxed = true
"#;

const SAMPLE_CONFIGURATIONS: &str = r#"# Each [[Configurations]] table is one toolchain variant. Root defaults to the
# go on PATH; $VAR references are expanded.

[[Configurations]]
  Name = "Base"
  Root = "$HOME/work/go/"

[[Configurations]]
  Name = "NoOpt"
  Root = "$HOME/work/go/"
  GcFlags = "all=-N -l"
  RunEnv = ["GOGC=200"]
  Disabled = true
"#;

/// What `init` created, for reporting.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct InitReport {
    pub created: Vec<PathBuf>,
    pub kept: Vec<PathBuf>,
}

/// Prepares the working directory for runs: directories, the `Dockerfile`
/// and sample documents. Existing documents are left alone; a directory
/// that already has fetched sources is refused.
pub fn init(layout: &Layout) -> Result<InitReport> {
    layout.check_safe()?;
    let src = layout.gopath.join("src");
    if src.exists() {
        return Err(MatrixError::AlreadyInitialized(src).into());
    }
    layout.ensure_dirs()?;

    let mut report = InitReport::default();
    let dockerfile = layout.dockerfile();
    fs::write(&dockerfile, DOCKERFILE)
        .with_context(|| format!("There was an error creating {}", dockerfile.display()))?;
    report.created.push(dockerfile);

    for (name, body) in [
        (DEFAULT_BENCHMARKS_FILE, SAMPLE_BENCHMARKS),
        (DEFAULT_CONFIGURATIONS_FILE, SAMPLE_CONFIGURATIONS),
    ] {
        let path = layout.cwd.join(name);
        if path.exists() {
            report.kept.push(path);
            continue;
        }
        fs::write(&path, body)
            .with_context(|| format!("There was an error creating {}", path.display()))?;
        report.created.push(path);
    }
    Ok(report)
}
