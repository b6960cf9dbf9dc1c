//! One harness invocation from loaded documents to the closing summary.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Local;
use tracing::info;

use crate::config;
use crate::env;
use crate::executor::{CommandRunner, OutputSink, SystemRunner};
use crate::layout::{run_stamp, Layout};
use crate::matrix::Matrix;
use crate::options::RunOptions;
use crate::orchestrator::RunOrchestrator;
use crate::sandbox::{self, SandboxNeeds};
use crate::scheduler::{BuildScheduler, Permutation, RandomPermutation};

/// Which documents to load and which of their entries take part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatrixRequest {
    pub benchmarks_file: PathBuf,
    pub configurations_file: PathBuf,
    /// `None` means every benchmark the document enables.
    pub benchmarks: Option<BTreeSet<String>>,
    pub configurations: Option<BTreeSet<String>>,
}

/// Loads both documents, applies the name restrictions, then the run-wide
/// normalization.
pub fn load(request: &MatrixRequest, options: &RunOptions) -> Result<Matrix> {
    let mut matrix = config::load_matrix(&request.benchmarks_file, &request.configurations_file)?;
    matrix.select_benchmarks(
        request.benchmarks.as_ref(),
        &request.benchmarks_file.display().to_string(),
    )?;
    matrix.select_configurations(
        request.configurations.as_ref(),
        &request.configurations_file.display().to_string(),
    )?;
    config::normalize(&mut matrix, options.normalize_options())?;
    Ok(matrix)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Failed runs.
    pub failures: Vec<String>,
    /// Failed fetches and builds.
    pub build_failures: Vec<String>,
    /// The image built for this invocation, if any.
    pub image: Option<String>,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.build_failures.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(image) = &self.image {
            out.push_str(&format!(
                "Container for sandboxed bench/test runs is {}\n",
                image
            ));
        }
        if !self.failures.is_empty() {
            out.push_str("FAILURES:\n");
            for f in &self.failures {
                out.push_str(f);
                out.push('\n');
            }
        }
        if !self.build_failures.is_empty() {
            out.push_str("Get and build failures:\n");
            for f in &self.build_failures {
                out.push_str(f);
                out.push('\n');
            }
        }
        out
    }
}

/// Runs the whole matrix with real processes.
pub fn run(matrix: &mut Matrix, options: &RunOptions, layout: &Layout) -> Result<RunSummary> {
    let mut runner = SystemRunner::new(&layout.cwd, options.verbose);
    let mut perm = RandomPermutation::new(options.seed);
    run_with(matrix, options, layout, &mut runner, &mut perm)
}

/// Runs the whole matrix through `runner`. Per-configuration logs are open
/// for the duration and closed before the summary is returned, whichever
/// way the run ends.
pub fn run_with<R: CommandRunner>(
    matrix: &mut Matrix,
    options: &RunOptions,
    layout: &Layout,
    runner: &mut R,
    perm: &mut dyn Permutation,
) -> Result<RunSummary> {
    layout.check_safe()?;
    layout.check_initialized()?;
    layout.ensure_dirs()?;

    let stamp = run_stamp(&Local::now());
    let echo = options.echo;
    let opened = matrix.open_sinks(|c| {
        let sink = OutputSink::file(&layout.run_log_path(&stamp, &c.name))?;
        Ok(if echo { sink.with_console_echo() } else { sink })
    });
    let outcome = match opened {
        Ok(()) => drive(matrix, options, layout, runner, perm),
        Err(e) => Err(anyhow::Error::new(e).context("error creating run log")),
    };
    let closed = matrix.close_sinks();
    let summary = outcome?;
    closed.context("error closing run logs")?;
    Ok(summary)
}

fn drive<R: CommandRunner>(
    matrix: &mut Matrix,
    options: &RunOptions,
    layout: &Layout,
    runner: &mut R,
    perm: &mut dyn Permutation,
) -> Result<RunSummary> {
    let baseline = env::baseline(&layout.gopath);
    let mut summary = RunSummary::default();

    let handle = match options.run_container.as_deref() {
        Some(external) => {
            if options.get_only {
                return Ok(summary);
            }
            sandbox::prepare(runner, SandboxNeeds::of(matrix), Some(external), layout)?
        }
        None => {
            let mut scheduler = BuildScheduler::new(runner, layout, options, &baseline);
            scheduler.fetch_sources(matrix, &mut summary.build_failures);
            if options.get_only {
                return Ok(summary);
            }
            scheduler.reset_build_stats(matrix);
            let needs = SandboxNeeds::of(matrix);
            scheduler.prepare_toolchains(matrix, needs);
            scheduler.build(matrix, perm, &mut summary.build_failures)?;

            // Builds may have disabled every benchmark that needed the image.
            let needs = SandboxNeeds::of(matrix);
            let handle = sandbox::prepare(runner, needs, None, layout)?;
            if let Some(image) = handle.image() {
                info!("Container for sandboxed bench/test runs is {}", image);
                summary.image = Some(image.to_string());
            }
            handle
        }
    };

    summary.failures =
        RunOrchestrator::new(runner, layout, options, &baseline, &handle).run(matrix);
    Ok(summary)
}
