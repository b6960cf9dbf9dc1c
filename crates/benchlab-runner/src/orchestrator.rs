//! The run phase: every enabled benchmark under every enabled
//! configuration, repeated, inside or outside the sandbox image.

use tracing::{info, warn};

use crate::command::CommandSpec;
use crate::env;
use crate::executor::CommandRunner;
use crate::layout::{binary_name, Layout};
use crate::matrix::{Benchmark, Configuration, Matrix};
use crate::options::RunOptions;
use crate::sandbox::SandboxHandle;

/// Names the binary being run, so wrappers can tell runs apart.
pub const BINARY_VAR: &str = "BENCHLAB_BINARY";
/// Zero-based repetition index of the run.
pub const REPETITION_VAR: &str = "BENCHLAB_I";

pub struct RunOrchestrator<'a, R: CommandRunner> {
    runner: &'a mut R,
    layout: &'a Layout,
    options: &'a RunOptions,
    baseline: &'a [String],
    sandbox: &'a SandboxHandle,
}

impl<'a, R: CommandRunner> RunOrchestrator<'a, R> {
    pub fn new(
        runner: &'a mut R,
        layout: &'a Layout,
        options: &'a RunOptions,
        baseline: &'a [String],
        sandbox: &'a SandboxHandle,
    ) -> Self {
        Self {
            runner,
            layout,
            options,
            baseline,
            sandbox,
        }
    }

    /// Runs every repetition, streaming output into each configuration's
    /// log. Failures are reported and collected; the loop always continues.
    pub fn run(&mut self, matrix: &mut Matrix) -> Vec<String> {
        let mut failures = Vec::new();
        let configurations = matrix.enabled_configurations();
        let benchmarks = matrix.enabled_benchmarks();
        info!(
            repetitions = self.options.repetitions,
            configurations = configurations.len(),
            benchmarks = benchmarks.len(),
            "running"
        );
        for repetition in 0..self.options.repetitions {
            for &c in &configurations {
                for &b in &benchmarks {
                    let bench = &matrix.benchmarks[b];
                    let config = &mut matrix.configurations[c];
                    let failure = match self.invocation(bench, config, repetition) {
                        Ok(cmd) => config.stream(self.runner, &cmd),
                        Err(e) => Some(e),
                    };
                    if let Some(s) = failure {
                        warn!("{}", s);
                        failures.push(s);
                    }
                }
            }
        }
        failures
    }

    /// The command for one run. A sandboxed benchmark without an image
    /// cannot run and yields the failure text instead.
    pub fn invocation(
        &self,
        bench: &Benchmark,
        config: &Configuration,
        repetition: usize,
    ) -> Result<CommandSpec, String> {
        let binary = binary_name(&bench.name, &config.name);
        let identity = [
            format!("{}={}", BINARY_VAR, binary),
            format!("{}={}", REPETITION_VAR, repetition),
        ];

        if bench.not_sandboxed {
            let cwd = self.layout.cwd.to_string_lossy();
            let mut argv = wrappers(bench, config, &cwd);
            argv.push(self.layout.binary_path(&bench.name, &config.name).to_string_lossy().into_owned());
            argv.extend(self.tail(bench, config));

            let mut env = self.baseline.to_vec();
            if let Some(root) = &config.root {
                env::replace(&mut env, "GOROOT", root);
            }
            env.extend(config.run_env.iter().cloned());
            env.extend(identity);

            let mut cmd = CommandSpec::from_argv(&argv)
                .ok_or_else(|| format!("empty command for {}", binary))?;
            cmd.current_dir(self.layout.source_dir(&bench.repo)).env(env);
            return Ok(cmd);
        }

        let Some(image) = self.sandbox.image() else {
            return Err(format!(
                "Error running {}: benchmark needs the sandbox but no image was built",
                binary
            ));
        };
        let mut cmd = CommandSpec::new("docker");
        cmd.args(["run", "--net=none", "-w"])
            .arg(Layout::sandbox_source_dir(&bench.repo));
        for e in config.run_env.iter().chain(identity.iter()) {
            cmd.arg("-e").arg(e.as_str());
        }
        cmd.arg(image)
            .args(wrappers(bench, config, ""))
            .arg(Layout::sandbox_binary_path(&bench.name, &config.name))
            .args(self.tail(bench, config));
        Ok(cmd)
    }

    fn tail(&self, bench: &Benchmark, config: &Configuration) -> Vec<String> {
        let mut args = vec![
            format!("-test.run={}", bench.tests),
            format!("-test.bench={}", bench.benchmarks),
        ];
        args.extend(config.run_flags.iter().cloned());
        args.extend(self.options.extra_args.iter().cloned());
        args
    }
}

/// Configuration wrapper, then benchmark wrapper. Each wrapper's command is
/// rooted at `prefix` (the sandbox root or the working directory).
fn wrappers(bench: &Benchmark, config: &Configuration, prefix: &str) -> Vec<String> {
    let mut argv = Vec::new();
    for wrapper in [&config.run_wrapper, &bench.run_wrapper] {
        if let Some((first, rest)) = wrapper.split_first() {
            argv.push(format!("{}/{}", prefix, first));
            argv.extend(rest.iter().cloned());
        }
    }
    argv
}
