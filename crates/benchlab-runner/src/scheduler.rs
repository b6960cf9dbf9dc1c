//! Fetching sources, preparing per-configuration toolchains, and building
//! one test binary per (benchmark, configuration) pair in a shuffled order.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::error::MatrixError;
use crate::executor::{Captured, CommandRunner};
use crate::layout::Layout;
use crate::matrix::{test_binary_name, BuildStat, Matrix};
use crate::options::RunOptions;
use crate::sandbox::SandboxNeeds;
use crate::toolchain;

/// How much of the build order is randomized, to spread systematic effects
/// (thermal state, caches, background load) over the matrix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShufflePolicy {
    /// Repetitions, then benchmarks, then configurations, in declaration
    /// order.
    None,
    /// A fresh configuration order for every benchmark of every repetition.
    Configurations,
    /// One order over all pairs, reused for every repetition.
    #[default]
    Pairs,
    /// One order over all (pair, repetition) tasks.
    Everything,
}

impl TryFrom<u8> for ShufflePolicy {
    type Error = MatrixError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Self::None),
            1 => Ok(Self::Configurations),
            2 => Ok(Self::Pairs),
            3 => Ok(Self::Everything),
            other => Err(MatrixError::InvalidShuffle(other)),
        }
    }
}

impl ShufflePolicy {
    pub fn level(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Configurations => 1,
            Self::Pairs => 2,
            Self::Everything => 3,
        }
    }
}

/// Source of orderings. `permute(n)` returns some ordering of `0..n`.
pub trait Permutation {
    fn permute(&mut self, len: usize) -> Vec<usize>;
}

pub struct RandomPermutation {
    rng: StdRng,
}

impl RandomPermutation {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn new(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::seeded(seed),
            None => Self::from_entropy(),
        }
    }
}

impl Permutation for RandomPermutation {
    fn permute(&mut self, len: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..len).collect();
        order.shuffle(&mut self.rng);
        order
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BuildTask {
    pub benchmark: usize,
    pub configuration: usize,
    pub repetition: usize,
}

/// Orders every build of the enabled pairs, `build_count` times each.
pub fn plan(
    matrix: &Matrix,
    build_count: usize,
    policy: ShufflePolicy,
    perm: &mut dyn Permutation,
) -> Vec<BuildTask> {
    let task = |(benchmark, configuration): (usize, usize), repetition| BuildTask {
        benchmark,
        configuration,
        repetition,
    };
    let pairs = matrix.effective_pairs();
    let mut tasks = Vec::with_capacity(pairs.len() * build_count);
    match policy {
        ShufflePolicy::None => {
            for rep in 0..build_count {
                tasks.extend(pairs.iter().map(|&p| task(p, rep)));
            }
        }
        ShufflePolicy::Configurations => {
            let configurations = matrix.enabled_configurations();
            for rep in 0..build_count {
                for b in matrix.enabled_benchmarks() {
                    for i in perm.permute(configurations.len()) {
                        tasks.push(task((b, configurations[i]), rep));
                    }
                }
            }
        }
        ShufflePolicy::Pairs => {
            let order = perm.permute(pairs.len());
            for rep in 0..build_count {
                tasks.extend(order.iter().map(|&i| task(pairs[i], rep)));
            }
        }
        ShufflePolicy::Everything => {
            let all: Vec<BuildTask> = (0..build_count)
                .flat_map(|rep| pairs.iter().map(move |&p| task(p, rep)))
                .collect();
            tasks.extend(perm.permute(all.len()).into_iter().map(|i| all[i]));
        }
    }
    tasks
}

/// Drives the get and build phases through a [`CommandRunner`].
pub struct BuildScheduler<'a, R: CommandRunner> {
    runner: &'a mut R,
    layout: &'a Layout,
    options: &'a RunOptions,
    baseline: &'a [String],
}

impl<'a, R: CommandRunner> BuildScheduler<'a, R> {
    pub fn new(
        runner: &'a mut R,
        layout: &'a Layout,
        options: &'a RunOptions,
        baseline: &'a [String],
    ) -> Self {
        Self {
            runner,
            layout,
            options,
            baseline,
        }
    }

    /// Fetches every enabled benchmark's source and dependencies once. A
    /// benchmark that cannot be fetched is disabled.
    pub fn fetch_sources(&mut self, matrix: &mut Matrix, failures: &mut Vec<String>) {
        for b in matrix.enabled_benchmarks() {
            let bench = &matrix.benchmarks[b];
            let mut cmd = toolchain::fetch(&bench.repo, self.baseline, !bench.not_sandboxed);
            cmd.current_dir(&self.layout.cwd);
            let out = self.runner.capture(&cmd);
            if out.success {
                continue;
            }
            let s = format!(
                "There was an error running 'go get', stderr = {}",
                failure_detail(&out)
            );
            warn!("{}DISABLING benchmark {}", s, bench.name);
            failures.push(format!("{}({})\n", s, bench.name));
            matrix.disable_benchmark(b);
        }
    }

    /// Truncates each enabled configuration's build-stat file. A
    /// configuration whose file cannot be created is disabled.
    pub fn reset_build_stats(&mut self, matrix: &mut Matrix) {
        for c in matrix.enabled_configurations() {
            let path = self.layout.build_stats_path(&matrix.configurations[c].name);
            if let Err(e) = File::create(&path) {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "cannot create build stats file; disabling configuration {}",
                    matrix.configurations[c].name
                );
                matrix.disable_configuration(c);
            }
        }
    }

    /// Gives every enabled configuration its private toolchain root and,
    /// unless every build rebuilds everything anyway, installs the standard
    /// library once per target OS the benchmarks need.
    pub fn prepare_toolchains(&mut self, matrix: &mut Matrix, needs: SandboxNeeds) {
        let mut targets = Vec::new();
        if needs.sandboxed && !self.options.host_is_linux {
            targets.push(true);
        }
        if needs.unsandboxed {
            targets.push(false);
        }

        for c in matrix.enabled_configurations() {
            let config = &mut matrix.configurations[c];
            if let Some(root) = config.root.clone() {
                let copy = self.layout.root_copy(&config.name);
                debug!(from = %root, to = %copy.display(), "copying toolchain root");
                if let Err(e) = toolchain::copy_root(Path::new(&root), &copy) {
                    warn!(
                        "There was an error copying {} to {}, {:#}; disabling configuration {}",
                        root,
                        copy.display(),
                        e,
                        config.name
                    );
                    config.disabled = true;
                    continue;
                }
                config.root_copy = Some(copy);
            }
            if self.options.always_rebuild() {
                continue;
            }
            for &sandbox_target in &targets {
                let cmd = toolchain::install_std(config, self.baseline, sandbox_target);
                if let Some(e) = config.stream(self.runner, &cmd) {
                    warn!("Error running go install std, {}", e);
                    config.disabled = true;
                    break;
                }
            }
        }
    }

    /// Plans and runs every build task. Tasks whose benchmark or
    /// configuration was disabled after planning are skipped.
    pub fn build(
        &mut self,
        matrix: &mut Matrix,
        perm: &mut dyn Permutation,
        failures: &mut Vec<String>,
    ) -> Result<()> {
        let tasks = plan(
            matrix,
            self.options.build_count(),
            self.options.shuffle,
            perm,
        );
        info!(
            tasks = tasks.len(),
            shuffle = self.options.shuffle.level(),
            "compiling"
        );
        for task in tasks {
            if !matrix.is_enabled(task.benchmark, task.configuration) {
                continue;
            }
            if let Some(failure) = self.compile_one(matrix, task.benchmark, task.configuration)? {
                failures.push(failure);
            }
        }
        Ok(())
    }

    /// Builds one test binary and records its timing. Returns the failure
    /// text when the benchmark had to be disabled. Only an unwritable
    /// build-stat file is fatal.
    pub fn compile_one(
        &mut self,
        matrix: &mut Matrix,
        benchmark: usize,
        configuration: usize,
    ) -> Result<Option<String>> {
        let bench = &matrix.benchmarks[benchmark];
        let config = &mut matrix.configurations[configuration];
        let sandbox_target = !bench.not_sandboxed;
        let always_rebuild = self.options.always_rebuild();

        if !always_rebuild {
            let clean =
                toolchain::clean_cache(config, self.baseline, &self.layout.gopath, sandbox_target);
            if let Some(e) = config.stream(self.runner, &clean) {
                warn!("Error running go clean -cache, {}", e);
            }
        }

        let source_dir = self.layout.source_dir(&bench.repo);
        let cmd = toolchain::timed_test_build(
            config,
            &bench.build_flags,
            &source_dir,
            self.baseline,
            sandbox_target,
            always_rebuild,
        );
        let out = self.runner.capture(&cmd);
        if !out.success {
            let s = format!(
                "There was an error running 'go test', output = {}, error = {}",
                out.combined,
                out.error.as_deref().unwrap_or("unknown")
            );
            warn!("{}DISABLING benchmark {}", s, bench.name);
            let failure = format!("{}({})\n", s, bench.name);
            matrix.disable_benchmark(benchmark);
            return Ok(Some(failure));
        }

        let stat = BuildStat {
            name: bench.name.clone(),
            times: toolchain::extract_times(&out.combined),
        };
        let line = stat.to_line();
        config.build_stats.push(stat);
        if self.options.verbose > 0 {
            info!("{}", line.trim_end());
        }
        let stats_path = self.layout.build_stats_path(&config.name);
        append_line(&stats_path, &line)
            .with_context(|| format!("error appending to {}", stats_path.display()))?;

        let from = source_dir.join(test_binary_name(&bench.repo));
        let to = self.layout.binary_path(&bench.name, &config.name);
        if let Err(e) = fs::rename(&from, &to) {
            let s = format!(
                "There was an error renaming {} to {}, {}",
                from.display(),
                to.display(),
                e
            );
            warn!("{}; DISABLING benchmark {}", s, bench.name);
            let failure = format!("{}({})\n", s, bench.name);
            matrix.disable_benchmark(benchmark);
            return Ok(Some(failure));
        }
        debug!(from = %from.display(), to = %to.display(), "moved test binary");
        if self.options.verbose > 0 {
            info!("{}", toolchain::without_time_report(&out.combined).trim_end());
        }

        for dir in self.layout.scratch_dirs() {
            if dir.exists() {
                if let Err(e) = fs::remove_dir_all(&dir) {
                    warn!(path = %dir.display(), error = %e, "cannot remove build scratch");
                }
            }
        }
        Ok(None)
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut f = OpenOptions::new().append(true).open(path)?;
    f.write_all(line.as_bytes())?;
    f.sync_all()
}

fn failure_detail(out: &Captured) -> String {
    if out.stderr.trim().is_empty() {
        out.error.clone().unwrap_or_default()
    } else {
        out.stderr.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{Benchmark, Configuration};
    use crate::testing::ScriptedRunner;
    use chrono::Utc;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    /// Reverses every ordering, so shuffled plans differ from declaration
    /// order in a predictable way.
    struct Reverse;

    impl Permutation for Reverse {
        fn permute(&mut self, len: usize) -> Vec<usize> {
            (0..len).rev().collect()
        }
    }

    fn matrix(benches: &[&str], configs: &[&str]) -> Matrix {
        Matrix {
            benchmarks: benches
                .iter()
                .map(|b| Benchmark {
                    name: b.to_string(),
                    repo: format!("example.com/{}/pkg", b),
                    ..Benchmark::default()
                })
                .collect(),
            configurations: configs
                .iter()
                .map(|c| Configuration {
                    name: c.to_string(),
                    ..Configuration::default()
                })
                .collect(),
        }
    }

    fn temp_layout(tag: &str) -> Layout {
        let root: PathBuf = std::env::temp_dir().join(format!(
            "benchlab_sched_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let layout = Layout::new(&root);
        layout.ensure_dirs().expect("layout dirs");
        layout
    }

    fn as_set(tasks: &[BuildTask]) -> BTreeSet<BuildTask> {
        tasks.iter().copied().collect()
    }

    #[test]
    fn shuffle_level_bounds() {
        for level in 0..=3u8 {
            let policy = ShufflePolicy::try_from(level).expect("valid level");
            assert_eq!(policy.level(), level);
        }
        assert_eq!(
            ShufflePolicy::try_from(4),
            Err(MatrixError::InvalidShuffle(4))
        );
        assert_eq!(ShufflePolicy::default(), ShufflePolicy::Pairs);
    }

    #[test]
    fn every_policy_preserves_task_membership() {
        let mut m = matrix(&["a", "b", "c"], &["x", "y"]);
        m.disable_benchmark(1);
        let expected = as_set(&plan(&m, 3, ShufflePolicy::None, &mut Reverse));
        assert_eq!(expected.len(), 2 * 2 * 3);
        for level in 1..=3u8 {
            let policy = ShufflePolicy::try_from(level).expect("level");
            let mut rng = RandomPermutation::seeded(u64::from(level) * 7919);
            let tasks = plan(&m, 3, policy, &mut rng);
            assert_eq!(tasks.len(), expected.len(), "policy {}", level);
            assert_eq!(as_set(&tasks), expected, "policy {}", level);
        }
    }

    #[test]
    fn policy_zero_is_deterministic_nested_order() {
        let m = matrix(&["a", "b"], &["x", "y"]);
        let first = plan(&m, 2, ShufflePolicy::None, &mut RandomPermutation::seeded(1));
        let second = plan(&m, 2, ShufflePolicy::None, &mut RandomPermutation::seeded(2));
        assert_eq!(first, second);
        let keys: Vec<(usize, usize, usize)> = first
            .iter()
            .map(|t| (t.repetition, t.benchmark, t.configuration))
            .collect();
        assert_eq!(
            keys,
            vec![
                (0, 0, 0),
                (0, 0, 1),
                (0, 1, 0),
                (0, 1, 1),
                (1, 0, 0),
                (1, 0, 1),
                (1, 1, 0),
                (1, 1, 1)
            ]
        );
    }

    #[test]
    fn shuffled_policies_keep_their_structure() {
        let m = matrix(&["a", "b"], &["x", "y", "z"]);

        let per_bench = plan(&m, 1, ShufflePolicy::Configurations, &mut Reverse);
        let order: Vec<(usize, usize)> = per_bench
            .iter()
            .map(|t| (t.benchmark, t.configuration))
            .collect();
        assert_eq!(order, vec![(0, 2), (0, 1), (0, 0), (1, 2), (1, 1), (1, 0)]);

        let pairs = plan(&m, 2, ShufflePolicy::Pairs, &mut RandomPermutation::seeded(42));
        let (first, second) = pairs.split_at(6);
        let strip = |ts: &[BuildTask]| -> Vec<(usize, usize)> {
            ts.iter().map(|t| (t.benchmark, t.configuration)).collect()
        };
        assert_eq!(strip(first), strip(second));
        assert!(first.iter().all(|t| t.repetition == 0));

        let everything = plan(&m, 2, ShufflePolicy::Everything, &mut Reverse);
        assert_eq!(
            everything[0],
            BuildTask {
                benchmark: 1,
                configuration: 2,
                repetition: 1
            }
        );
    }

    #[test]
    fn seeded_permutations_are_reproducible() {
        let a = RandomPermutation::seeded(9).permute(50);
        let b = RandomPermutation::seeded(9).permute(50);
        assert_eq!(a, b);
        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn build_failure_disables_benchmark_for_remaining_tasks() {
        let layout = temp_layout("fail");
        let mut m = matrix(&["broken", "fine"], &["x", "y"]);
        let options = RunOptions {
            build_all: 2,
            shuffle: ShufflePolicy::None,
            ..RunOptions::default()
        };
        let mut runner = ScriptedRunner::default();
        runner.fail_when("-tags broken");
        m.benchmarks[0].build_flags = vec!["-tags".to_string(), "broken".to_string()];

        let mut failures = Vec::new();
        let mut scheduler = BuildScheduler::new(&mut runner, &layout, &options, &[]);
        scheduler.reset_build_stats(&mut m);
        scheduler
            .build(&mut m, &mut Reverse, &mut failures)
            .expect("build phase");

        assert_eq!(failures.len(), 1);
        assert!(failures[0].ends_with("(broken)\n"));
        assert!(m.benchmarks[0].disabled);
        // One failed attempt for `broken`, two builds per config for `fine`.
        assert_eq!(runner.count_matching("-tags broken"), 1);
        assert_eq!(runner.count_matching("-vet=off"), 1 + 2 * 2);
        assert!(layout.binary_path("fine", "x").is_file());
        assert!(layout.binary_path("fine", "y").is_file());
        assert!(!layout.binary_path("broken", "x").exists());

        let stats = fs::read_to_string(layout.build_stats_path("x")).expect("stats");
        assert_eq!(stats.lines().count(), 2);
        assert_eq!(
            stats.lines().next(),
            Some("BenchmarkFine 1 1000000000 real-ns/op 500000000 user-ns/op 250000000 sys-ns/op")
        );
        assert_eq!(m.configurations[0].build_stats.len(), 2);
        let _ = fs::remove_dir_all(&layout.cwd);
    }

    #[test]
    fn cache_clean_skipped_when_always_rebuilding() {
        let layout = temp_layout("rebuild");
        let mut m = matrix(&["a"], &["x"]);
        let options = RunOptions {
            build_all: 1,
            ..RunOptions::default()
        };
        let mut runner = ScriptedRunner::default();
        let mut failures = Vec::new();
        {
            let mut scheduler = BuildScheduler::new(&mut runner, &layout, &options, &[]);
            scheduler.reset_build_stats(&mut m);
            scheduler.prepare_toolchains(
                &mut m,
                SandboxNeeds {
                    sandboxed: true,
                    unsandboxed: true,
                },
            );
            scheduler
                .build(&mut m, &mut Reverse, &mut failures)
                .expect("build");
        }
        assert!(failures.is_empty());
        assert_eq!(runner.count_matching("clean -cache"), 0);
        assert_eq!(runner.count_matching("install -a"), 0);
        let build = runner
            .commands
            .iter()
            .find(|c| c.program == toolchain::TIME_TOOL)
            .expect("timed build");
        assert!(build.args.iter().any(|a| a == "-a"));
        let _ = fs::remove_dir_all(&layout.cwd);
    }

    #[test]
    fn library_install_failure_disables_configuration() {
        let layout = temp_layout("install");
        let mut m = matrix(&["a"], &["x", "y"]);
        m.configurations[0].gc_flags = "all=-bad".to_string();
        let options = RunOptions {
            host_is_linux: false,
            ..RunOptions::default()
        };
        let mut runner = ScriptedRunner::default();
        runner.fail_when("-gcflags=all=-bad");
        let mut scheduler = BuildScheduler::new(&mut runner, &layout, &options, &[]);
        scheduler.prepare_toolchains(
            &mut m,
            SandboxNeeds {
                sandboxed: true,
                unsandboxed: true,
            },
        );
        assert!(m.configurations[0].disabled);
        assert!(!m.configurations[1].disabled);
        // `y` installs for both target OSes; `x` stops at its first failure.
        assert_eq!(runner.count_matching("install -a"), 3);
        let cross = runner
            .commands
            .iter()
            .filter(|c| c.argv().contains(&"install"))
            .filter(|c| {
                c.env
                    .as_ref()
                    .is_some_and(|e| e.iter().any(|v| v == "GOOS=linux"))
            })
            .count();
        assert_eq!(cross, 2);
        let _ = fs::remove_dir_all(&layout.cwd);
    }

    #[test]
    fn fetch_failure_disables_benchmark() {
        let layout = temp_layout("fetch");
        let mut m = matrix(&["a", "gone"], &["x"]);
        m.benchmarks[0].not_sandboxed = true;
        let options = RunOptions::default();
        let mut runner = ScriptedRunner::default();
        runner.fail_when("example.com/gone");
        let mut failures = Vec::new();
        BuildScheduler::new(&mut runner, &layout, &options, &[])
            .fetch_sources(&mut m, &mut failures);
        assert_eq!(m.enabled_benchmarks(), vec![0]);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("'go get'"));
        assert!(failures[0].ends_with("(gone)\n"));
        // Sandboxed benchmarks fetch for the sandbox OS.
        let gone = &runner.commands[1];
        assert_eq!(
            gone.argv(),
            vec!["go", "get", "-d", "-t", "-v", "example.com/gone/pkg"]
        );
        assert_eq!(gone.env, Some(vec!["GOOS=linux".to_string()]));
        assert_eq!(runner.commands[0].env, Some(Vec::new()));
        let _ = fs::remove_dir_all(&layout.cwd);
    }
}
