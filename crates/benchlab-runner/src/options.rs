use crate::config::NormalizeOptions;
use crate::scheduler::ShufflePolicy;

/// Every behaviour switch of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Run repetitions per (benchmark, configuration) pair.
    pub repetitions: usize,
    /// `-a` count: its magnitude is the number of builds per pair, and 1
    /// additionally forces a full rebuild of every package on every build.
    pub build_all: i32,
    pub shuffle: ShufflePolicy,
    /// Seed for build-order shuffling; entropy when absent.
    pub seed: Option<u64>,
    pub verbose: u8,
    pub test_mode: bool,
    pub no_sandbox: bool,
    pub require_sandbox: bool,
    /// Stop after fetching sources.
    pub get_only: bool,
    /// Existing image to run in. Skips fetch, build and image construction.
    pub run_container: Option<String>,
    /// Appended to every run invocation.
    pub extra_args: Vec<String>,
    /// Whether the host runs sandbox-target binaries natively.
    pub host_is_linux: bool,
    /// Copy command output to the console as it is logged.
    pub echo: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            repetitions: 1,
            build_all: 0,
            shuffle: ShufflePolicy::default(),
            seed: None,
            verbose: 0,
            test_mode: false,
            no_sandbox: false,
            require_sandbox: false,
            get_only: false,
            run_container: None,
            extra_args: Vec::new(),
            host_is_linux: cfg!(target_os = "linux"),
            echo: true,
        }
    }
}

impl RunOptions {
    pub fn build_count(&self) -> usize {
        match self.build_all.unsigned_abs() {
            0 => 1,
            n => n as usize,
        }
    }

    /// In this mode every build passes `-a`, so neither the library
    /// pre-install nor the cache clean is needed.
    pub fn always_rebuild(&self) -> bool {
        self.build_all == 1
    }

    pub fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions {
            test_mode: self.test_mode,
            no_sandbox: self.no_sandbox,
            require_sandbox: self.require_sandbox,
            host_is_linux: self.host_is_linux,
        }
    }
}
