use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, TimeZone};

use crate::error::MatrixError;

/// Where binaries and logs land, relative to the working directory.
pub const TESTBIN_DIR: &str = "testbin";
/// Paths as seen from inside the sandbox image, which is built from the
/// working directory with `ADD . /`.
pub const SANDBOX_GOPATH: &str = "/gopath";
pub const SANDBOX_TESTBIN: &str = "/testbin";

/// Canonical on-disk locations for one harness directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub cwd: PathBuf,
    pub testbin: PathBuf,
    pub gopath: PathBuf,
    pub goroots: PathBuf,
}

impl Layout {
    pub fn new(cwd: &Path) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
            testbin: cwd.join(TESTBIN_DIR),
            gopath: cwd.join("gopath"),
            goroots: cwd.join("goroots"),
        }
    }

    /// Refuses directories where a previous toolchain run left `pkg` or `bin`
    /// under the gopath; both are deleted after every build.
    pub fn check_safe(&self) -> Result<(), MatrixError> {
        for sub in ["pkg", "bin"] {
            let p = self.gopath.join(sub);
            if p.exists() {
                return Err(MatrixError::UnsafeDirectory(p));
            }
        }
        Ok(())
    }

    pub fn check_initialized(&self) -> Result<(), MatrixError> {
        if self.dockerfile().exists() {
            Ok(())
        } else {
            Err(MatrixError::NotInitialized)
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.gopath, &self.goroots, &self.testbin] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn dockerfile(&self) -> PathBuf {
        self.cwd.join("Dockerfile")
    }

    pub fn source_dir(&self, repo: &str) -> PathBuf {
        self.gopath.join("src").join(repo)
    }

    pub fn sandbox_source_dir(repo: &str) -> String {
        format!("{}/src/{}", SANDBOX_GOPATH, repo)
    }

    pub fn binary_path(&self, benchmark: &str, configuration: &str) -> PathBuf {
        self.testbin.join(binary_name(benchmark, configuration))
    }

    pub fn sandbox_binary_path(benchmark: &str, configuration: &str) -> String {
        format!(
            "{}/{}",
            SANDBOX_TESTBIN,
            binary_name(benchmark, configuration)
        )
    }

    pub fn build_stats_path(&self, configuration: &str) -> PathBuf {
        self.testbin.join(format!("{}.build", configuration))
    }

    pub fn run_log_path(&self, stamp: &str, configuration: &str) -> PathBuf {
        self.testbin.join(format!("{}.{}.stdout", stamp, configuration))
    }

    pub fn root_copy(&self, configuration: &str) -> PathBuf {
        self.goroots.join(configuration)
    }

    /// Scratch output of a build that must not leak into the next one.
    pub fn scratch_dirs(&self) -> [PathBuf; 2] {
        [self.gopath.join("pkg"), self.gopath.join("bin")]
    }
}

pub fn binary_name(benchmark: &str, configuration: &str) -> String {
    format!("{}_{}", benchmark, configuration)
}

/// Compact local timestamp used to keep successive run logs apart.
pub fn run_stamp<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    now.format("%Y%m%dT%H%M%S").to_string()
}
