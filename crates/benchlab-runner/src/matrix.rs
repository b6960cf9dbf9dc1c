use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::command::CommandSpec;
use crate::error::MatrixError;
use crate::executor::{CommandRunner, OutputSink};

/// A source location plus selection patterns and build/run flags, built and
/// run under every enabled configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Benchmark {
    pub name: String,
    /// Informational only.
    pub contact: String,
    /// Repository plus subdirectory holding the test package.
    pub repo: String,
    /// Pattern for `-test.run=`.
    pub tests: String,
    /// Pattern for `-test.bench=`.
    pub benchmarks: String,
    pub build_flags: Vec<String>,
    /// Inner wrapper: command and args placed just before the binary.
    pub run_wrapper: Vec<String>,
    pub not_sandboxed: bool,
    pub disabled: bool,
}

impl Benchmark {
    /// Row for a wiki table: name, repo and benchmark pattern.
    pub fn wiki_row(&self) -> String {
        format!(
            " | {} | | `{}` | `{}` | |",
            self.name,
            self.repo,
            self.benchmarks.replace('|', "\\|")
        )
    }
}

/// A build/run variant applied to every benchmark.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Configuration {
    pub name: String,
    /// Alternate toolchain root; normalized to end in `/`.
    pub root: Option<String>,
    /// Compiler flags passed as `-gcflags=` to library installs and builds.
    pub gc_flags: String,
    /// Extra `KEY=VALUE` entries for building.
    pub gc_env: Vec<String>,
    pub run_flags: Vec<String>,
    /// Extra `KEY=VALUE` entries for running.
    pub run_env: Vec<String>,
    /// Outer wrapper: command and args placed before the benchmark's own.
    pub run_wrapper: Vec<String>,
    pub disabled: bool,
    #[serde(skip)]
    pub build_stats: Vec<BuildStat>,
    /// Private copy of `root` that builds run against.
    #[serde(skip)]
    pub root_copy: Option<PathBuf>,
    #[serde(skip)]
    pub sink: Option<OutputSink>,
}

impl Configuration {
    /// Streams `cmd` into this configuration's log. Without an open log the
    /// output is collected and dropped.
    pub fn stream<R: CommandRunner>(&mut self, runner: &mut R, cmd: &CommandSpec) -> Option<String> {
        match self.sink.as_mut() {
            Some(sink) => runner.stream(cmd, sink),
            None => runner.stream(cmd, &mut OutputSink::memory()),
        }
    }
}

/// Recovered timing of one build, in nanoseconds; -1 where the timer output
/// did not contain the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildTimes {
    pub real: i64,
    pub user: i64,
    pub sys: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStat {
    pub name: String,
    pub times: BuildTimes,
}

impl BuildStat {
    /// One line of the per-configuration build statistics file, shaped like
    /// a benchmark result so standard benchmark tooling can compare builds.
    pub fn to_line(&self) -> String {
        format!(
            "Benchmark{} 1 {} real-ns/op {} user-ns/op {} sys-ns/op\n",
            title_case(&self.name),
            self.times.real,
            self.times.user,
            self.times.sys
        )
    }
}

/// Upper-cases the first letter of every word; letters, digits and `_`
/// belong to words.
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_start = true;
    for c in s.chars() {
        if at_start {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        at_start = !(c.is_alphanumeric() || c == '_');
    }
    out
}

/// The benchmarks and configurations of one invocation, in declaration
/// order. Entities are addressed by index and mutated in place.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Matrix {
    pub benchmarks: Vec<Benchmark>,
    pub configurations: Vec<Configuration>,
}

impl Matrix {
    pub fn enabled_benchmarks(&self) -> Vec<usize> {
        self.benchmarks
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.disabled)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn enabled_configurations(&self) -> Vec<usize> {
        self.configurations
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.disabled)
            .map(|(i, _)| i)
            .collect()
    }

    /// Every enabled (benchmark, configuration) pair, benchmark-major in
    /// declaration order.
    pub fn effective_pairs(&self) -> Vec<(usize, usize)> {
        let configurations = self.enabled_configurations();
        self.enabled_benchmarks()
            .into_iter()
            .flat_map(|b| configurations.iter().map(move |&c| (b, c)))
            .collect()
    }

    pub fn is_enabled(&self, benchmark: usize, configuration: usize) -> bool {
        !self.benchmarks[benchmark].disabled && !self.configurations[configuration].disabled
    }

    pub fn disable_benchmark(&mut self, index: usize) {
        self.benchmarks[index].disabled = true;
    }

    pub fn disable_configuration(&mut self, index: usize) {
        self.configurations[index].disabled = true;
    }

    /// Restricts participation to the named benchmarks. A requested name
    /// enables its benchmark even when the file disabled it; every other
    /// benchmark is disabled. `file` names the source in error messages.
    pub fn select_benchmarks(
        &mut self,
        names: Option<&BTreeSet<String>>,
        file: &str,
    ) -> Result<(), MatrixError> {
        let Some(names) = names else {
            return Ok(());
        };
        for b in self.benchmarks.iter_mut() {
            b.disabled = !names.contains(&b.name);
        }
        let unknown = unknown_names(names, self.benchmarks.iter().map(|b| b.name.as_str()));
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(MatrixError::UnknownBenchmarks {
                names: unknown,
                file: file.to_string(),
            })
        }
    }

    pub fn select_configurations(
        &mut self,
        names: Option<&BTreeSet<String>>,
        file: &str,
    ) -> Result<(), MatrixError> {
        let Some(names) = names else {
            return Ok(());
        };
        for c in self.configurations.iter_mut() {
            c.disabled = !names.contains(&c.name);
        }
        let unknown = unknown_names(names, self.configurations.iter().map(|c| c.name.as_str()));
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(MatrixError::UnknownConfigurations {
                names: unknown,
                file: file.to_string(),
            })
        }
    }

    /// Opens one log per enabled configuration. On error the sinks opened
    /// so far stay attached and close when the matrix is dropped.
    pub fn open_sinks<F>(&mut self, mut open: F) -> io::Result<()>
    where
        F: FnMut(&Configuration) -> io::Result<OutputSink>,
    {
        for c in self.configurations.iter_mut().filter(|c| !c.disabled) {
            let sink = open(c)?;
            c.sink = Some(sink);
        }
        Ok(())
    }

    /// Closes every open sink exactly once; returns the first close error.
    pub fn close_sinks(&mut self) -> io::Result<()> {
        let mut first_err = None;
        for c in self.configurations.iter_mut() {
            if let Some(sink) = c.sink.take() {
                if let Err(e) = sink.close() {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn unknown_names<'a>(
    requested: &BTreeSet<String>,
    declared: impl Iterator<Item = &'a str>,
) -> Vec<String> {
    let declared: BTreeSet<&str> = declared.collect();
    requested
        .iter()
        .filter(|n| !declared.contains(n.as_str()))
        .cloned()
        .collect()
}

/// Splits a comma-separated list of names; an empty string means "no
/// restriction".
pub fn parse_name_set(s: &str) -> Option<BTreeSet<String>> {
    if s.is_empty() {
        return None;
    }
    Some(s.split(',').map(str::to_string).collect())
}

/// Binary produced by `go test -c` for a package: the last path element of
/// the repo with a `.test` suffix.
pub fn test_binary_name(repo: &str) -> String {
    let last = repo.rsplit('/').next().unwrap_or(repo);
    format!("{}.test", last)
}
