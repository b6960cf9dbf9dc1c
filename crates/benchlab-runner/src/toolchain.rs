//! Invocations of the Go toolchain and of the external timer.

use std::fs;
use std::path::Path;

use anyhow::Result;

use crate::command::CommandSpec;
use crate::env;
use crate::matrix::{BuildTimes, Configuration};

/// Timer whose `-p` report (`real`/`user`/`sys` in seconds) is parsed after
/// every build.
pub const TIME_TOOL: &str = "/usr/bin/time";
/// Target OS of the sandbox image.
pub const SANDBOX_GOOS: &str = "linux";
/// Parts of a toolchain root needed to build against it.
const ROOT_PARTS: [&str; 3] = ["bin", "src", "pkg"];

/// The `go` command inside `root`, or the one on `PATH`.
pub fn go_command(root: Option<&Path>) -> String {
    match root {
        Some(root) => root.join("bin").join("go").to_string_lossy().into_owned(),
        None => "go".to_string(),
    }
}

/// Environment for a toolchain invocation under `config`: the baseline,
/// `GOOS` forced for sandbox targets, `GOROOT` pointed at the private root
/// copy, then the configuration's build overlay.
pub fn build_env(
    baseline: &[String],
    config: &Configuration,
    sandbox_target: bool,
    with_overlay: bool,
) -> Vec<String> {
    let mut env = baseline.to_vec();
    if sandbox_target {
        env::replace(&mut env, "GOOS", SANDBOX_GOOS);
    }
    if let Some(root) = &config.root_copy {
        env::replace(&mut env, "GOROOT", &dir_string(root));
    }
    if with_overlay {
        env.extend(config.gc_env.iter().cloned());
    }
    env
}

/// `go get -d -t -v <repo>`.
pub fn fetch(repo: &str, baseline: &[String], sandbox_target: bool) -> CommandSpec {
    let mut env = baseline.to_vec();
    if sandbox_target {
        env::replace(&mut env, "GOOS", SANDBOX_GOOS);
    }
    let mut cmd = CommandSpec::new("go");
    cmd.args(["get", "-d", "-t", "-v", repo]).env(env);
    cmd
}

/// `go install -a [-gcflags=...] std` for one target OS.
pub fn install_std(config: &Configuration, baseline: &[String], sandbox_target: bool) -> CommandSpec {
    let mut cmd = CommandSpec::new(go_command(config.root_copy.as_deref()));
    cmd.args(["install", "-a"]);
    if !config.gc_flags.is_empty() {
        cmd.arg(format!("-gcflags={}", config.gc_flags));
    }
    cmd.arg("std")
        .env(build_env(baseline, config, sandbox_target, true));
    cmd
}

/// `go clean -cache`, run from the gopath so only the cache is affected.
pub fn clean_cache(
    config: &Configuration,
    baseline: &[String],
    gopath: &Path,
    sandbox_target: bool,
) -> CommandSpec {
    let mut cmd = CommandSpec::new(go_command(config.root_copy.as_deref()));
    cmd.args(["clean", "-cache"])
        .current_dir(gopath)
        .env(build_env(baseline, config, sandbox_target, false));
    cmd
}

/// `/usr/bin/time -p go test -vet=off -c <flags> [-a] [-gcflags=...] .` in
/// the benchmark's source directory.
pub fn timed_test_build(
    config: &Configuration,
    build_flags: &[String],
    source_dir: &Path,
    baseline: &[String],
    sandbox_target: bool,
    force_all: bool,
) -> CommandSpec {
    let mut cmd = CommandSpec::new(TIME_TOOL);
    cmd.args(["-p".to_string(), go_command(config.root_copy.as_deref())])
        .args(["test", "-vet=off", "-c"])
        .args(build_flags.iter().cloned());
    if force_all {
        cmd.arg("-a");
    }
    if !config.gc_flags.is_empty() {
        cmd.arg(format!("-gcflags={}", config.gc_flags));
    }
    cmd.arg(".")
        .current_dir(source_dir)
        .env(build_env(baseline, config, sandbox_target, true));
    cmd
}

/// Pulls `real`, `user` and `sys` out of a `time -p` report.
pub fn extract_times(output: &str) -> BuildTimes {
    BuildTimes {
        real: extract_time(output, "real"),
        user: extract_time(output, "user"),
        sys: extract_time(output, "sys"),
    }
}

/// Finds the last `label` in `output` and converts the token following it on
/// the same line from seconds to nanoseconds. Returns -1 when the label is
/// missing or that token is not a number.
pub fn extract_time(output: &str, label: &str) -> i64 {
    let Some(at) = output.rfind(label) else {
        return -1;
    };
    let rest = output[at + label.len()..].trim_start_matches([' ', '\t']);
    let token = match rest.find(char::is_whitespace) {
        Some(end) => &rest[..end],
        None => rest,
    };
    match token.parse::<f64>() {
        Ok(seconds) if seconds.is_finite() => (seconds * 1e9).round() as i64,
        _ => -1,
    }
}

/// Strips the timer report from build output before it is shown.
pub fn without_time_report(output: &str) -> &str {
    match output.rfind("real") {
        Some(i) => &output[..i],
        None => output,
    }
}

/// Replaces `to` with a copy of the `bin`, `src` and `pkg` trees of `from`.
/// Missing parts are skipped.
pub fn copy_root(from: &Path, to: &Path) -> Result<()> {
    if to.exists() {
        fs::remove_dir_all(to)?;
    }
    for part in ROOT_PARTS {
        let src = from.join(part);
        if src.is_dir() {
            copy_dir(&src, &to.join(part))?;
        }
    }
    Ok(())
}

fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry?;
        let path = entry.path();
        let rel = path.strip_prefix(src)?;
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            copy_link(path, &target)?;
        } else if file_type.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            // fs::copy carries permission bits, so bin/go stays executable.
            fs::copy(path, &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_link(path: &Path, target: &Path) -> Result<()> {
    let link = fs::read_link(path)?;
    std::os::unix::fs::symlink(link, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_link(path: &Path, target: &Path) -> Result<()> {
    if path.is_file() {
        fs::copy(path, target)?;
    }
    Ok(())
}

/// Directory paths are handed to the toolchain with a trailing `/`.
pub fn dir_string(path: &Path) -> String {
    let s = path.to_string_lossy().into_owned();
    if s.ends_with('/') {
        s
    } else {
        format!("{}/", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn config() -> Configuration {
        Configuration {
            name: "tip".to_string(),
            gc_flags: "all=-B".to_string(),
            gc_env: vec!["GOARCH=amd64".to_string()],
            root_copy: Some(PathBuf::from("/work/goroots/tip")),
            ..Configuration::default()
        }
    }

    #[test]
    fn extract_time_reads_labelled_seconds() {
        let report = "ok  \tpkg\t0.01s\nreal 1.23\nuser 0.50\nsys 0.10\n";
        assert_eq!(extract_time(report, "real"), 1_230_000_000);
        assert_eq!(extract_time(report, "user"), 500_000_000);
        assert_eq!(extract_time(report, "sys"), 100_000_000);
    }

    #[test]
    fn extract_time_is_order_and_noise_tolerant() {
        let report = "sys 0.10 junk\n--- user\t0.50\nnoise real   1.23";
        assert_eq!(
            extract_times(report),
            BuildTimes {
                real: 1_230_000_000,
                user: 500_000_000,
                sys: 100_000_000
            }
        );
    }

    #[test]
    fn extract_time_degrades_to_sentinel() {
        let report = "real 2.5\nuser abc\n";
        let times = extract_times(report);
        assert_eq!(times.real, 2_500_000_000);
        assert_eq!(times.user, -1);
        assert_eq!(times.sys, -1);
        assert_eq!(extract_time("real 1.2.3\n", "real"), -1);
    }

    #[test]
    fn malformed_value_does_not_borrow_the_next_line() {
        let times = extract_times("real 1.00\nuser ?\nsys 0.25\n");
        assert_eq!(times.real, 1_000_000_000);
        assert_eq!(times.user, -1);
        assert_eq!(times.sys, 250_000_000);
        assert_eq!(extract_time("user\nsys 0.25\n", "user"), -1);
    }

    #[test]
    fn timed_build_composes_flags_and_env() {
        let baseline = vec!["PATH=/bin".to_string(), "GOOS=darwin".to_string()];
        let cmd = timed_test_build(
            &config(),
            &["-tags".to_string(), "purego".to_string()],
            Path::new("/work/gopath/src/example.com/x"),
            &baseline,
            true,
            false,
        );
        assert_eq!(
            cmd.argv(),
            vec![
                "/usr/bin/time",
                "-p",
                "/work/goroots/tip/bin/go",
                "test",
                "-vet=off",
                "-c",
                "-tags",
                "purego",
                "-gcflags=all=-B",
                "."
            ]
        );
        assert_eq!(
            cmd.env.as_deref(),
            Some(
                &[
                    "PATH=/bin".to_string(),
                    "GOOS=linux".to_string(),
                    "GOROOT=/work/goroots/tip/".to_string(),
                    "GOARCH=amd64".to_string(),
                ][..]
            )
        );
    }

    #[test]
    fn cache_clean_skips_build_overlay() {
        let cmd = clean_cache(&config(), &[], Path::new("/work/gopath"), false);
        assert_eq!(cmd.argv(), vec!["/work/goroots/tip/bin/go", "clean", "-cache"]);
        assert_eq!(cmd.env, Some(vec!["GOROOT=/work/goroots/tip/".to_string()]));
        assert_eq!(cmd.dir, Some(PathBuf::from("/work/gopath")));
    }

    #[test]
    fn install_std_without_root_uses_path_go() {
        let plain = Configuration {
            name: "base".to_string(),
            ..Configuration::default()
        };
        let cmd = install_std(&plain, &[], false);
        assert_eq!(cmd.argv(), vec!["go", "install", "-a", "std"]);
    }

    #[test]
    fn copy_root_copies_toolchain_parts_only() {
        let base = std::env::temp_dir().join(format!(
            "benchlab_root_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let from = base.join("go");
        let to = base.join("goroots").join("tip");
        fs::create_dir_all(from.join("bin")).expect("bin");
        fs::create_dir_all(from.join("src").join("fmt")).expect("src");
        fs::create_dir_all(from.join("test")).expect("test");
        fs::write(from.join("bin").join("go"), b"#!/bin/sh\n").expect("go");
        fs::write(from.join("src").join("fmt").join("print.go"), b"package fmt\n").expect("src file");
        fs::write(from.join("test").join("ignored.go"), b"x").expect("ignored");
        fs::create_dir_all(to.join("stale")).expect("stale");

        copy_root(&from, &to).expect("copy");
        assert!(to.join("bin").join("go").is_file());
        assert!(to.join("src").join("fmt").join("print.go").is_file());
        assert!(!to.join("test").exists());
        assert!(!to.join("stale").exists());
        let _ = fs::remove_dir_all(base);
    }
}
