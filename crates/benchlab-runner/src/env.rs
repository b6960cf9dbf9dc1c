//! `KEY=VALUE` environment lists handed to child processes.
//!
//! Children never inherit the full parent environment: builds and runs start
//! from a small baseline (see [`baseline`]) and layer overrides on top, so the
//! same matrix behaves the same regardless of who launches it.

use std::path::Path;

const INHERITED: [&str; 4] = ["PATH", "USER", "HOME", "SHELL"];

/// Baseline environment from the current process.
pub fn baseline(gopath: &Path) -> Vec<String> {
    baseline_from(std::env::vars(), gopath)
}

/// `PATH`, `USER`, `HOME`, `SHELL`, every `GO*` variable, then `GOPATH`
/// pointed at the harness' own source tree.
pub fn baseline_from<I>(vars: I, gopath: &Path) -> Vec<String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let vars: Vec<(String, String)> = vars.into_iter().collect();
    let mut env = Vec::new();
    for key in INHERITED {
        inherit_from(&mut env, key, |k| {
            vars.iter().find(|(name, _)| name == k).map(|(_, v)| v.clone())
        });
    }
    for (key, value) in &vars {
        if key.starts_with("GO") {
            env.push(format!("{}={}", key, value));
        }
    }
    replace(&mut env, "GOPATH", &gopath.to_string_lossy());
    env
}

/// Appends `key` as found by `lookup` when it is set and non-empty.
/// Does not check whether `key` is already present.
pub fn inherit_from<F>(env: &mut Vec<String>, key: &str, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
        env.push(format!("{}={}", key, value));
    }
}

/// Overwrites every existing definition of `key`, or appends one.
pub fn replace(env: &mut Vec<String>, key: &str, value: &str) {
    let prefix = format!("{}=", key);
    let mut found = false;
    for entry in env.iter_mut() {
        if entry.starts_with(&prefix) {
            *entry = format!("{}{}", prefix, value);
            found = true;
        }
    }
    if !found {
        env.push(format!("{}{}", prefix, value));
    }
}

/// Expands `$VAR` and `${VAR}` through `lookup`; unknown variables expand
/// to nothing.
pub fn expand_with<F>(s: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => {
                    out.push_str(&lookup(&braced[..end]).unwrap_or_default());
                    rest = &braced[end + 1..];
                }
                None => {
                    out.push('$');
                    rest = after;
                }
            }
            continue;
        }
        let len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        if len == 0 {
            out.push('$');
        } else {
            out.push_str(&lookup(&after[..len]).unwrap_or_default());
        }
        rest = &after[len..];
    }
    out.push_str(rest);
    out
}
