use std::path::{Path, PathBuf};
use std::process::Command;

/// Environment entries left out of rendered command lines; they are the same
/// for every invocation and only add noise.
const QUIET_ENV_PREFIXES: [&str; 4] = ["PATH=", "HOME=", "USER=", "SHELL="];

/// An external invocation described as plain data, so it can be logged,
/// compared in tests, and only turned into a [`Command`] at launch time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub dir: Option<PathBuf>,
    /// `KEY=VALUE` entries. `None` inherits the parent's environment.
    pub env: Option<Vec<String>>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Builds a command from a non-empty argv.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, rest) = argv.split_first()?;
        let mut spec = Self::new(program.clone());
        spec.args(rest.iter().cloned());
        Some(spec)
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn env(&mut self, env: Vec<String>) -> &mut Self {
        self.env = Some(env);
        self
    }

    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        if let Some(env) = &self.env {
            cmd.env_clear();
            for entry in env {
                match entry.split_once('=') {
                    Some((key, value)) => cmd.env(key, value),
                    None => cmd.env(entry, ""),
                };
            }
        }
        cmd
    }

    /// Renders the invocation as something that can be pasted into a shell:
    /// `( cd dir; K=V prog args )`.
    pub fn as_command_line(&self, cwd: &Path) -> String {
        let mut s = String::from("(");
        if let Some(dir) = &self.dir {
            if dir != cwd {
                s.push_str(" cd ");
                s.push_str(&shell_quote(&dir.to_string_lossy()));
                s.push(';');
            }
        }
        if let Some(env) = &self.env {
            for entry in env {
                if QUIET_ENV_PREFIXES.iter().any(|p| entry.starts_with(p)) {
                    continue;
                }
                s.push(' ');
                s.push_str(&shell_quote(entry));
            }
        }
        for part in self.argv() {
            s.push(' ');
            s.push_str(&shell_quote(part));
        }
        s.push_str(" )");
        s
    }
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_skips_cwd_and_quiet_env() {
        let cwd = PathBuf::from("/work");
        let mut spec = CommandSpec::new("go");
        spec.args(["test", "-c", "-gcflags=all=-N -l"])
            .current_dir("/work/gopath/src/example.com/foo")
            .env(vec![
                "PATH=/usr/bin".to_string(),
                "GOOS=linux".to_string(),
            ]);
        assert_eq!(
            spec.as_command_line(&cwd),
            "( cd /work/gopath/src/example.com/foo; GOOS=linux go test -c '-gcflags=all=-N -l' )"
        );

        let mut here = CommandSpec::new("ls");
        here.current_dir("/work");
        assert_eq!(here.as_command_line(&cwd), "( ls )");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
    }

    #[test]
    fn from_argv_splits_program() {
        let spec = CommandSpec::from_argv(&["docker".to_string(), "ps".to_string()])
            .expect("non-empty argv");
        assert_eq!(spec.argv(), vec!["docker", "ps"]);
        assert!(CommandSpec::from_argv(&[]).is_none());
    }
}
