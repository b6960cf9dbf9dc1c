//! A `CommandRunner` that records commands instead of launching them.

use std::fs;
use std::path::Path;

use crate::command::CommandSpec;
use crate::executor::{Captured, CommandRunner, OutputSink};

pub const TIME_REPORT: &str = "real 1.00\nuser 0.50\nsys 0.25\n";

#[derive(Debug, Default)]
pub struct ScriptedRunner {
    pub commands: Vec<CommandSpec>,
    /// Substrings of a rendered argv that make the command fail.
    failing: Vec<String>,
    /// Stdout of `docker build`.
    pub docker_image: String,
}

impl ScriptedRunner {
    pub fn fail_when(&mut self, pattern: &str) {
        self.failing.push(pattern.to_string());
    }

    fn fails(&self, cmd: &CommandSpec) -> bool {
        let line = cmd.argv().join(" ");
        self.failing.iter().any(|p| line.contains(p.as_str()))
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.commands
            .iter()
            .filter(|c| c.argv().join(" ").contains(pattern))
            .count()
    }
}

fn is_test_build(cmd: &CommandSpec) -> bool {
    cmd.args.iter().any(|a| a == "test") && cmd.args.iter().any(|a| a == "-c")
}

/// Leaves the binary `go test -c` would have produced in the build
/// directory.
fn fake_test_binary(cmd: &CommandSpec) -> std::io::Result<()> {
    let dir = cmd.dir.as_deref().unwrap_or(Path::new("."));
    let last = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    fs::create_dir_all(dir)?;
    fs::write(dir.join(format!("{}.test", last)), b"binary")
}

impl CommandRunner for ScriptedRunner {
    fn stream(&mut self, cmd: &CommandSpec, sink: &mut OutputSink) -> Option<String> {
        self.commands.push(cmd.clone());
        let line = cmd.as_command_line(Path::new("/"));
        if self.fails(cmd) {
            let _ = sink.write_chunk(b"scripted failure\n");
            return Some(format!(
                "Error running '{}', exit status 1, stderr = scripted failure",
                line
            ));
        }
        let _ = sink.write_chunk(format!("> {}\n", line).as_bytes());
        None
    }

    fn capture(&mut self, cmd: &CommandSpec) -> Captured {
        self.commands.push(cmd.clone());
        if self.fails(cmd) {
            return Captured {
                success: false,
                combined: "scripted failure\n".to_string(),
                stderr: "scripted failure\n".to_string(),
                error: Some("exit status 1".to_string()),
                ..Captured::default()
            };
        }
        if cmd.program == "docker" {
            return Captured {
                success: true,
                combined: self.docker_image.clone(),
                stdout: self.docker_image.clone(),
                ..Captured::default()
            };
        }
        if is_test_build(cmd) {
            if let Err(e) = fake_test_binary(cmd) {
                return Captured {
                    error: Some(e.to_string()),
                    ..Captured::default()
                };
            }
            return Captured {
                success: true,
                combined: TIME_REPORT.to_string(),
                stderr: TIME_REPORT.to_string(),
                ..Captured::default()
            };
        }
        Captured {
            success: true,
            ..Captured::default()
        }
    }
}
