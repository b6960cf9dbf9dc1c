//! Running one external command while draining both of its output streams.
//!
//! A child that fills the stderr pipe while the parent blocks reading stdout
//! (or the reverse) never exits, so stdout and stderr each get their own
//! reader thread. Both readers append whole lines to the same sink under a
//! mutex, and both are joined before the child is reaped.

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, PoisonError};
use std::thread;

use tracing::{debug, info, warn};

use crate::command::CommandSpec;

/// Bytes of stderr quoted in a failure message.
const STDERR_TAIL_LIMIT: usize = 16 * 1024;

enum Target {
    File { file: File, path: PathBuf },
    Memory(Vec<u8>),
}

/// Destination for everything the commands of one configuration print, with
/// an optional live echo (normally the console).
pub struct OutputSink {
    target: Target,
    echo: Option<Box<dyn Write + Send>>,
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match &self.target {
            Target::File { path, .. } => format!("file:{}", path.display()),
            Target::Memory(buf) => format!("memory:{}b", buf.len()),
        };
        f.debug_struct("OutputSink")
            .field("target", &target)
            .field("echo", &self.echo.is_some())
            .finish()
    }
}

impl OutputSink {
    /// Creates (truncating) the log file at `path`.
    pub fn file(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            target: Target::File {
                file,
                path: path.to_path_buf(),
            },
            echo: None,
        })
    }

    pub fn memory() -> Self {
        Self {
            target: Target::Memory(Vec::new()),
            echo: None,
        }
    }

    pub fn with_echo(mut self, echo: impl Write + Send + 'static) -> Self {
        self.echo = Some(Box::new(echo));
        self
    }

    pub fn with_console_echo(self) -> Self {
        self.with_echo(io::stdout())
    }

    /// Everything written so far, for in-memory sinks.
    pub fn contents(&self) -> Option<&[u8]> {
        match &self.target {
            Target::Memory(buf) => Some(buf),
            _ => None,
        }
    }

    /// Appends `bytes` to the log, flushes it, then echoes. An echo failure
    /// is not a log failure.
    pub fn write_chunk(&mut self, bytes: &[u8]) -> io::Result<()> {
        match &mut self.target {
            Target::File { file, .. } => {
                file.write_all(bytes)?;
                file.flush()?;
            }
            Target::Memory(buf) => buf.extend_from_slice(bytes),
        }
        if let Some(echo) = self.echo.as_mut() {
            let _ = echo.write_all(bytes).and_then(|_| echo.flush());
        }
        Ok(())
    }

    /// Flushes and releases the destination.
    pub fn close(mut self) -> io::Result<()> {
        match &mut self.target {
            Target::File { file, .. } => file.sync_all(),
            Target::Memory(_) => Ok(()),
        }
    }
}

/// Result of a command whose output was collected rather than streamed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub success: bool,
    /// stdout and stderr interleaved line by line in arrival order.
    pub combined: String,
    pub stdout: String,
    pub stderr: String,
    /// Why the command failed: launch error, wait error, exit status.
    pub error: Option<String>,
}

/// The seam between the matrix engine and the operating system. The engine
/// only ever asks for one of two things: stream a command into a
/// configuration's sink, or run one and hand back what it printed.
pub trait CommandRunner {
    /// Runs `cmd` to completion, streaming both output streams into `sink`.
    /// Returns `None` on success, otherwise a description of the failure.
    fn stream(&mut self, cmd: &CommandSpec, sink: &mut OutputSink) -> Option<String>;

    /// Runs `cmd` to completion and returns everything it printed.
    fn capture(&mut self, cmd: &CommandSpec) -> Captured;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    cwd: PathBuf,
    verbose: u8,
}

impl SystemRunner {
    pub fn new(cwd: &Path, verbose: u8) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
            verbose,
        }
    }

    fn announce(&self, cmd: &CommandSpec) -> String {
        let line = cmd.as_command_line(&self.cwd);
        if self.verbose > 0 {
            info!(command = %line, "running");
        } else {
            debug!(command = %line, "running");
        }
        line
    }
}

impl CommandRunner for SystemRunner {
    fn stream(&mut self, cmd: &CommandSpec, sink: &mut OutputSink) -> Option<String> {
        let line = self.announce(cmd);
        run_streaming(cmd, sink, &line)
    }

    fn capture(&mut self, cmd: &CommandSpec) -> Captured {
        let line = self.announce(cmd);
        run_captured(cmd, &line)
    }
}

/// How much of one output stream a reader holds on to besides writing it
/// to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retain {
    Nothing,
    All,
    /// At least the last `n` bytes, at most `2 * n`.
    Tail(usize),
}

struct Finished {
    status: io::Result<ExitStatus>,
    stdout: io::Result<Vec<u8>>,
    stderr: io::Result<Vec<u8>>,
}

/// Streams `cmd` into `sink`. `line` is the rendering used in failure text.
pub fn run_streaming(cmd: &CommandSpec, sink: &mut OutputSink, line: &str) -> Option<String> {
    let retain_stderr = Retain::Tail(STDERR_TAIL_LIMIT);
    let finished = match spawn_and_drain(cmd, sink, Retain::Nothing, retain_stderr) {
        Ok(f) => f,
        Err((tag, detail)) => {
            return Some(format!("Error [{}] running '{}', {}", tag, line, detail))
        }
    };
    let stderr_text = finished
        .stderr
        .as_ref()
        .map(|b| stderr_tail(b))
        .unwrap_or_default();
    match finished.status {
        Ok(status) if !status.success() => {
            return Some(format!(
                "Error running '{}', {}, stderr = {}",
                line,
                describe_status(status),
                stderr_text
            ));
        }
        Err(e) => return Some(format!("Error running '{}', {}", line, e)),
        Ok(_) => {}
    }
    if let Err(e) = finished.stdout {
        return Some(format!("Error [read stdout] running '{}', {}", line, e));
    }
    if let Err(e) = finished.stderr {
        return Some(format!("Error [read stderr] running '{}', {}", line, e));
    }
    None
}

/// Runs `cmd` and collects its output without echoing it anywhere.
pub fn run_captured(cmd: &CommandSpec, line: &str) -> Captured {
    let mut sink = OutputSink::memory();
    let finished = match spawn_and_drain(cmd, &mut sink, Retain::All, Retain::All) {
        Ok(f) => f,
        Err((tag, detail)) => {
            return Captured {
                error: Some(format!("Error [{}] running '{}', {}", tag, line, detail)),
                ..Captured::default()
            }
        }
    };
    let combined = String::from_utf8_lossy(sink.contents().unwrap_or_default()).into_owned();
    let stdout = finished
        .stdout
        .as_ref()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default();
    let stderr = finished
        .stderr
        .as_ref()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default();
    let error = match (&finished.status, &finished.stdout, &finished.stderr) {
        (Ok(status), _, _) if !status.success() => Some(describe_status(*status)),
        (Err(e), _, _) => Some(e.to_string()),
        (_, Err(e), _) => Some(format!("[read stdout] {}", e)),
        (_, _, Err(e)) => Some(format!("[read stderr] {}", e)),
        _ => None,
    };
    Captured {
        success: error.is_none(),
        combined,
        stdout,
        stderr,
        error,
    }
}

/// Launches `cmd` with both output streams piped, drains them on two scoped
/// threads, and only then waits for the exit status. `Err` carries the
/// launch failure as (stage, detail).
fn spawn_and_drain(
    cmd: &CommandSpec,
    sink: &mut OutputSink,
    keep_stdout: Retain,
    keep_stderr: Retain,
) -> Result<Finished, (&'static str, String)> {
    let mut command = cmd.to_command();
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command
        .spawn()
        .map_err(|e| ("command start", e.to_string()))?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(("pipe setup", "missing stdout/stderr pipe".to_string()));
    };

    let shared = Mutex::new(sink);
    let (stdout_result, stderr_result) = thread::scope(|scope| {
        let out = scope.spawn(|| drain(BufReader::new(stdout), &shared, keep_stdout));
        let err = scope.spawn(|| drain(BufReader::new(stderr), &shared, keep_stderr));
        (join_reader(out.join()), join_reader(err.join()))
    });

    Ok(Finished {
        status: child.wait(),
        stdout: stdout_result,
        stderr: stderr_result,
    })
}

/// Copies `reader` line by line into the shared sink until end of stream or
/// a read error. Dropping the reader on return closes our end of the pipe,
/// so a child still writing gets EPIPE rather than blocking forever.
fn drain<R: BufRead>(
    mut reader: R,
    sink: &Mutex<&mut OutputSink>,
    keep: Retain,
) -> io::Result<Vec<u8>> {
    let mut kept = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            return Ok(kept);
        }
        {
            let mut guard = sink.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = guard.write_chunk(&line) {
                warn!(error = %e, bytes = n, "failed writing command output to log");
            }
        }
        match keep {
            Retain::Nothing => {}
            Retain::All => kept.extend_from_slice(&line),
            Retain::Tail(limit) => {
                kept.extend_from_slice(&line);
                if kept.len() > 2 * limit {
                    kept.drain(..kept.len() - limit);
                }
            }
        }
    }
}

fn join_reader(
    joined: thread::Result<io::Result<Vec<u8>>>,
) -> io::Result<Vec<u8>> {
    joined.unwrap_or_else(|_| Err(io::Error::other("output reader thread panicked")))
}

fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {}", code),
        None => "terminated by signal".to_string(),
    }
}

fn stderr_tail(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(STDERR_TAIL_LIMIT);
    String::from_utf8_lossy(&bytes[start..]).trim_end().to_string()
}
