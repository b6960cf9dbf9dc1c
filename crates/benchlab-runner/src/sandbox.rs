use anyhow::{anyhow, Result};
use tracing::info;

use crate::command::CommandSpec;
use crate::executor::CommandRunner;
use crate::layout::Layout;
use crate::matrix::Matrix;

/// Which execution paths the enabled benchmarks need.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SandboxNeeds {
    pub sandboxed: bool,
    pub unsandboxed: bool,
}

impl SandboxNeeds {
    pub fn of(matrix: &Matrix) -> Self {
        matrix
            .benchmarks
            .iter()
            .filter(|b| !b.disabled)
            .fold(Self::default(), |needs, b| Self {
                sandboxed: needs.sandboxed || !b.not_sandboxed,
                unsandboxed: needs.unsandboxed || b.not_sandboxed,
            })
    }
}

/// Where sandboxed benchmarks run. Created once, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxHandle {
    Unsandboxed,
    Image(String),
}

impl SandboxHandle {
    pub fn image(&self) -> Option<&str> {
        match self {
            Self::Image(id) => Some(id),
            Self::Unsandboxed => None,
        }
    }
}

/// Resolves the run environment: an externally supplied identifier is
/// trusted as is; otherwise an image is built only when some enabled
/// benchmark needs isolation.
pub fn prepare<R: CommandRunner>(
    runner: &mut R,
    needs: SandboxNeeds,
    external: Option<&str>,
    layout: &Layout,
) -> Result<SandboxHandle> {
    if let Some(id) = external {
        return Ok(SandboxHandle::Image(id.to_string()));
    }
    if !needs.sandboxed {
        return Ok(SandboxHandle::Unsandboxed);
    }
    build_image(runner, layout).map(SandboxHandle::Image)
}

/// `docker build -q .` in the harness directory; the image id is the
/// trimmed stdout. Any failure is fatal.
pub fn build_image<R: CommandRunner>(runner: &mut R, layout: &Layout) -> Result<String> {
    let mut cmd = CommandSpec::new("docker");
    cmd.args(["build", "-q", "."]).current_dir(&layout.cwd);
    let out = runner.capture(&cmd);
    if !out.success {
        return Err(anyhow!(
            "There was an error running 'docker build' ({}), stderr = {}",
            out.error.unwrap_or_default(),
            out.stderr.trim_end()
        ));
    }
    let id = out.stdout.trim().to_string();
    if id.is_empty() {
        return Err(anyhow!("'docker build' printed no image id"));
    }
    info!(image = %id, "sandbox image built");
    Ok(id)
}
