//! Running rendered commands as child processes.
//!
//! Children inherit the server's stdout and stderr. Each child is placed in
//! its own process group so a timeout can take down anything it spawned.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::error::{Result, RunnerError};

/// How long to wait for a killed child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// A command whose program has been resolved to a path.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCommand {
    program: PathBuf,
    argv: Vec<String>,
}

impl PreparedCommand {
    /// Resolve the program (`argv[0]`) against `PATH`.
    pub fn resolve(argv: Vec<String>) -> Result<Self> {
        let name = argv.first().map(String::as_str).unwrap_or_default();
        let program = which::which(name).map_err(|e| RunnerError::ExecutableNotFound {
            program: name.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { program, argv })
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// Arguments as rendered, program name first.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

/// Resolve every command of a unit. Fails on the first unresolvable program
/// so nothing in the unit is started.
pub fn resolve_all(commands: Vec<Vec<String>>) -> Result<Vec<PreparedCommand>> {
    commands.into_iter().map(PreparedCommand::resolve).collect()
}

/// Run one command to completion or until `timeout` elapses.
///
/// `env` holds `KEY=VALUE` entries; when empty the child inherits the server
/// environment. A blank `dir` keeps the server's working directory.
pub async fn run_command(
    cmd: &PreparedCommand,
    env: &[String],
    dir: &str,
    timeout: Duration,
) -> Result<()> {
    info!("Running {:?}", cmd.argv);

    let mut command = Command::new(&cmd.program);
    command
        .args(cmd.argv.iter().skip(1))
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    if !env.is_empty() {
        command.env_clear();
        for entry in env {
            match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    command.env(key, value);
                }
                _ => warn!("Ignoring malformed environment entry {:?}", entry),
            }
        }
    }
    if !dir.is_empty() {
        command.current_dir(dir);
    }
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|source| RunnerError::Spawn {
        program: cmd.program.display().to_string(),
        source,
    })?;

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) if status.success() => {
            debug!(%status, "Command {:?} finished", cmd.argv);
            Ok(())
        }
        Ok(Ok(status)) => Err(RunnerError::ProcessFailed {
            command: cmd.argv.clone(),
            status,
        }),
        Ok(Err(e)) => Err(RunnerError::Io(e)),
        Err(_) => {
            kill_process_group(&mut child, &cmd.argv).await;
            Err(RunnerError::Timeout {
                command: cmd.argv.clone(),
                timeout,
            })
        }
    }
}

/// SIGKILL the child's process group, then reap the child.
async fn kill_process_group(child: &mut Child, argv: &[String]) {
    warn!("Command {:?} timed out, killing it", argv);

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            warn!("Failed to kill process group {}: {}", pid, e);
        }
    }

    // Only path on non-Unix; on Unix it covers a failed killpg.
    let _ = child.start_kill();
    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!("Error waiting for killed command {:?}: {}", argv, e),
        Err(_) => error!("Command {:?} still alive after SIGKILL", argv),
    }
}
