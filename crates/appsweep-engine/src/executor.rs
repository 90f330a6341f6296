use std::ffi::OsString;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};
use wait_timeout::ChildExt;

pub const TIMED_OUT_MESSAGE: &str = "command timed out";

const SCRIPT_PREAMBLE: &str =
    "$ErrorActionPreference = 'Stop'; $ProgressPreference = 'SilentlyContinue'; ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub output: String,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }

    pub fn timed_out() -> Self {
        Self::failed(TIMED_OUT_MESSAGE)
    }

    /// First non-empty line of the output, for one-line diagnostics.
    pub fn summary(&self) -> String {
        self.output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("no output")
            .to_string()
    }
}

/// Runs one opaque command to completion or until the timeout elapses.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, command: &str, timeout: Duration) -> CommandOutput;
}

#[derive(Debug, Clone)]
pub struct PowerShellExecutor {
    program: OsString,
}

impl Default for PowerShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerShellExecutor {
    pub fn new() -> Self {
        let program = if cfg!(windows) { "powershell.exe" } else { "pwsh" };
        Self {
            program: program.into(),
        }
    }

    pub fn with_program(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn build_command(&self, script: &str) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("-NoProfile")
            .arg("-NonInteractive")
            .arg("-ExecutionPolicy")
            .arg("Bypass")
            .arg("-Command")
            .arg(format!("{SCRIPT_PREAMBLE}{script}"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

impl CommandExecutor for PowerShellExecutor {
    fn execute(&self, command: &str, timeout: Duration) -> CommandOutput {
        debug!("running package manager command: {command}");
        let mut child = match self.build_command(command).spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!("failed to start {}: {err}", self.program.to_string_lossy());
                return CommandOutput::failed(format!(
                    "failed to start {}: {err}",
                    self.program.to_string_lossy()
                ));
            }
        };

        let (stdout_reader, stderr_reader) = drain_pipes(&mut child);
        let status = match child.wait_timeout(timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                warn!("command timed out after {}s: {command}", timeout.as_secs());
                return CommandOutput::timed_out();
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return CommandOutput::failed(format!("failed waiting for command: {err}"));
            }
        };

        let stdout = join_reader(stdout_reader);
        let stderr = join_reader(stderr_reader);
        if status.success() {
            debug!("command output: {}", stdout.trim());
            return CommandOutput::ok(stdout);
        }

        warn!(
            "command failed: status={} stderr='{}'",
            status,
            stderr.trim()
        );
        let diagnostic = if stderr.trim().is_empty() {
            format!("status={} stdout='{}'", status, stdout.trim())
        } else {
            stderr
        };
        CommandOutput::failed(diagnostic)
    }
}

type PipeReader = Option<JoinHandle<String>>;

fn drain_pipes(child: &mut Child) -> (PipeReader, PipeReader) {
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);
    (stdout, stderr)
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = pipe.read_to_end(&mut buffer);
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn join_reader(reader: PipeReader) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}
