use std::ffi::OsString;
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use tracing::{debug, info, warn};

use crate::commands::quote;

const HIGH_INTEGRITY_SIDS: [&str; 2] = ["S-1-16-12288", "S-1-16-16384"];

/// Reports and obtains the elevated rights package mutations need.
pub trait PrivilegeGate: Send + Sync {
    fn is_elevated(&self) -> bool;

    /// May relaunch the process elevated. Always `false`: the current process
    /// should stop either way.
    fn request_elevation(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticPrivilege(pub bool);

impl PrivilegeGate for StaticPrivilege {
    fn is_elevated(&self) -> bool {
        self.0
    }

    fn request_elevation(&self) -> bool {
        false
    }
}

/// Asks the operating system directly rather than through the package-manager
/// executor.
#[derive(Debug, Default)]
pub struct SystemPrivilegeGate {
    elevated: OnceLock<bool>,
}

impl SystemPrivilegeGate {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PrivilegeGate for SystemPrivilegeGate {
    fn is_elevated(&self) -> bool {
        *self.elevated.get_or_init(detect_elevation)
    }

    fn request_elevation(&self) -> bool {
        let args = std::env::args_os().skip(1).collect::<Vec<_>>();
        match std::env::current_exe() {
            Ok(exe) => {
                let script = relaunch_script(&exe.to_string_lossy(), &args);
                info!("relaunching with elevated rights");
                let status = Command::new("powershell.exe")
                    .arg("-NoProfile")
                    .arg("-Command")
                    .arg(script)
                    .stdin(Stdio::null())
                    .status();
                if let Err(err) = status {
                    warn!("failed to request elevation: {err}");
                }
            }
            Err(err) => warn!("failed to resolve current executable for elevation: {err}"),
        }
        false
    }
}

/// `Start-Process -ArgumentList` joins its elements with spaces and adds no
/// quoting, so each argument carries its own command-line quotes.
pub(crate) fn relaunch_script(exe: &str, args: &[OsString]) -> String {
    let mut script = format!("Start-Process -FilePath {} -Verb RunAs", quote(exe));
    let filtered = args
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .filter(|arg| arg != "--elevate")
        .map(|arg| quote(&command_line_argument(&arg)))
        .collect::<Vec<_>>();
    if !filtered.is_empty() {
        script.push_str(" -ArgumentList ");
        script.push_str(&filtered.join(","));
    }
    script
}

/// Quotes one argument for the Windows command-line parser: backslashes are
/// literal unless they precede a quote or the closing quote.
pub(crate) fn command_line_argument(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    let mut backslashes = 0_usize;
    for ch in arg.chars() {
        match ch {
            '\\' => backslashes += 1,
            '"' => {
                quoted.push_str(&"\\".repeat(backslashes * 2 + 1));
                quoted.push('"');
                backslashes = 0;
            }
            other => {
                quoted.push_str(&"\\".repeat(backslashes));
                quoted.push(other);
                backslashes = 0;
            }
        }
    }
    quoted.push_str(&"\\".repeat(backslashes * 2));
    quoted.push('"');
    quoted
}

fn detect_elevation() -> bool {
    let elevated = if cfg!(windows) {
        command_stdout("whoami", &["/groups"])
            .map(|output| groups_indicate_elevation(&output))
            .unwrap_or(false)
    } else {
        command_stdout("id", &["-u"])
            .map(|output| uid_is_root(&output))
            .unwrap_or(false)
    };
    debug!("process elevation detected: {elevated}");
    elevated
}

fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .map_err(|err| warn!("failed to run {program}: {err}"))
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub(crate) fn groups_indicate_elevation(output: &str) -> bool {
    output
        .lines()
        .any(|line| HIGH_INTEGRITY_SIDS.iter().any(|sid| line.contains(sid)))
}

pub(crate) fn uid_is_root(output: &str) -> bool {
    output.trim() == "0"
}
