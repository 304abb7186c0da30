use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;

use tokio::process::Child;
use tokio::process::Command;

use crate::error::RelayErr;
use crate::error::Result;

#[cfg(unix)]
const EXIT_CODE_SIGNAL_BASE: i32 = 128; // conventional shell: 128 + signal

/// Spawns the external program with piped output channels.
///
/// The child is deliberately not killed on drop: a superseded invocation
/// keeps running to its own completion, only its output visibility is
/// detached.
pub(crate) fn spawn_invocation_child(
    program: &str,
    args: &[String],
    working_dir: Option<&PathBuf>,
    env: &HashMap<String, String>,
) -> Result<Child> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }
    for (key, value) in env {
        command.env(key, value);
    }
    command.spawn().map_err(|source| RelayErr::Spawn {
        program: program.to_string(),
        source,
    })
}

#[cfg(unix)]
pub(crate) fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.code().unwrap_or_else(|| match status.signal() {
        Some(signal) => EXIT_CODE_SIGNAL_BASE + signal,
        None => -1,
    })
}

#[cfg(not(unix))]
pub(crate) fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
