use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use crate::container::setup::map_ids;
use crate::error::{Result, StratumError};

/// Check that this process may create the namespaces every job needs.
///
/// Forks a throwaway child that unshares them and maps its ids, exactly as a job's
/// helper process does.
pub fn probe_namespaces() -> Result<()> {
    let uid = nix::unistd::geteuid().as_raw();
    let gid = nix::unistd::getegid().as_raw();
    let uid_map = format!("0 {uid} 1\n").into_bytes();
    let gid_map = format!("0 {gid} 1\n").into_bytes();

    let mut command = Command::new("/proc/self/exe");
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // SAFETY: the hook makes only async-signal-safe calls and never returns on success.
    unsafe {
        command.pre_exec(move || {
            // SAFETY: single-threaded child between fork and exec.
            if let Err((_, errno)) = unsafe { map_ids(&uid_map, &gid_map) } {
                return Err(io::Error::from_raw_os_error(errno));
            }
            unsafe { libc::_exit(0) }
        });
    }

    let status = command
        .status()
        .map_err(|e| StratumError::NamespacesUnavailable(e.to_string()))?;
    if status.success() {
        Ok(())
    } else {
        Err(StratumError::NamespacesUnavailable(format!(
            "probe process exited with {status}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_reports_instead_of_panicking() {
        // Either outcome is fine; sandboxes often forbid user namespaces.
        match probe_namespaces() {
            Ok(()) => {}
            Err(StratumError::NamespacesUnavailable(message)) => assert!(!message.is_empty()),
            Err(other) => panic!("unexpected error {other}"),
        }
    }
}
