//! Process management: pidfile ownership, signal handling, forked worker
//! pools and their reaping.
//!
//! Errors never cross the fork boundary as values; a worker that fails
//! logs the cause and exits non-zero, and the parent only ever looks at
//! exit codes.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Error};
use log::{debug, error, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use crate::tools;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Install the SIGTERM/SIGINT handlers that turn signals into a flag
/// consulted at every blocking boundary. Also makes us a process group
/// leader so that a single killpg reaches every descendant.
pub fn install_signal_handlers() -> Result<(), Error> {
    let action = SigAction::new(
        SigHandler::Handler(handle_shutdown_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );

    unsafe {
        nix::sys::signal::sigaction(Signal::SIGTERM, &action)?;
        nix::sys::signal::sigaction(Signal::SIGINT, &action)?;
    }

    // ignore SIGPIPE, broken queue peers surface as EPIPE instead
    unsafe {
        nix::sys::signal::sigaction(
            Signal::SIGPIPE,
            &SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty()),
        )?;
    }

    // best effort: when we already lead a group (shell job) this fails
    let _ = unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0));

    Ok(())
}

/// Whether a termination signal was received by this process.
pub fn asked_to_quit() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

pub fn my_pid() -> i32 {
    unistd::getpid().as_raw()
}

/// Probe liveness without sending an actual signal.
pub fn pid_is_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Write our pid to the given file.
pub fn create_pidfile(path: &Path, pid: i32) -> Result<(), Error> {
    tools::file_set_contents(path, format!("{}\n", pid).as_bytes())
}

/// Read a pidfile and return the pid when it belongs to a live process.
///
/// Only the happy path matters here: an unreadable pidfile or a stale pid
/// is removed on the spot, so the caller can go on and take ownership.
pub fn read_pidfile(path: &Path) -> Result<Option<i32>, Error> {
    if !tools::file_exists(path) {
        return Ok(None);
    }

    let contents = tools::file_get_contents(path)?;

    match contents.trim().parse::<i32>() {
        Ok(pid) if pid_is_alive(pid) => Ok(Some(pid)),
        Ok(pid) => {
            debug!("removing stale pidfile {:?} (pid {} is gone)", path, pid);
            let _ = std::fs::remove_file(path);
            Ok(None)
        }
        Err(_) => {
            warn!("removing unreadable pidfile {:?}", path);
            let _ = std::fs::remove_file(path);
            Ok(None)
        }
    }
}

/// Fork one worker. The child runs the given closure and exits; it never
/// returns to the caller's code path.
pub fn fork_worker<F>(name: &str, worker: F) -> Result<Pid, Error>
where
    F: FnOnce() -> Result<(), Error>,
{
    match unsafe { unistd::fork() } {
        Ok(ForkResult::Parent { child }) => {
            debug!("started {} worker {}", name, child);
            Ok(child)
        }
        Ok(ForkResult::Child) => {
            let code = match worker() {
                Ok(()) => 0,
                Err(err) => {
                    error!("{} worker: {:#}", name, err);
                    1
                }
            };
            // skip destructors: the parent's connections were inherited
            // and must not see a Terminate message from this process
            std::process::exit(code);
        }
        Err(err) => bail!("fork failed for {} worker - {}", name, err),
    }
}

/// Wait for a specific set of children; true when all exited zero.
pub fn wait_for_pids(pids: &[Pid]) -> Result<bool, Error> {
    let mut all_zero = true;

    for pid in pids {
        match waitpid(*pid, None) {
            Ok(WaitStatus::Exited(pid, code)) => {
                if code == 0 {
                    debug!("subprocess {} exited with code 0", pid);
                } else {
                    all_zero = false;
                    error!("subprocess {} exited with code {}", pid, code);
                }
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                all_zero = false;
                error!("subprocess {} was terminated by {:?}", pid, signal);
            }
            Ok(status) => {
                debug!("subprocess wait: {:?}", status);
            }
            Err(err) => {
                all_zero = false;
                error!("waitpid({}) failed - {}", pid, err);
            }
        }
    }

    Ok(all_zero)
}

/// Wait until no child process is left; true when every one of them
/// exited zero.
pub fn wait_for_subprocesses() -> bool {
    let mut all_zero = true;

    debug!("waiting for subprocesses to finish");

    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Err(nix::Error::Sys(Errno::ECHILD)) => {
                debug!("wait_for_subprocesses: no more children");
                return all_zero;
            }
            Err(err) => {
                warn!("waitpid failed - {}", err);
                std::thread::sleep(Duration::from_millis(100));
            }
            Ok(WaitStatus::StillAlive) => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Ok(WaitStatus::Exited(pid, code)) => {
                if code == 0 {
                    debug!("subprocess {} exited with code 0", pid);
                } else {
                    all_zero = false;
                    error!("subprocess {} exited with code {}", pid, code);
                }
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                all_zero = false;
                error!("subprocess {} was terminated by {:?}", pid, signal);
            }
            Ok(_) => {}
        }
    }
}

/// Send SIGTERM to the whole process group and reap every descendant.
pub fn fatal_exit() -> bool {
    error!("terminating all processes in our process group");

    if let Err(err) = killpg(unistd::getpgrp(), Signal::SIGTERM) {
        error!("unable to signal our process group - {}", err);
        return false;
    }

    wait_for_subprocesses()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pidfile_live_and_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pgclone.pid");

        // our own pid is alive
        create_pidfile(&path, my_pid()).unwrap();
        assert_eq!(read_pidfile(&path).unwrap(), Some(my_pid()));

        // a pid that cannot exist is stale, and the file gets removed
        create_pidfile(&path, i32::MAX - 1).unwrap();
        assert_eq!(read_pidfile(&path).unwrap(), None);
        assert!(!path.exists());

        // garbage content is treated like a stale file
        tools::file_set_contents(&path, b"not-a-pid\n").unwrap();
        assert_eq!(read_pidfile(&path).unwrap(), None);
    }

    #[test]
    fn missing_pidfile_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_pidfile(&dir.path().join("nope")).unwrap(), None);
    }
}
