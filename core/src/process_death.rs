// Process-level hooks for pooled shells: the parent-death signal installed in
// the forked child and the signals sent to a shell's whole process group.

use std::io;

use tokio::process::Command;

/// Puts the shell in its own process group and, on Linux, arranges for it to
/// receive SIGTERM when this process dies.
pub(crate) fn harden(command: &mut Command) {
    command.process_group(0);

    #[cfg(target_os = "linux")]
    {
        // SAFETY: getpid has no preconditions.
        let parent_pid = unsafe { libc::getpid() };
        // SAFETY: the hook only calls async-signal-safe functions.
        unsafe {
            command.pre_exec(move || {
                set_parent_death(parent_pid);
                Ok(())
            });
        }
    }
}

/// Requests a graceful stop of the shell itself.
pub(crate) fn terminate(pid: u32) -> io::Result<()> {
    send(pid, libc::SIGTERM, false)
}

/// Kills the shell and every command it started.
pub(crate) fn kill_group(pid: u32) -> io::Result<()> {
    send(pid, libc::SIGKILL, true)
}

fn send(pid: u32, signal: libc::c_int, group: bool) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: plain syscalls on a pid we spawned.
    let rc = unsafe {
        if group {
            libc::killpg(pid, signal)
        } else {
            libc::kill(pid, signal)
        }
    };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    // The process may already be gone.
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

/// Sets SIGTERM as the parent-death signal. Exits right away if the parent
/// died between fork and this call.
#[cfg(target_os = "linux")]
fn set_parent_death(parent_pid: libc::pid_t) {
    // SAFETY: prctl, getppid and kill are async-signal-safe.
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
        if libc::getppid() != parent_pid {
            libc::kill(libc::getpid(), libc::SIGTERM);
        }
    }
}
