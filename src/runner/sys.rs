//! Operating-system calls the runner needs: FIFOs, child reaping with
//! resource usage, termination signals and host memory.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::OnceLock;
use std::time::Duration;

use sysinfo::System;

/// How a child process ended.
#[derive(Debug, Clone, Copy)]
pub struct ChildExit {
    /// Exit status
    pub status: ExitStatus,
    /// User plus system CPU time
    pub cpu: Duration,
}

/// Create a named pipe at `path`.
#[allow(unsafe_code)]
pub fn mkfifo(path: &Path, mode: u32) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `c_path` is a valid NUL-terminated string that outlives the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), mode as libc::mode_t) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Block until `pid` has exited, without reaping it.
///
/// The pid stays reserved (as a zombie) until [`reap`] is called, so a
/// signal sent in between cannot reach a recycled process.
#[allow(unsafe_code)]
pub fn wait_exited(pid: u32) -> io::Result<()> {
    let pid = libc::id_t::from(pid);
    loop {
        // SAFETY: `info` is plain data, zero-initialised and only written by
        // the kernel for the duration of the call.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: `info` is a valid, exclusively borrowed siginfo_t.
        let rc = unsafe { libc::waitid(libc::P_PID, pid, &raw mut info, libc::WEXITED | libc::WNOWAIT) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Reap an exited child and collect its resource usage.
#[allow(unsafe_code)]
pub fn reap(pid: u32) -> io::Result<ChildExit> {
    let pid = libc::pid_t::try_from(pid).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: rusage is plain data, zero-initialised.
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        // SAFETY: `status` and `usage` are valid, exclusively borrowed
        // out-parameters for the duration of the call.
        let rc = unsafe { libc::wait4(pid, &raw mut status, 0, &raw mut usage) };
        if rc == pid {
            return Ok(ChildExit {
                status: ExitStatus::from_raw(status),
                cpu: timeval(usage.ru_utime) + timeval(usage.ru_stime),
            });
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn timeval(tv: libc::timeval) -> Duration {
    let secs = u64::try_from(tv.tv_sec).unwrap_or(0);
    let micros = u32::try_from(tv.tv_usec).unwrap_or(0);
    Duration::from_secs(secs) + Duration::from_micros(u64::from(micros))
}

/// Send SIGTERM to `pid`.
#[allow(unsafe_code)]
pub fn terminate(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: kill has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Whether the effective user is root.
#[allow(unsafe_code)]
pub fn is_root() -> bool {
    // SAFETY: geteuid cannot fail and has no preconditions.
    unsafe { libc::geteuid() == 0 }
}

/// Total host memory in GB, `0.0` when unknown.
pub fn total_memory_gb() -> f64 {
    static TOTAL: OnceLock<f64> = OnceLock::new();
    *TOTAL.get_or_init(|| {
        let mut sys = System::new();
        sys.refresh_memory();
        #[allow(clippy::cast_precision_loss)]
        let bytes = sys.total_memory() as f64;
        bytes / (1024.0 * 1024.0 * 1024.0)
    })
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::FileTypeExt;
    use std::process::Command;

    use super::*;

    #[test]
    fn fifo_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipe");
        mkfifo(&path, 0o600).unwrap();
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());
        assert!(mkfifo(&path, 0o600).is_err());
    }

    #[test]
    fn reaps_exit_code_and_usage() {
        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let pid = child.id();
        wait_exited(pid).unwrap();
        let exit = reap(pid).unwrap();
        assert_eq!(exit.status.code(), Some(3));
        assert!(exit.cpu < Duration::from_secs(5));
    }

    #[test]
    fn terminate_stops_child() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        terminate(pid).unwrap();
        wait_exited(pid).unwrap();
        let exit = reap(pid).unwrap();
        assert_eq!(exit.status.signal(), Some(libc::SIGTERM));
    }

    #[test]
    fn host_memory_is_reported() {
        assert!(total_memory_gb() > 0.0);
    }
}
