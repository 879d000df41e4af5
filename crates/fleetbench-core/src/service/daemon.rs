//! Service startup plumbing: port probe, double-fork daemonisation, and the
//! flock'd PID file.
//!
//! Daemonisation must run before any thread exists; the tokio runtime, the
//! S3 SDK, and the worker threads are all created afterwards.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Transient bind-then-close probe so a port conflict surfaces before we
/// daemonise and lose the controlling terminal.
pub fn check_port_available(port: u16) -> Result<()> {
    std::net::TcpListener::bind(("0.0.0.0", port))
        .with_context(|| format!("HTTP service failed to listen on desired port, port {}", port))?;
    Ok(())
}

/// Detach from the terminal: fork, setsid, fork again, chdir to /, and
/// redirect the standard streams to /dev/null (or the given log file, which
/// keeps tracing's stderr writer working unchanged).
pub fn daemonize(log_file: Option<&Path>) -> Result<()> {
    unsafe {
        match libc::fork() {
            -1 => anyhow::bail!("first fork failed"),
            0 => {}
            _ => libc::_exit(0),
        }
        if libc::setsid() == -1 {
            anyhow::bail!("setsid failed");
        }
        match libc::fork() {
            -1 => anyhow::bail!("second fork failed"),
            0 => {}
            _ => libc::_exit(0),
        }
    }

    std::env::set_current_dir("/").context("chdir to / failed")?;

    let stdin = File::open("/dev/null").context("open /dev/null")?;
    let out = match log_file {
        Some(path) => OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open service log file {}", path.display()))?,
        None => OpenOptions::new()
            .write(true)
            .open("/dev/null")
            .context("open /dev/null for writing")?,
    };

    unsafe {
        libc::dup2(stdin.as_raw_fd(), libc::STDIN_FILENO);
        libc::dup2(out.as_raw_fd(), libc::STDOUT_FILENO);
        libc::dup2(out.as_raw_fd(), libc::STDERR_FILENO);
    }

    Ok(())
}

/// Exclusive PID file. The flock is held for the process lifetime through
/// the open file; the file itself is removed again on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    _file: File,
}

pub fn write_pid_file(path: &Path) -> Result<PidFile> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open PID file {}", path.display()))?;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        anyhow::bail!(
            "PID file {} is locked; is another service instance running?",
            path.display()
        );
    }

    file.set_len(0).context("truncate PID file")?;
    writeln!(&file, "{}", std::process::id()).context("write PID file")?;
    (&file).flush().context("flush PID file")?;

    Ok(PidFile {
        path: path.to_path_buf(),
        _file: file,
    })
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_is_exclusive_and_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.pid");

        let pid_file = write_pid_file(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        drop(pid_file);
        assert!(!path.exists());
    }

    #[test]
    fn free_port_probe_succeeds() {
        // bind to an ephemeral port to find a free one, then probe it
        let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(check_port_available(port).is_ok());
    }

    #[test]
    fn taken_port_probe_fails() {
        let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(check_port_available(port).is_err());
    }
}
