//! Successor process launch with listener descriptor passing.
//!
//! The successor is the same executable with the same arguments plus
//! [`INHERIT_FLAG`]. The listening socket is placed at
//! [`INHERITED_FD_START`] in the child with CLOEXEC cleared, and
//! `LISTEN_FDS` / `LISTEN_FD_NAMES` describe it.
//!
//! Unlike an in-place `execve`, the parent survives a failed launch and can
//! go back to serving on the socket it still owns.

use std::ffi::OsString;
use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use thiserror::Error;
use tracing::info;

use crate::listener::{INHERITED_FD_START, LISTEN_FDS, LISTEN_FD_NAMES};

/// Flag telling a freshly launched process to inherit its listener instead
/// of binding a new socket.
pub const INHERIT_FLAG: &str = "--inherit-listener";

/// Error returned when the successor could not be launched.
///
/// The caller still owns the listener and should resume serving.
#[derive(Debug, Error)]
pub enum RespawnError {
    #[error("failed to determine current executable: {0}")]
    CurrentExe(#[source] io::Error),

    #[error("failed to launch successor {}: {source}", .exe.display())]
    Launch {
        exe: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Launches the successor generation.
pub trait Respawn: Send + Sync {
    /// Launch a successor that inherits `listener` under `name`.
    ///
    /// Returns the successor's pid once it has been launched; it does not
    /// wait for the successor to finish starting up.
    fn respawn(&self, listener: BorrowedFd<'_>, name: &str) -> Result<u32, RespawnError>;
}

/// Re-launches an executable as a child process with fd inheritance.
#[derive(Debug, Clone)]
pub struct ProcessRespawner {
    exe: PathBuf,
    args: Vec<OsString>,
}

impl ProcessRespawner {
    /// Respawner for an explicit executable and argument list.
    ///
    /// Any [`INHERIT_FLAG`] already present in `args` is dropped; it is
    /// appended exactly once at launch.
    pub fn new<I, A>(exe: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        let args = args
            .into_iter()
            .map(Into::into)
            .filter(|arg| arg.as_os_str() != INHERIT_FLAG)
            .collect();
        Self {
            exe: exe.into(),
            args,
        }
    }

    /// Respawner for the running executable with its current arguments.
    pub fn current() -> Result<Self, RespawnError> {
        let exe = std::env::current_exe().map_err(RespawnError::CurrentExe)?;
        Ok(Self::new(exe, std::env::args_os().skip(1)))
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Launch the successor and hand back its process handle.
    pub fn spawn(&self, listener: BorrowedFd<'_>, name: &str) -> Result<Child, RespawnError> {
        let source_fd = listener.as_raw_fd();

        info!(
            exe = %self.exe.display(),
            source_fd,
            target_fd = INHERITED_FD_START,
            name,
            "Launching successor process"
        );

        let mut command = Command::new(&self.exe);
        command
            .args(&self.args)
            .arg(INHERIT_FLAG)
            .env(LISTEN_FDS, "1")
            .env(LISTEN_FD_NAMES, name);

        // SAFETY: the hook runs in the forked child before exec and only
        // calls async-signal-safe functions (dup2, fcntl).
        unsafe {
            command.pre_exec(move || place_inherited_fd(source_fd));
        }

        command.spawn().map_err(|source| RespawnError::Launch {
            exe: self.exe.clone(),
            source,
        })
    }
}

impl Respawn for ProcessRespawner {
    fn respawn(&self, listener: BorrowedFd<'_>, name: &str) -> Result<u32, RespawnError> {
        let child = self.spawn(listener, name)?;
        let pid = child.id();
        info!(pid, "Successor launched");
        Ok(pid)
    }
}

/// Move `source` to the inherited slot with CLOEXEC cleared.
///
/// `dup2` never copies FD_CLOEXEC, so only the case where the socket already
/// sits in the slot needs the flag cleared by hand.
fn place_inherited_fd(source: RawFd) -> io::Result<()> {
    if source == INHERITED_FD_START {
        let flags = unsafe { libc::fcntl(source, libc::F_GETFD) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(source, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
    } else if unsafe { libc::dup2(source, INHERITED_FD_START) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsFd;

    #[test]
    fn test_inherit_flag_appended_once() {
        let respawner = ProcessRespawner::new(
            "/usr/bin/moult-server",
            ["--listen", "0.0.0.0:8080", INHERIT_FLAG, "--snapshot", "state.json"],
        );
        let args: Vec<_> = respawner.args().iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(args, ["--listen", "0.0.0.0:8080", "--snapshot", "state.json"]);
        assert_eq!(respawner.exe(), Path::new("/usr/bin/moult-server"));
    }

    /// The child sees the socket at fd 3, the env vars and the flag.
    #[test]
    fn test_child_inherits_socket_at_fixed_slot() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let script = r#"[ "$LISTEN_FDS" = 1 ] && [ "$LISTEN_FD_NAMES" = http ] && [ -S /dev/fd/3 ] && [ "$0" = --inherit-listener ]"#;
        let respawner = ProcessRespawner::new("/bin/sh", ["-c", script]);

        let mut child = respawner.spawn(listener.as_fd(), "http").unwrap();
        let status = child.wait().unwrap();
        assert!(status.success(), "child did not see the inherited socket");

        // The parent keeps its own handle.
        assert!(listener.local_addr().is_ok());
    }

    #[test]
    fn test_launch_failure_is_reported() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let respawner = ProcessRespawner::new("/nonexistent/moult-server", Vec::<String>::new());

        let err = respawner.respawn(listener.as_fd(), "http").unwrap_err();
        assert!(matches!(err, RespawnError::Launch { .. }));
        assert!(listener.local_addr().is_ok());
    }

    /// F_DUPFD_CLOEXEC produces a high fd with CLOEXEC set, which is what the
    /// runtime gives us for every socket; dup2 onto a new slot clears it.
    #[test]
    fn test_dup2_clears_cloexec() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        let high_fd = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 100) };
        assert!(high_fd >= 100);
        let flags = unsafe { libc::fcntl(high_fd, libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);

        let target = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 200) };
        assert!(target >= 200);
        assert!(unsafe { libc::dup2(high_fd, target) } >= 0);
        let flags = unsafe { libc::fcntl(target, libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, 0);

        unsafe {
            libc::close(fd);
            libc::close(high_fd);
            libc::close(target);
        }
    }
}
