//! Process plumbing: daemonize, privilege drop, pidfile handling.

use anyhow::{bail, Context, Result};
use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

/// Classic double-fork detach; stdio is pointed at /dev/null.
pub fn daemonize() -> Result<()> {
    // SAFETY: single-threaded at this point — workers start after detach.
    unsafe {
        match libc::fork() {
            -1 => bail!("fork failed: {}", std::io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }
        if libc::setsid() < 0 {
            bail!("setsid failed: {}", std::io::Error::last_os_error());
        }
        match libc::fork() {
            -1 => bail!("fork failed: {}", std::io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }

        let devnull = CString::new("/dev/null").unwrap();
        for (fd, mode) in [(0, libc::O_RDONLY), (1, libc::O_WRONLY), (2, libc::O_WRONLY)] {
            let new_fd = libc::open(devnull.as_ptr(), mode);
            if new_fd >= 0 && new_fd != fd {
                libc::dup2(new_fd, fd);
                libc::close(new_fd);
            }
        }
    }
    Ok(())
}

/// Drop to the given user/group. Requires root; group is applied first so the
/// user change cannot lock us out of it.
pub fn set_privileges(user: Option<&str>, group: Option<&str>) -> Result<()> {
    if user.is_none() && group.is_none() {
        return Ok(());
    }
    // SAFETY: getuid/getpwnam/getgrnam/setgid/setuid with checked results;
    // called before any worker thread exists.
    unsafe {
        if libc::getuid() != 0 {
            bail!("only root can change uid/gid");
        }

        if let Some(group) = group {
            let cname = CString::new(group)?;
            let entry = libc::getgrnam(cname.as_ptr());
            let gid = if entry.is_null() {
                group.parse::<u32>().ok().unwrap_or(0)
            } else {
                (*entry).gr_gid
            };
            if gid == 0 {
                bail!("invalid group '{group}'");
            }
            if libc::setgid(gid) != 0 {
                bail!(
                    "can't set group id {} for group '{}': {}",
                    gid,
                    group,
                    std::io::Error::last_os_error()
                );
            }
        }

        if let Some(user) = user {
            let cname = CString::new(user)?;
            let entry = libc::getpwnam(cname.as_ptr());
            let uid = if entry.is_null() {
                user.parse::<u32>().ok().unwrap_or(0)
            } else {
                (*entry).pw_uid
            };
            if uid == 0 {
                bail!("invalid user '{user}'");
            }
            if libc::setuid(uid) != 0 {
                bail!(
                    "can't set user id {} for user '{}': {}",
                    uid,
                    user,
                    std::io::Error::last_os_error()
                );
            }
        }
    }
    Ok(())
}

fn process_exists(pid: i32) -> bool {
    // SAFETY: kill with signal 0 only probes for existence.
    unsafe { libc::kill(pid, 0) == 0 }
}

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Refuse to start if the registered process is still alive; remove a
    /// stale or garbage file and take it over.
    pub fn check(path: &Path) -> Result<()> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("read pidfile {}", path.display())),
        };
        match content.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => {
                if process_exists(pid) {
                    bail!(
                        "a process with pid {} registered in {} is already running",
                        pid,
                        path.display()
                    );
                }
                warn!("removing stale pidfile {} (pid {})", path.display(), pid);
            }
            _ => warn!("removing garbage pidfile {}", path.display()),
        }
        fs::remove_file(path).with_context(|| format!("remove stale pidfile {}", path.display()))
    }

    /// Write our own pid. Call after daemonizing — the pid changes on fork.
    pub fn write(path: &Path) -> Result<Self> {
        fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("write pidfile {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn remove(self) {
        if let Err(e) = fs::remove_file(&self.path) {
            error!("failed to remove pidfile {}: {}", self.path.display(), e);
        }
    }
}
