//! Device locking
//!
//! Advisory mutual exclusion over a serial device, in two layers: a pid
//! file under the system lock directory that cooperating tools honor, and a
//! kernel `flock` on the device node where the platform provides one. The
//! pid file is the portable baseline; the kernel lock catches tools that
//! never look at the lock directory.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::ProtocolError;

#[cfg(unix)]
use nix::{
    errno::Errno,
    fcntl::{Flock, FlockArg},
    sys::signal::kill,
    unistd::Pid,
};

/// System directory for serial device lock files
pub const LOCK_DIR: &str = "/var/lock";

/// Advisory lock on a single device path
///
/// Both layers are released by [`DeviceLock::unlock`], which also runs on
/// drop so every exit path gives the device back.
pub struct DeviceLock {
    device: String,
    lock_dir: PathBuf,
    held: Option<PathBuf>,
    #[cfg(unix)]
    kernel_lock: Option<Flock<fs::File>>,
}

impl DeviceLock {
    /// Lock for `device`, using the system lock directory
    pub fn new(device: &str) -> Self {
        Self::with_lock_dir(device, LOCK_DIR)
    }

    /// Lock for `device`, using an explicit lock directory
    pub fn with_lock_dir(device: &str, lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            device: device.to_string(),
            lock_dir: lock_dir.into(),
            held: None,
            #[cfg(unix)]
            kernel_lock: None,
        }
    }

    /// `LCK..<name>` in the lock directory, with the `/dev/` prefix
    /// stripped and remaining separators flattened
    fn lock_file_path(&self) -> PathBuf {
        let name = self
            .device
            .strip_prefix("/dev/")
            .unwrap_or(&self.device)
            .replace('/', "_");
        self.lock_dir.join(format!("LCK..{name}"))
    }

    /// Acquire the pid-file layer.
    ///
    /// An existing lock file naming a live process fails with
    /// [`ProtocolError::DeviceBusy`]; one naming a dead process is stale and
    /// is reclaimed (with a warning), never silently ignored.
    pub fn lock(&mut self) -> Result<(), ProtocolError> {
        let path = self.lock_file_path();
        match fs::read(&path) {
            Ok(contents) => {
                if let Some(pid) = parse_owner_pid(&contents) {
                    if process_alive(pid) {
                        return Err(ProtocolError::DeviceBusy {
                            device: self.device.clone(),
                            owner: Some(pid),
                        });
                    }
                    warn!(
                        "removing stale lock {} left by pid {pid}",
                        path.display()
                    );
                    fs::remove_file(&path)?;
                }
                // Unparseable contents are ownerless; overwrite below.
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        fs::write(&path, format!("{}\n", std::process::id()))?;
        self.held = Some(path);
        Ok(())
    }

    /// Acquire the kernel layer: an exclusive, non-blocking `flock` on the
    /// device node. Catches a concurrent holder that bypassed the pid file.
    #[cfg(unix)]
    pub fn lock_native(&mut self, device_path: &Path) -> Result<(), ProtocolError> {
        use std::os::unix::fs::OpenOptionsExt;

        let file = fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(device_path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(guard) => {
                self.kernel_lock = Some(guard);
                Ok(())
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                Err(ProtocolError::DeviceBusy {
                    device: self.device.clone(),
                    owner: None,
                })
            }
            Err((_, errno)) => Err(ProtocolError::SerialError(format!(
                "flock on {}: {errno}",
                device_path.display()
            ))),
        }
    }

    /// No kernel locking on this platform; the pid file stands alone.
    #[cfg(not(unix))]
    pub fn lock_native(&mut self, _device_path: &Path) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Release both layers; a no-op if nothing was ever locked
    pub fn unlock(&mut self) {
        #[cfg(unix)]
        {
            self.kernel_lock = None;
        }
        if let Some(path) = self.held.take() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("failed to remove lock {}: {e}", path.display());
            }
        }
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Owning pid recorded in a lock file.
///
/// The canonical encoding is a textual pid; a 4-byte native-endian binary
/// pid is accepted for compatibility with older tools but never written.
fn parse_owner_pid(contents: &[u8]) -> Option<i32> {
    let textual: Option<i32> = std::str::from_utf8(contents)
        .ok()
        .and_then(|s| s.trim().parse().ok());
    let pid = match textual {
        Some(pid) => pid,
        None if contents.len() == 4 => {
            i32::from_ne_bytes([contents[0], contents[1], contents[2], contents[3]])
        }
        None => return None,
    };
    (pid > 0).then_some(pid)
}

/// Whether `pid` names a live process
#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // The process exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Without a liveness probe, never reclaim: a manual removal beats
/// stealing a device from a live owner.
#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    true
}
