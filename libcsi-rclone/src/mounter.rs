//! Mount bridge: running rclone to present remote storage as a local
//! file system.
//!
//! Backends describe a mount as [`MountArguments`] and hand them to a
//! [`Mounter`].  [`RcloneMounter`] starts `rclone mount --daemon`, which
//! detaches the serving process and exits; the mount call only confirms the
//! launch (and, optionally, that the mount point appeared).  Ongoing mount
//! health is not tracked.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};

use crate::error::CsiError;

const MOUNT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STDERR_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Command line and environment for one bridge invocation.
///
/// Credentials travel in `env`, which is applied to the child process only,
/// so they never show up in a process listing.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct MountArguments {
    /// Arguments passed to the bridge binary, in order.
    pub args: Vec<String>,
    /// Extra environment variables for the bridge process.
    pub env: BTreeMap<String, String>,
}

impl std::fmt::Debug for MountArguments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountArguments")
            .field("args", &self.args)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Something that can mount a volume given bridge arguments.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Launch the bridge so that `target` becomes a mount point.
    async fn mount(&self, target: &str, arguments: &MountArguments) -> Result<(), CsiError>;
}

/// [`Mounter`] that runs the rclone binary.
#[derive(Debug, Clone)]
pub struct RcloneMounter {
    binary: PathBuf,
    mount_timeout: Duration,
}

impl RcloneMounter {
    /// * `binary`: rclone executable (looked up in `PATH` if relative)
    /// * `mount_timeout`: how long to wait for `target` to show up in the
    ///   mount table after rclone detaches; zero skips the check
    pub fn new(binary: impl Into<PathBuf>, mount_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            mount_timeout,
        }
    }
}

#[async_trait]
impl Mounter for RcloneMounter {
    #[instrument(skip(self, arguments), fields(binary = %self.binary.display()))]
    async fn mount(&self, mount_path: &str, arguments: &MountArguments) -> Result<(), CsiError> {
        let failed = |reason: String| CsiError::MountFailed {
            path: mount_path.to_owned(),
            reason,
        };

        debug!(args = ?arguments.args, "starting mount bridge");
        let mut child = tokio::process::Command::new(&self.binary)
            .args(&arguments.args)
            .envs(&arguments.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| failed(format!("spawn {}: {e}", self.binary.display())))?;

        let stderr = child.stderr.take();
        let status = child
            .wait()
            .await
            .map_err(|e| failed(format!("wait for {}: {e}", self.binary.display())))?;

        if !status.success() {
            let detail = match stderr {
                Some(stderr) => read_stderr(stderr).await,
                None => String::new(),
            };
            return Err(failed(format!(
                "{} exited with {status}: {}",
                self.binary.display(),
                detail.trim()
            )));
        }

        if !self.mount_timeout.is_zero() {
            wait_for_mount(mount_path, self.mount_timeout).await?;
        }

        info!(mount_path, "mount bridge running");
        Ok(())
    }
}

/// Best-effort capture of the bridge's error output.
async fn read_stderr(mut stderr: tokio::process::ChildStderr) -> String {
    let mut buf = Vec::new();
    match tokio::time::timeout(STDERR_READ_TIMEOUT, stderr.read_to_end(&mut buf)).await {
        Ok(Ok(_)) | Err(_) => String::from_utf8_lossy(&buf).into_owned(),
        Ok(Err(e)) => format!("<stderr unavailable: {e}>"),
    }
}

/// Poll the mount table until `target` is mounted or `timeout` elapses.
async fn wait_for_mount(target: &str, timeout: Duration) -> Result<(), CsiError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if is_mountpoint(target).await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(CsiError::MountFailed {
                path: target.to_owned(),
                reason: format!("not mounted after {timeout:?}"),
            });
        }
        tokio::time::sleep(MOUNT_POLL_INTERVAL).await;
    }
}

/// Return `true` if `path` is currently listed as a mount point in
/// `/proc/self/mounts`.
///
/// Note: `/proc/self/mounts` uses octal escapes (`\040` for space, etc.).
/// Staging paths handed out by the container orchestrator contain no
/// whitespace, so direct string comparison is safe here.
pub async fn is_mountpoint(path: &str) -> bool {
    let contents = match tokio::fs::read_to_string("/proc/self/mounts").await {
        Ok(c) => c,
        Err(_) => return false,
    };
    let path = match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    // Format: <device> <mountpoint> <fstype> <options> <dump> <pass>
    contents
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(path))
}

/// Unmount a FUSE mount point.
///
/// Tries `fusermount3 -u`, then `fusermount -u`, then a lazy `umount2`.
pub async fn unmount(path: &str) -> Result<(), CsiError> {
    for cmd_name in ["fusermount3", "fusermount"] {
        match tokio::process::Command::new(cmd_name)
            .args(["-u", path])
            .output()
            .await
        {
            Ok(output) if output.status.success() => return Ok(()),
            Ok(output) => {
                warn!(
                    path,
                    code = ?output.status.code(),
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "{cmd_name} returned non-zero",
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => debug!(path, error = %e, "{cmd_name} failed to run"),
        }
    }

    nix::mount::umount2(Path::new(path), nix::mount::MntFlags::MNT_DETACH).map_err(|e| {
        CsiError::UnmountFailed {
            path: path.to_owned(),
            reason: format!("umount2: {e}"),
        }
    })
}
