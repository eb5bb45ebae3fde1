use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{geteuid, getuid, Pid, User};
use std::collections::BTreeSet;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::Command;

use super::{capture, Caller, DaemonProcess, Platform};
use crate::config::{self, CtlConfig};
use crate::error::{CtlError, Result};
use crate::flags;
use crate::stakeholder::{self, Owner};

const DEFAULT_FLAGS: &[(&str, &str)] = &[
    (flags::COMPILER_PROXY_DAEMON_MODE, "true"),
    (flags::COMPILER_PROXY_SOCKET_NAME, "goma.ipc"),
    (flags::COMPILER_PROXY_LOCK_FILENAME, "goma_compiler_proxy.lock"),
    (flags::COMPILER_PROXY_PORT, "8088"),
];

/// Decimal for 0600; glog reads the mode as an integer.
const GLOG_LOGFILE_MODE: &str = "384";

pub struct PosixPlatform {
    fuser: OnceLock<Option<PathBuf>>,
}

impl PosixPlatform {
    pub fn new() -> Self {
        Self {
            fuser: OnceLock::new(),
        }
    }

    fn fuser_path(&self) -> Option<&Path> {
        self.fuser
            .get_or_init(|| which::which("fuser").ok())
            .as_deref()
    }

    async fn fuser_owners(&self, fuser: &Path, resource: &str) -> Result<Option<Vec<Owner>>> {
        let (out, err) = capture(fuser, &["-u", resource]).await?;
        if out.trim().is_empty() {
            return Ok(None);
        }
        let (pids, users) = stakeholder::parse_fuser(&out, &err);
        if pids.is_empty() || users.is_empty() {
            return Ok(None);
        }
        let owners = pids
            .into_iter()
            .zip(users)
            .map(|(pid, user)| Owner {
                pid,
                uid: User::from_name(&user)
                    .ok()
                    .flatten()
                    .map(|u| u.uid.as_raw()),
                resource: resource.to_string(),
            })
            .collect();
        Ok(Some(owners))
    }
}

impl Default for PosixPlatform {
    fn default() -> Self {
        Self::new()
    }
}

fn user_runtime_dir() -> Option<PathBuf> {
    if !cfg!(target_os = "linux") {
        return None;
    }
    let dir = PathBuf::from(format!("/run/user/{}", getuid().as_raw()));
    dir.is_dir().then_some(dir)
}

#[async_trait]
impl Platform for PosixPlatform {
    fn daemon_binary_name(&self) -> &'static str {
        "compiler_proxy"
    }

    fn helper_binary_name(&self) -> &'static str {
        "gomacc"
    }

    fn default_flags(&self) -> &'static [(&'static str, &'static str)] {
        DEFAULT_FLAGS
    }

    fn detected_platform(&self) -> Option<&'static str> {
        cfg!(target_os = "macos").then_some("mac")
    }

    fn caller(&self) -> Option<Caller> {
        let uid = getuid();
        Some(Caller {
            uid: uid.as_raw(),
            privileged: uid.is_root(),
        })
    }

    fn tmp_dir(&self) -> PathBuf {
        user_runtime_dir()
            .unwrap_or_else(config::system_temp_dir)
            .join(config::user_tmp_dir_name())
    }

    fn ensure_owned_by_user(&self, dir: &Path) -> Result<bool> {
        // lstat so a planted symlink is never trusted.
        let meta = std::fs::symlink_metadata(dir)?;
        if meta.uid() != geteuid().as_raw() {
            return Ok(false);
        }
        if let Err(e) = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)) {
            tracing::warn!(dir = %dir.display(), error = %e, "chmod failure");
            return Ok(false);
        }
        Ok(true)
    }

    async fn find_owners(&self, resource: &str, network: bool) -> Result<Vec<Owner>> {
        if !network {
            if let Some(fuser) = self.fuser_path() {
                if let Some(owners) = self.fuser_owners(fuser, resource).await? {
                    return Ok(owners);
                }
            }
        }

        let lsof = which::which("lsof")
            .map_err(|_| CtlError::Config("lsof not found in PATH".into()))?;
        let mut args = vec!["-F", "pu"];
        if network {
            args.push("-i");
        }
        args.push(resource);
        // lsof exits 1 both for warnings and for "no owner"; only output matters.
        let (out, _) = capture(&lsof, &args).await?;
        Ok(stakeholder::lsof_owners(&out, resource))
    }

    async fn kill(&self, pids: &BTreeSet<u32>) -> Result<()> {
        for &pid in pids {
            let raw = i32::try_from(pid)
                .map_err(|_| CtlError::Daemon(format!("invalid pid {}", pid)))?;
            tracing::info!(pid, "Sending SIGTERM");
            match kill(Pid::from_raw(raw), Signal::SIGTERM) {
                Ok(()) => {}
                // Exited since it was found.
                Err(Errno::ESRCH) => tracing::debug!(pid, "Stakeholder already gone"),
                Err(e) => {
                    return Err(CtlError::Daemon(format!("failed to kill {}: {}", pid, e)))
                }
            }
        }
        Ok(())
    }

    async fn spawn_daemon(&self, config: &CtlConfig) -> Result<DaemonProcess> {
        let daemonized = config
            .flags
            .is_true(flags::COMPILER_PROXY_DAEMON_MODE, false);
        let child = Command::new(&config.daemon_binary)
            .envs(config.flags.vars())
            .env("GLOG_logfile_mode", GLOG_LOGFILE_MODE)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| {
                CtlError::Config(format!(
                    "failed to execute {}: {}",
                    config.daemon_binary.display(),
                    e
                ))
            })?;
        tracing::debug!(pid = ?child.id(), daemonized, "Spawned compiler_proxy");
        Ok(DaemonProcess {
            child: Some(child),
            daemonized,
        })
    }
}
