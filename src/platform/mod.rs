//! OS-specific capabilities behind a single trait, selected once at startup.

#[cfg(unix)]
mod posix;
#[cfg(windows)]
mod windows;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

use crate::config::CtlConfig;
use crate::error::{CtlError, Result};
use crate::package;
use crate::stakeholder::{self, Owner};

#[cfg(unix)]
pub use posix::PosixPlatform;
#[cfg(windows)]
pub use windows::WindowsPlatform;

/// Identity of the user running this tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub uid: u32,
    /// Root-equivalent callers may act on anyone's processes.
    pub privileged: bool,
}

/// Result of one attempt at resolving the control port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortProbe {
    Ready(u16),
    /// The daemon did not answer yet; worth polling again.
    NotReady(String),
}

/// A daemon launched by this invocation.
#[derive(Debug)]
pub struct DaemonProcess {
    pub child: Option<Child>,
    /// In daemon mode the launched process forks and exits on purpose.
    pub daemonized: bool,
}

impl DaemonProcess {
    /// True when the launched process already exited and that is fatal.
    pub fn has_died(&mut self) -> Result<Option<String>> {
        if self.daemonized {
            return Ok(None);
        }
        match self.child.as_mut() {
            Some(child) => Ok(child.try_wait()?.map(|status| status.to_string())),
            None => Ok(None),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub async fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "Launched compiler_proxy already gone");
            }
        }
    }
}

#[async_trait]
pub trait Platform: Send + Sync {
    fn daemon_binary_name(&self) -> &'static str;

    fn helper_binary_name(&self) -> &'static str;

    /// `GOMA_*` defaults (without prefix) applied when the flag is unset.
    fn default_flags(&self) -> &'static [(&'static str, &'static str)];

    fn default_ssl_flags(&self) -> &'static [(&'static str, &'static str)] {
        &[]
    }

    /// Package platform implied by the host, if any.
    fn detected_platform(&self) -> Option<&'static str> {
        None
    }

    /// `None` where processes carry no comparable owner identity.
    fn caller(&self) -> Option<Caller>;

    /// Default goma temp directory when `GOMA_TMP_DIR` is not set.
    fn tmp_dir(&self) -> PathBuf;

    /// Extra files the installation needs on this OS.
    fn check_platform_config(&self, _install_dir: &Path) -> Result<()> {
        Ok(())
    }

    /// Verifies an existing directory belongs to the caller and tightens its
    /// permissions.
    fn ensure_owned_by_user(&self, _dir: &Path) -> Result<bool> {
        Ok(true)
    }

    async fn find_owners(&self, resource: &str, network: bool) -> Result<Vec<Owner>>;

    async fn process_running(&self, config: &CtlConfig) -> Result<bool> {
        let pids = stakeholder::find_stakeholders(self, &config.resources(), true).await?;
        Ok(!pids.is_empty())
    }

    async fn kill(&self, pids: &BTreeSet<u32>) -> Result<()>;

    async fn spawn_daemon(&self, config: &CtlConfig) -> Result<DaemonProcess>;

    /// Asks the helper binary for the daemon's control port.
    async fn probe_port(&self, config: &CtlConfig) -> Result<PortProbe> {
        let mut cmd = Command::new(&config.helper_binary);
        cmd.arg("port")
            .envs(config.flags.vars())
            .env("GLOG_logtostderr", "true")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output =
            match tokio::time::timeout(config.timing.probe_timeout, cmd.output()).await {
                Err(_) => return Ok(PortProbe::NotReady("port timedout".into())),
                Ok(output) => output.map_err(|e| {
                    CtlError::Config(format!(
                        "failed to run {}: {}",
                        config.helper_binary.display(),
                        e
                    ))
                })?,
            };

        let stdout = String::from_utf8_lossy(&output.stdout);
        match stdout.trim().parse::<u16>() {
            Ok(port) if port != 0 => Ok(PortProbe::Ready(port)),
            _ => Ok(PortProbe::NotReady(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
        }
    }

    /// Version string of the on-disk daemon binary.
    async fn daemon_version(&self, binary: &Path) -> Result<String> {
        let output = Command::new(binary)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                CtlError::Config(format!("failed to run {}: {}", binary.display(), e))
            })?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text.replace("GOMA version", "").trim().to_string())
    }

    async fn extract_package(&self, archive: &Path, dest: &Path) -> Result<()> {
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || package::extract(&archive, &dest))
            .await
            .map_err(|e| CtlError::Other(format!("extraction task failed: {}", e)))?
    }

    /// Overwrites the installation with the extracted package tree.
    async fn install_package(&self, source: &Path, dest: &Path) -> Result<()> {
        let source = source.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || package::copy_tree(&source, &dest))
            .await
            .map_err(|e| CtlError::Other(format!("install task failed: {}", e)))?
    }

    /// Extra diagnostics printed when the daemon never became reachable.
    async fn describe_failure(&self, _config: &CtlConfig) {}
}

/// The platform implementation for the host OS.
pub fn detect() -> Box<dyn Platform> {
    #[cfg(unix)]
    {
        Box::new(PosixPlatform::new())
    }
    #[cfg(windows)]
    {
        Box::new(WindowsPlatform::new())
    }
}

/// Runs a short inspection command, returning (stdout, stderr).
pub(crate) async fn capture(program: &Path, args: &[&str]) -> Result<(String, String)> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await?;
    Ok((
        String::from_utf8_lossy(&output.stdout).into_owned(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    ))
}
