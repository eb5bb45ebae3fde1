use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use super::{capture, Caller, DaemonProcess, Platform};
use crate::config::{self, CtlConfig};
use crate::error::{CtlError, Result};
use crate::flags;
use crate::stakeholder::{self, Owner};

const DEFAULT_FLAGS: &[(&str, &str)] = &[
    ("RPC_EXTRA_PARAMS", "?win"),
    (flags::COMPILER_PROXY_SOCKET_NAME, "goma.ipc"),
];

const DEFAULT_SSL_FLAGS: &[(&str, &str)] = &[("HTTP_SOCKET_READ_TIMEOUT_SECS", "90.0")];

const DETACHED_PROCESS: u32 = 0x0000_0008;

/// robocopy reports success with any exit code below 8.
const ROBOCOPY_FAILURE: i32 = 8;

pub struct WindowsPlatform;

impl WindowsPlatform {
    pub fn new() -> Self {
        Self
    }

    async fn port_owners(&self, port: &str) -> Result<BTreeSet<u32>> {
        let (out, err) = capture(Path::new("netstat"), &["-a", "-n", "-o"]).await?;
        Ok(stakeholder::parse_netstat_listeners(
            &format!("{}{}", out, err),
            port,
        ))
    }
}

impl Default for WindowsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Platform for WindowsPlatform {
    fn daemon_binary_name(&self) -> &'static str {
        "compiler_proxy.exe"
    }

    fn helper_binary_name(&self) -> &'static str {
        "gomacc.exe"
    }

    fn default_flags(&self) -> &'static [(&'static str, &'static str)] {
        DEFAULT_FLAGS
    }

    fn default_ssl_flags(&self) -> &'static [(&'static str, &'static str)] {
        DEFAULT_SSL_FLAGS
    }

    fn detected_platform(&self) -> Option<&'static str> {
        Some("win64")
    }

    fn caller(&self) -> Option<Caller> {
        None
    }

    fn tmp_dir(&self) -> PathBuf {
        config::system_temp_dir().join("goma")
    }

    fn check_platform_config(&self, install_dir: &Path) -> Result<()> {
        if !install_dir.join("vcflags.exe").is_file() {
            return Err(CtlError::Config("vcflags.exe not found".into()));
        }
        Ok(())
    }

    /// Only the TCP port is observable; named pipes are not inspected.
    async fn find_owners(&self, resource: &str, network: bool) -> Result<Vec<Owner>> {
        let Some(port) = resource.strip_prefix("TCP:").filter(|_| network) else {
            return Ok(Vec::new());
        };
        Ok(self
            .port_owners(port)
            .await?
            .into_iter()
            .map(|pid| Owner {
                pid,
                uid: None,
                resource: resource.to_string(),
            })
            .collect())
    }

    async fn process_running(&self, _config: &CtlConfig) -> Result<bool> {
        let image = self.daemon_binary_name();
        let filter = format!("IMAGENAME eq {}", image);
        let (out, _) = capture(Path::new("tasklist"), &["/FI", &filter]).await?;
        Ok(out.contains(image))
    }

    async fn kill(&self, pids: &BTreeSet<u32>) -> Result<()> {
        if pids.is_empty() {
            return Ok(());
        }
        let mut cmd = Command::new("taskkill");
        for pid in pids {
            cmd.arg("/PID").arg(pid.to_string());
        }
        let status = cmd.status().await?;
        if !status.success() {
            return Err(CtlError::Daemon(format!("taskkill failed: {}", status)));
        }
        Ok(())
    }

    async fn spawn_daemon(&self, config: &CtlConfig) -> Result<DaemonProcess> {
        let mut cmd = Command::new(&config.daemon_binary);
        cmd.envs(config.flags.vars())
            .stdin(Stdio::null())
            .creation_flags(DETACHED_PROCESS);
        let child = cmd.spawn().map_err(|e| {
            CtlError::Config(format!(
                "failed to execute {}: {}",
                config.daemon_binary.display(),
                e
            ))
        })?;
        Ok(DaemonProcess {
            child: Some(child),
            daemonized: false,
        })
    }

    async fn install_package(&self, source: &Path, dest: &Path) -> Result<()> {
        let status = Command::new("robocopy")
            .arg(source)
            .arg(dest)
            .args(["/ns", "/nc", "/nfl", "/ndl", "/np", "/njh", "/njs"])
            .status()
            .await?;
        match status.code() {
            Some(code) if code < ROBOCOPY_FAILURE => Ok(()),
            _ => Err(CtlError::UpdateFailed(format!("robocopy failed: {}", status))),
        }
    }

    async fn describe_failure(&self, config: &CtlConfig) {
        let port = config.resources().port;
        let pids = match self.port_owners(&port).await {
            Ok(pids) => pids,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot list port owners");
                return;
            }
        };
        println!("ports are owned by following processes:");
        for pid in pids {
            let filter = format!("PID eq {}", pid);
            if let Ok((out, _)) = capture(Path::new("tasklist"), &["/FI", &filter]).await {
                println!("{}", out);
            }
        }
    }
}
