//! HTTP control calls to a running compiler_proxy over loopback.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::driver::Driver;
use crate::error::{CtlError, Result};
use crate::platform::{DaemonProcess, PortProbe};
use crate::stakeholder;

const DEFAULT_URL_PREFIX: &str = "http://127.0.0.1:0";

const WAITING_NOTICE_INTERVAL: Duration = Duration::from_secs(1);

/// Body served in place of `/errorz` when compiler_proxy cannot be reached.
#[derive(Debug, Serialize)]
struct ErrorNotices {
    notice: Vec<ErrorNotice>,
}

#[derive(Debug, Serialize)]
struct ErrorNotice {
    version: u32,
    compile_error: &'static str,
}

impl ErrorNotices {
    fn unreachable() -> Self {
        Self {
            notice: vec![ErrorNotice {
                version: 1,
                compile_error: "COMPILER_PROXY_UNREACHABLE",
            }],
        }
    }
}

/// Outcome of one control call. Transport failures land in `message` with
/// `status == false`; callers branch on `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlReply {
    pub status: bool,
    pub message: String,
    pub url: String,
    /// Comma separated stakeholder pids; empty for fast calls.
    pub pids: String,
}

impl ControlReply {
    fn failed(url: &str, message: impl Into<String>) -> Self {
        Self {
            status: false,
            message: message.into(),
            url: url.to_string(),
            pids: String::new(),
        }
    }
}

impl Driver {
    /// Sends `command` (a path such as `/healthz`) to the daemon.
    ///
    /// Unless `fast`, a daemon that is not running is reported without any
    /// network I/O, and the reply carries the stakeholder pids.
    pub async fn control(&mut self, command: &str, fast: bool) -> Result<ControlReply> {
        self.check_config()?;
        if !fast && !self.platform.process_running(&self.config).await? {
            return Ok(ControlReply::failed("", "goma is not running."));
        }

        let port = match self.resolve_port(None).await {
            Ok(port) => port,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => return Ok(ControlReply::failed(DEFAULT_URL_PREFIX, e.to_string())),
        };
        let url_prefix = format!("http://127.0.0.1:{}", port);

        let message = match self.get_text(&format!("{}{}", url_prefix, command)).await {
            Ok(body) => body,
            Err(e) => return Ok(ControlReply::failed(&url_prefix, e.to_string())),
        };
        let pids = if fast {
            String::new()
        } else {
            stakeholder::find_stakeholders(self.platform.as_ref(), &self.config.resources(), false)
                .await?
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",")
        };

        Ok(ControlReply {
            status: true,
            message,
            url: url_prefix,
            pids,
        })
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        tracing::trace!(url, "Control request");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| CtlError::Network(format!("{}: {}", url, e)))?;
        response
            .text()
            .await
            .map_err(|e| CtlError::Network(format!("{}: {}", url, e)))
    }

    /// Resolves the control port through the helper binary, polling while the
    /// daemon starts up. With a launched `process`, its early exit is fatal
    /// and a timeout kills it.
    pub(crate) async fn resolve_port(
        &mut self,
        mut process: Option<&mut DaemonProcess>,
    ) -> Result<u16> {
        if let Some(port) = self.state.cached_port() {
            return Ok(port);
        }

        let deadline = self.config.ping_deadline();
        let started = Instant::now();
        let mut last_notice = started;
        let mut last_reason = String::new();

        while started.elapsed() < deadline {
            if last_notice.elapsed() > WAITING_NOTICE_INTERVAL {
                println!("waiting for compiler_proxy...");
                last_notice = Instant::now();
            }

            match self.platform.probe_port(&self.config).await? {
                PortProbe::Ready(port) => {
                    tracing::debug!(port, "Resolved compiler_proxy port");
                    self.state.set_port(port);
                    return Ok(port);
                }
                PortProbe::NotReady(reason) => {
                    tracing::trace!(reason = %reason, "compiler_proxy not ready");
                    last_reason = reason;
                }
            }

            if let Some(process) = process.as_mut() {
                if let Some(status) = process.has_died()? {
                    return Err(CtlError::Daemon(format!(
                        "compiler_proxy is not running {}",
                        status
                    )));
                }
            }
            tokio::time::sleep(self.config.timing.port_poll_interval).await;
        }

        if !last_reason.is_empty() {
            eprintln!("{}", last_reason);
        }
        self.platform.describe_failure(&self.config).await;
        match process {
            Some(process) => {
                let pid = process
                    .pid()
                    .map(|pid| pid.to_string())
                    .unwrap_or_else(|| "unknown".into());
                process.kill().await;
                Err(CtlError::Daemon(format!(
                    "compiler_proxy is not ready? pid={}",
                    pid
                )))
            }
            None => Err(CtlError::Daemon("compiler_proxy is not ready?".into())),
        }
    }

    pub async fn stat(&mut self) -> Result<()> {
        println!("{}", self.control("/statz", false).await?.message);
        Ok(())
    }

    pub async fn histogram(&mut self) -> Result<()> {
        println!("{}", self.control("/histogramz", false).await?.message);
        Ok(())
    }

    /// `/errorz`, or a fixed notice when the daemon cannot be reached.
    pub async fn json_status(&mut self) -> Result<String> {
        let reply = self.control("/errorz", false).await?;
        if !reply.status {
            return Ok(serde_json::to_string(&ErrorNotices::unreachable())?);
        }
        Ok(reply.message)
    }
}
