//! Starting, stopping and health-checking compiler_proxy.

use console::style;
use std::io::Write;

use crate::driver::Driver;
use crate::error::{CtlError, Result};
use crate::flags;
use crate::manifest::{is_bad_version, Manifest};
use crate::stakeholder;

impl Driver {
    /// Cached daemon-running flag, computed on first use.
    pub(crate) async fn is_running(&mut self) -> Result<bool> {
        if let Some(running) = self.state.cached_running() {
            return Ok(running);
        }
        let running = self.platform.process_running(&self.config).await?;
        self.state.mark_running(running);
        Ok(running)
    }

    /// Prints `/healthz`; false when the daemon is unreachable or reports an error.
    pub async fn status(&mut self) -> Result<bool> {
        let reply = self.control("/healthz", false).await?;
        let pid = if reply.pids.is_empty() {
            "unknown"
        } else {
            reply.pids.as_str()
        };
        println!(
            "compiler proxy (pid={}) status: {} {}",
            pid, reply.url, reply.message
        );
        Ok(reply.status && !reply.message.starts_with("error:"))
    }

    /// Asks the daemon to quit. Does not wait for it to exit.
    pub async fn stop(&mut self) -> Result<()> {
        println!("Killing compiler proxy.");
        let reply = self.control("/quitquitquit", false).await?;
        println!("compiler proxy status: {} {}", reply.url, reply.message);
        self.state.forget_port();
        Ok(())
    }

    /// Waits a bounded time for the daemon to go away.
    pub async fn wait_cooldown(&mut self) -> Result<bool> {
        if !self.platform.process_running(&self.config).await? {
            return Ok(true);
        }
        print!("Waiting for cool down...");
        let attempts = self.config.timing.cooldown_attempts;
        for remaining in (1..=attempts).rev() {
            if !self.platform.process_running(&self.config).await? {
                println!();
                return Ok(true);
            }
            print!(" {}", remaining);
            // Progress only; a broken stdout must not abort the wait.
            let _ = std::io::stdout().flush();
            tokio::time::sleep(self.config.timing.cooldown_interval).await;
        }
        println!(" give up");
        Ok(false)
    }

    /// Terminates every process holding the daemon's resources.
    pub async fn kill_stakeholders(&mut self) -> Result<()> {
        let pids =
            stakeholder::find_stakeholders(self.platform.as_ref(), &self.config.resources(), false)
                .await?;
        tracing::info!(?pids, "Killing stakeholders");
        self.platform.kill(&pids).await?;
        self.state.forget_port();
        if !self.wait_cooldown().await? {
            println!("Could not kill compiler_proxy.");
            println!("Probably, somebody else also runs compiler_proxy.");
        }
        Ok(())
    }

    /// Stop, wait, escalate to kill, and record the daemon as gone.
    pub(crate) async fn shut_down(&mut self) -> Result<()> {
        self.stop().await?;
        if !self.wait_cooldown().await? {
            self.kill_stakeholders().await?;
        }
        self.state.mark_running(false);
        Ok(())
    }

    /// Launches the daemon and waits until its control port answers.
    pub(crate) async fn exec_daemon(&mut self) -> Result<u16> {
        self.state.forget_port();
        let mut process = self.platform.spawn_daemon(&self.config).await?;
        tracing::info!(pid = ?process.pid(), "Launched compiler_proxy");
        let port = self.resolve_port(Some(&mut process)).await?;
        self.state.mark_running(true);
        Ok(port)
    }

    pub async fn restart(&mut self) -> Result<()> {
        if self.is_running().await? {
            self.shut_down().await?;
        }
        self.start(false).await
    }

    /// `start` (`ensure == false`) replaces any daemon on the default
    /// channel; `ensure_start` keeps a healthy, current one.
    pub async fn start(&mut self, ensure: bool) -> Result<()> {
        self.check_config()?;
        let mut running = self.is_running().await?;
        if !ensure && self.config.may_use_default_channel() && running {
            self.kill_stakeholders().await?;
            self.state.mark_running(false);
        }

        let can_auto_update = self.state.version() != 0 && self.config.auto_update_enabled();
        if can_auto_update {
            self.auto_update().await?;
        }

        if let Some(version) = self.state.manifest().get("VERSION") {
            println!(
                "Using goma VERSION={} ({})",
                version,
                if can_auto_update { "latest" } else { "no_auto_update" }
            );
        }
        let disk_version = self.disk_version().await?;
        println!("GOMA version {}", disk_version);

        running = self.is_running().await?;
        if ensure && running {
            let healthz = self.healthz().await?;
            if healthz != "ok" {
                println!("goma is not in healthy state: {}", healthz);
            }
            let updated = self.silently_updated(&disk_version).await?;
            let flags_changed = self.flags_changed().await?;
            if flags_changed {
                println!("flagz is updated from the previous time.");
            }
            if healthz != "ok" || updated || flags_changed {
                self.shut_down().await?;
            }
            running = self.is_running().await?;
        }

        if ensure && running {
            println!();
            println!("goma is already running.");
            println!();
            return Ok(());
        }

        if !running {
            self.exec_daemon().await?;
        }

        if !self.status().await? {
            return Err(CtlError::Daemon(
                "Failed to start compiler_proxy successfully.".into(),
            ));
        }
        if let Some(running_version) = self.running_version().await? {
            if running_version != disk_version {
                println!("Updated GOMA version {}", running_version);
            }
        }
        println!();
        println!("{}", style("Now goma is ready!").green());
        println!();
        Ok(())
    }

    /// Updates before starting when the server has something newer or the
    /// installed version was flagged bad.
    async fn auto_update(&mut self) -> Result<()> {
        let installed = self.state.version();
        let latest_dir = self.config.latest_dir();
        let recently_pulled = !Manifest::read(&latest_dir)?.is_empty()
            && Manifest::modified_within(&latest_dir, self.config.timing.manifest_fresh_window)?;

        let (latest, bad_versions) = if recently_pulled {
            println!(
                "Auto update is skipped because {}/MANIFEST was updated recently.",
                latest_dir.display()
            );
            (installed, String::new())
        } else {
            let remote = self.latest_version().await?;
            (remote.version, remote.bad_versions)
        };

        let mut do_update = false;
        if installed < latest {
            println!("new goma client found (VERSION={}).", latest);
            do_update = true;
        }
        if is_bad_version(installed, &bad_versions) {
            println!(
                "your version (VERSION={}) is marked as bad version ({})",
                installed, bad_versions
            );
            do_update = true;
        }
        if !do_update {
            return Ok(());
        }

        println!("Updating...");
        self.update().await?;
        self.state.forget_running();
        self.is_running().await?;
        self.state.reload_manifest(&self.config.install_dir)
    }

    pub(crate) async fn disk_version(&self) -> Result<String> {
        self.platform.daemon_version(&self.config.daemon_binary).await
    }

    async fn running_version(&mut self) -> Result<Option<String>> {
        let reply = self.control("/versionz", true).await?;
        Ok(reply.status.then(|| reply.message.trim().to_string()))
    }

    async fn healthz(&mut self) -> Result<String> {
        let reply = self.control("/healthz", true).await?;
        if reply.status {
            Ok(reply.message.trim().to_string())
        } else {
            Ok("unavailable /healthz".to_string())
        }
    }

    /// The binary on disk was replaced behind the running daemon's back.
    async fn silently_updated(&mut self, disk_version: &str) -> Result<bool> {
        Ok(self
            .running_version()
            .await?
            .is_some_and(|running| running != disk_version))
    }

    async fn flags_changed(&mut self) -> Result<bool> {
        let reply = self.control("/flagz", true).await?;
        if !reply.status {
            return Ok(false);
        }
        let reported = flags::parse_flagz(reply.message.trim());
        let changed = self.config.flags.differs_from(&reported);
        tracing::debug!(changed, "Compared daemon flags");
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::NO_AUTO_UPDATE_FILE;
    use crate::error::CtlError;
    use crate::testing::{fake_driver, publish_release, reopen_driver, FakePlatform};
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_start_launches_daemon() {
        let dir = TempDir::new().unwrap();
        let platform = FakePlatform::new();
        let (mut driver, _) = fake_driver(&dir, 10, &platform);

        driver.start(false).await.unwrap();
        assert!(platform.is_running());
        assert_eq!(platform.spawns(), 1);
        assert_eq!(driver.state.cached_running(), Some(true));
    }

    #[tokio::test]
    async fn test_start_replaces_daemon_on_default_channel() {
        let dir = TempDir::new().unwrap();
        let platform = FakePlatform::new();
        let (mut driver, _) = fake_driver(&dir, 10, &platform);
        platform.set_running(true);

        driver.start(false).await.unwrap();
        assert_eq!(platform.kills(), 1);
        assert_eq!(platform.spawns(), 1);
    }

    #[tokio::test]
    async fn test_ensure_start_keeps_healthy_daemon() {
        let dir = TempDir::new().unwrap();
        let platform = FakePlatform::new();
        let (mut driver, _) = fake_driver(&dir, 10, &platform);
        driver.start(false).await.unwrap();

        let mut second = reopen_driver(&dir, &platform);
        second.start(true).await.unwrap();
        assert_eq!(platform.spawns(), 1);
        assert_eq!(platform.quits(), 0);
    }

    #[tokio::test]
    async fn test_ensure_start_restarts_on_flag_change() {
        let dir = TempDir::new().unwrap();
        let platform = FakePlatform::new();
        let (mut driver, _) = fake_driver(&dir, 10, &platform);
        driver.start(false).await.unwrap();
        platform.set_flagz("GOMA_USE_SSL=false\n");

        let mut second = reopen_driver(&dir, &platform);
        second.start(true).await.unwrap();
        assert_eq!(platform.quits(), 1);
        assert_eq!(platform.spawns(), 2);
    }

    #[tokio::test]
    async fn test_ensure_start_restarts_silently_updated_daemon() {
        let dir = TempDir::new().unwrap();
        let platform = FakePlatform::new();
        let (mut driver, _) = fake_driver(&dir, 10, &platform);
        driver.start(false).await.unwrap();
        fs::write(&driver.config.daemon_binary, "compiler_proxy 10.1").unwrap();

        let mut second = reopen_driver(&dir, &platform);
        second.start(true).await.unwrap();
        assert_eq!(platform.spawns(), 2);
    }

    #[tokio::test]
    async fn test_start_auto_updates_bad_version() {
        let dir = TempDir::new().unwrap();
        let platform = FakePlatform::new();
        let (mut driver, release) = fake_driver(&dir, 10, &platform);
        publish_release(&release, 9, "10");

        driver.start(false).await.unwrap();
        assert_eq!(driver.state.version(), 9);
        assert!(platform.is_running());
    }

    #[tokio::test]
    async fn test_no_auto_update_marker_is_honoured() {
        let dir = TempDir::new().unwrap();
        let platform = FakePlatform::new();
        let (mut driver, release) = fake_driver(&dir, 10, &platform);
        fs::write(driver.config.install_dir.join(NO_AUTO_UPDATE_FILE), b"").unwrap();
        publish_release(&release, 11, "");

        driver.start(false).await.unwrap();
        assert_eq!(driver.state.version(), 10);
    }

    #[tokio::test]
    async fn test_failed_health_is_reported() {
        let dir = TempDir::new().unwrap();
        let platform = FakePlatform::new();
        let (mut driver, _) = fake_driver(&dir, 10, &platform);
        platform.set_running(true);
        platform.set_healthz("error: backend unreachable");

        assert!(!driver.status().await.unwrap());
    }

    #[tokio::test]
    async fn test_start_fails_when_daemon_never_answers() {
        let dir = TempDir::new().unwrap();
        let platform = FakePlatform::new();
        let (mut driver, _) = fake_driver(&dir, 10, &platform);
        platform.set_spawn_starts_daemon(false);

        let err = driver.start(false).await.unwrap_err();
        assert!(matches!(err, CtlError::Daemon(_)));
    }

    #[tokio::test]
    async fn test_cooldown_gives_up_on_stubborn_daemon() {
        let dir = TempDir::new().unwrap();
        let platform = FakePlatform::new();
        let (mut driver, _) = fake_driver(&dir, 10, &platform);
        platform.set_running(true);

        assert!(!driver.wait_cooldown().await.unwrap());
        platform.set_running(false);
        assert!(driver.wait_cooldown().await.unwrap());
    }
}
