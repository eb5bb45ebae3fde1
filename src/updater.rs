//! Version negotiation, download, install, backup and rollback.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backup::{Backup, RollbackReport};
use crate::checksum::{self, AuditOutcome};
use crate::driver::Driver;
use crate::error::{CtlError, Result};
use crate::manifest::{should_update, Manifest, RemoteVersion, MANIFEST_FILE};
use crate::package;

impl Driver {
    /// Version and bad-version list advertised by the package server.
    pub async fn latest_version(&self) -> Result<RemoteVersion> {
        let body = self.source.fetch(MANIFEST_FILE).await?;
        let remote = RemoteVersion::from_manifest_text(&String::from_utf8_lossy(&body))?;
        tracing::debug!(version = remote.version, bad = %remote.bad_versions, "Latest version");
        Ok(remote)
    }

    pub async fn print_latest_version(&self) -> Result<()> {
        println!("VERSION={}", self.latest_version().await?.version);
        Ok(())
    }

    /// Version staged in `latest/`, `0` when nothing usable is there.
    fn downloaded_version(&self) -> u64 {
        Manifest::read(&self.config.latest_dir())
            .ok()
            .and_then(|m| m.version())
            .unwrap_or(0)
    }

    fn staged_files_valid(&self, files: &[String]) -> Result<bool> {
        let latest_dir = self.config.latest_dir();
        for name in files {
            let path = latest_dir.join(name);
            if !package::is_valid_download(&path)? {
                println!("{} is broken.", path.display());
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Downloads the latest manifest and package into `latest/` unless the
    /// staged copy is already current and intact.
    pub async fn pull(&mut self) -> Result<()> {
        let remote = self.latest_version().await?;
        let files = [MANIFEST_FILE.to_string(), self.package_name()?];
        let latest_dir = self.config.latest_dir();

        let stale = should_update(self.downloaded_version(), remote.version, &remote.bad_versions)
            || !self.staged_files_valid(&files)?;
        if !(stale && remote.should_replace(self.state.version())) {
            println!("Downloaded package is already the latest version.");
            // Rewriting refreshes the timestamp ensure_start uses to skip checks.
            if Manifest::is_valid_in(&latest_dir)? {
                Manifest::read(&latest_dir)?.write(&latest_dir)?;
            }
            return Ok(());
        }

        remove_dir_if_exists(&latest_dir)?;
        fs::create_dir_all(&latest_dir)?;
        let base_url = self.source.base_url().await?;
        for name in &files {
            println!("Downloading {}/{}", base_url, name);
            let spinner = download_spinner(name);
            let result = self.source.fetch_to(name, &latest_dir.join(name)).await;
            spinner.finish_and_clear();
            result?;
        }

        let mut manifest = Manifest::read(&latest_dir)?;
        manifest.set_platform(&self.platform_name()?);
        manifest.write(&latest_dir)?;
        tracing::info!(version = remote.version, "Pulled package");
        Ok(())
    }

    /// Installs the package staged in `latest/`. Broken downloads are
    /// deleted so the next run pulls them again.
    pub(crate) async fn update_package(&mut self) -> Result<()> {
        let update_dir = self.config.update_dir();
        let latest_dir = self.config.latest_dir();
        remove_dir_if_exists(&update_dir)?;
        fs::create_dir_all(&update_dir)?;

        let manifest = Manifest::read(&latest_dir)?;
        let Some(version) = manifest.version() else {
            let manifest_file = latest_dir.join(MANIFEST_FILE);
            println!("MANIFEST ({}) seems to be broken.", manifest_file.display());
            println!("Going to remove MANIFEST.");
            remove_file_if_exists(&manifest_file)?;
            println!("Please execute update again.");
            return Err(CtlError::Integrity(
                "MANIFEST in downloaded version is broken.".into(),
            ));
        };

        let platform = self.platform_name()?;
        let package_file = latest_dir.join(package::package_name(&platform)?);
        if let Err(e) = self.platform.extract_package(&package_file, &update_dir).await {
            tracing::warn!(error = %e, slug = e.slug(), "Extraction failed");
            println!("Package file ({}) seems to be broken.", package_file.display());
            println!("Going to remove package_file.");
            remove_file_if_exists(&package_file)?;
            println!("Please execute update again.");
            return Err(CtlError::Integrity(
                "Failed to extract downloaded package".into(),
            ));
        }

        let package_root = package::extracted_root(&update_dir, &platform);
        if !self.audit_dir(&package_root)? {
            println!("Failed to verify a file in package.");
            println!("Going to remove package_file and update_dir");
            remove_file_if_exists(&package_file)?;
            remove_dir_if_exists(&update_dir)?;
            return Err(CtlError::Integrity("downloaded package is broken".into()));
        }

        if self.is_installed() {
            println!("Stopping compiler_proxy ...");
            self.shut_down().await?;
        }

        let install_dir = self.config.install_dir.clone();
        println!("Updating package to {} ...", install_dir.display());
        self.platform
            .install_package(&package_root, &install_dir)
            .await
            .map_err(|e| CtlError::UpdateFailed(format!("Failed to install package: {}", e)))?;

        self.state.record_install(&install_dir, &manifest)?;
        remove_dir_if_exists(&update_dir)?;
        tracing::info!(version, "Installed package");
        Ok(())
    }

    /// Updates when due, rolling back and restarting the daemon on failure.
    /// The failure is still returned afterwards.
    pub async fn update(&mut self) -> Result<()> {
        let remote = self.latest_version().await?;
        if !remote.should_replace(self.state.version()) {
            println!("Goma is already up-to-date.");
            return Ok(());
        }

        self.pull().await?;
        self.backup_current_package()?;
        let was_running = self.is_running().await?;

        let result = self.update_package().await;
        if let Err(e) = &result {
            println!("{}", style("Failed to update. Rollback...").red());
            tracing::error!(error = %e, slug = e.slug(), "Update failed");
            if let Err(rollback_error) = self.rollback_update() {
                println!("{}", rollback_error);
            }
        }

        if was_running && !self.platform.process_running(&self.config).await? {
            println!("{}", self.disk_version().await?);
            self.exec_daemon().await?;
        }
        if result.is_ok() {
            // The new package is live; a leftover backup only costs disk.
            if let Some(backup) = self.backup.take() {
                if let Err(e) = backup.discard() {
                    tracing::warn!(error = %e, "Failed to remove backup");
                }
            }
            println!(
                "{} goma updated to VERSION={}",
                style("✓").green(),
                self.state.version()
            );
        }
        result
    }

    /// Mirrors the installation into `backup/` ahead of any destructive step.
    /// The staging directories are not part of the installation.
    pub fn backup_current_package(&mut self) -> Result<()> {
        let staging = [self.config.latest_dir(), self.config.update_dir()];
        let backup = Backup::create(&self.config.install_dir, &self.config.backup_dir(), &staging)?;
        self.backup = Some(backup);
        Ok(())
    }

    /// Restores every entry changed since `backup_current_package`.
    pub fn rollback_update(&mut self) -> Result<RollbackReport> {
        let backup = self.backup.as_ref().ok_or(CtlError::NoBackup)?;
        let report = backup.rollback();
        tracing::info!(
            restored = report.restored.len(),
            skipped = report.skipped,
            "Rolled back"
        );
        self.state.reload_manifest(&self.config.install_dir)?;
        if report.is_clean() {
            Ok(report)
        } else {
            Err(CtlError::UpdateFailed(report.failures.join("\n")))
        }
    }

    /// Verifies the live installation against its checksum table.
    pub fn audit(&self) -> Result<bool> {
        self.audit_dir(&self.config.install_dir)
    }

    pub(crate) fn audit_dir(&self, dir: &Path) -> Result<bool> {
        match checksum::audit(dir)? {
            AuditOutcome::NoChecksums => {
                println!("No checksum could be loaded.");
                Ok(true)
            }
            AuditOutcome::Verified { files } => {
                tracing::debug!(files, "Audit passed");
                println!("All files verified.");
                Ok(true)
            }
            AuditOutcome::Mismatch {
                file,
                expected,
                actual,
            } => {
                println!("{} differs: {} != {}", file, expected, actual);
                Ok(false)
            }
        }
    }

    /// Downloads any platform's package into the current directory.
    pub async fn fetch_package(&self, platform: &str, outfile: Option<&str>) -> Result<PathBuf> {
        let name = package::package_name(platform)?;
        let dest = std::env::current_dir()?.join(outfile.unwrap_or(&name));
        println!("Downloading {}/{}", self.source.base_url().await?, name);
        let spinner = download_spinner(&name);
        let result = self.source.fetch_to(&name, &dest).await;
        spinner.finish_and_clear();
        result?;
        Ok(dest)
    }
}

fn download_spinner(name: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(template) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        spinner.set_style(template);
    }
    spinner.set_message(format!("Downloading {}", name));
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
