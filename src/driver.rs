//! Per-invocation state shared by the supervisor, the updater and the
//! control-plane client.

use dialoguer::{theme::ColorfulTheme, Select};
use std::fs;
use std::path::Path;

use crate::backup::Backup;
use crate::config::CtlConfig;
use crate::error::{CtlError, Result};
use crate::package::{self, PLATFORM_CANDIDATES};
use crate::platform::Platform;
use crate::source::PackageSource;
use crate::state::InstalledState;

pub struct Driver {
    pub(crate) config: CtlConfig,
    pub(crate) platform: Box<dyn Platform>,
    pub(crate) source: Box<dyn PackageSource>,
    pub(crate) state: InstalledState,
    /// Set by `backup_current_package`, consumed by rollback or discard.
    pub(crate) backup: Option<Backup>,
    /// Loopback client for the control endpoint; never goes through a proxy.
    pub(crate) http: reqwest::Client,
    platform_name: Option<String>,
}

impl Driver {
    pub fn new(
        config: CtlConfig,
        platform: Box<dyn Platform>,
        source: Box<dyn PackageSource>,
    ) -> Result<Self> {
        let state = InstalledState::load(&config.install_dir)?;
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| CtlError::Config(format!("Failed to create HTTP client: {}", e)))?;
        tracing::debug!(version = state.version(), "Loaded installed state");

        Ok(Self {
            config,
            platform,
            source,
            state,
            backup: None,
            http,
            platform_name: None,
        })
    }

    pub fn config(&self) -> &CtlConfig {
        &self.config
    }

    pub fn state(&self) -> &InstalledState {
        &self.state
    }

    /// Binaries and platform prerequisites must be in place before the
    /// daemon is touched.
    pub(crate) fn check_config(&self) -> Result<()> {
        let install_dir = &self.config.install_dir;
        if !install_dir.is_dir() {
            return Err(CtlError::Config(format!(
                "{} is not directory",
                install_dir.display()
            )));
        }
        if !self.config.daemon_binary.is_file() {
            return Err(CtlError::Config(format!(
                "compiler_proxy({}) not exist",
                self.config.daemon_binary.display()
            )));
        }
        if !self.config.helper_binary.is_file() {
            return Err(CtlError::Config(format!(
                "gomacc({}) not exist",
                self.config.helper_binary.display()
            )));
        }
        self.platform.check_platform_config(install_dir)
    }

    /// A previous package is installed when the daemon binary exists.
    pub(crate) fn is_installed(&self) -> bool {
        self.config.daemon_binary.exists()
    }

    /// Package platform of this installation, asking the operator when
    /// neither the host, the manifest nor `PLATFORM` tells.
    pub fn platform_name(&mut self) -> Result<String> {
        if let Some(name) = &self.platform_name {
            return Ok(name.clone());
        }
        let name = match self.known_platform() {
            Some(name) => name,
            None => prompt_platform()?,
        };
        tracing::debug!(platform = %name, "Resolved package platform");
        self.platform_name = Some(name.clone());
        Ok(name)
    }

    fn known_platform(&self) -> Option<String> {
        if let Some(detected) = self.platform.detected_platform() {
            return Some(detected.to_string());
        }
        self.state
            .manifest()
            .platform()
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .or_else(|| self.config.platform_override.clone())
    }

    pub(crate) fn package_name(&mut self) -> Result<String> {
        let platform = self.platform_name()?;
        package::package_name(&platform)
    }

    /// Creates the temp, crash dump and cache directories the daemon
    /// expects, refusing ones that belong to someone else.
    pub fn prepare_directories(&self) -> Result<()> {
        self.create_directory(&self.config.tmp_dir, "temp")?;
        println!("using {} as tmpdir", self.config.tmp_dir.display());
        self.create_directory(&self.config.crash_dir, "crash dump")?;
        self.create_directory(&self.config.cache_dir, "cache")
    }

    fn create_directory(&self, dir: &Path, purpose: &str) -> Result<()> {
        if !dir.is_dir() {
            eprintln!("creating {} dir ({}).", purpose, dir.display());
            fs::create_dir_all(dir)?;
            return Ok(());
        }
        if !self.platform.ensure_owned_by_user(dir)? {
            let message = format!("{} dir ({}) is not owned by you.", purpose, dir.display());
            eprintln!("Error: {}", message);
            return Err(CtlError::Config(message));
        }
        Ok(())
    }
}

fn prompt_platform() -> Result<String> {
    if !std::io::IsTerminal::is_terminal(&std::io::stdin()) {
        return Err(CtlError::Config(
            "Cannot determine the platform. Set PLATFORM to one of goobuntu, chromeos, mac or win64."
                .into(),
        ));
    }
    let names: Vec<&str> = PLATFORM_CANDIDATES.iter().map(|(shown, _)| *shown).collect();
    let selected = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("What is your platform?")
        .items(&names)
        .default(0)
        .interact()
        .map_err(|e| CtlError::Config(format!("Invalid selection: {}", e)))?;
    PLATFORM_CANDIDATES
        .get(selected)
        .map(|(_, id)| id.to_string())
        .ok_or_else(|| CtlError::Config("Invalid selection".into()))
}
