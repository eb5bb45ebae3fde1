use std::path::Path;

use crate::error::Result;
use crate::manifest::Manifest;

/// What this invocation believes about the installation and the daemon.
///
/// The cached fields are cleared by whichever operation can change them
/// (kill, start, update) instead of being trusted across such steps.
#[derive(Debug, Clone, Default)]
pub struct InstalledState {
    manifest: Manifest,
    port: Option<u16>,
    running: Option<bool>,
}

impl InstalledState {
    pub fn load(install_dir: &Path) -> Result<Self> {
        let mut state = Self::default();
        state.reload_manifest(install_dir)?;
        Ok(state)
    }

    pub fn reload_manifest(&mut self, install_dir: &Path) -> Result<()> {
        self.manifest = Manifest::read(install_dir)?;
        if self.manifest.get("GOMA_API_KEY_FILE").is_some() {
            tracing::warn!("GOMA_API_KEY_FILE is deprecated");
        }
        Ok(())
    }

    /// `0` when nothing is installed.
    pub fn version(&self) -> u64 {
        self.manifest.version().unwrap_or(0)
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Records a freshly installed package and persists the manifest.
    pub fn record_install(&mut self, install_dir: &Path, installed: &Manifest) -> Result<()> {
        self.manifest.merge(installed);
        self.manifest.write(install_dir)
    }

    pub fn cached_port(&self) -> Option<u16> {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = Some(port);
    }

    pub fn forget_port(&mut self) {
        self.port = None;
    }

    pub fn cached_running(&self) -> Option<bool> {
        self.running
    }

    pub fn mark_running(&mut self, running: bool) {
        self.running = Some(running);
    }

    pub fn forget_running(&mut self) {
        self.running = None;
    }
}
