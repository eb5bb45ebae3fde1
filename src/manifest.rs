//! Flat `key=value` version descriptor kept in every package directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::error::{CtlError, Result};

pub const MANIFEST_FILE: &str = "MANIFEST";

const VERSION_KEY: &str = "VERSION";
const PLATFORM_KEY: &str = "PLATFORM";
const BAD_VERSION_KEY: &str = "bad_version";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: BTreeMap<String, String>,
}

impl Manifest {
    /// Blank lines and lines without `=` are ignored; keys and values are trimmed.
    pub fn parse(contents: &str) -> Self {
        let entries = contents
            .lines()
            .filter_map(|line| line.trim().split_once('='))
            .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
            .collect();
        Self { entries }
    }

    /// Reads `<dir>/MANIFEST`; a missing file yields an empty manifest.
    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        if !path.is_file() {
            tracing::trace!(path = %path.display(), "No manifest");
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(&path)?;
        Ok(Self::parse(&contents))
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        let mut contents = String::new();
        for (key, value) in &self.entries {
            contents.push_str(key);
            contents.push('=');
            contents.push_str(value);
            contents.push('\n');
        }
        fs::write(&path, contents)?;
        tracing::debug!(path = %path.display(), "Wrote manifest");
        Ok(())
    }

    pub fn is_valid_in(dir: &Path) -> Result<bool> {
        Ok(Self::read(dir)?.is_valid())
    }

    pub fn is_valid(&self) -> bool {
        self.entries.contains_key(PLATFORM_KEY) && self.entries.contains_key(VERSION_KEY)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `None` when `VERSION` is absent or not an integer.
    pub fn version(&self) -> Option<u64> {
        self.entries.get(VERSION_KEY)?.parse().ok()
    }

    pub fn platform(&self) -> Option<&str> {
        self.get(PLATFORM_KEY)
    }

    pub fn set_platform(&mut self, platform: &str) {
        self.insert(PLATFORM_KEY, platform);
    }

    pub fn bad_versions(&self) -> &str {
        self.get(BAD_VERSION_KEY).unwrap_or("")
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    /// Overlays `other` on top of this manifest.
    pub fn merge(&mut self, other: &Manifest) {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True when `<dir>/MANIFEST` exists and was written within `window`.
    pub fn modified_within(dir: &Path, window: Duration) -> Result<bool> {
        let path = dir.join(MANIFEST_FILE);
        let modified = match fs::metadata(&path) {
            Ok(meta) => meta.modified()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        Ok(age < window)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Manifest {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Version and bad-version list advertised by the package server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVersion {
    pub version: u64,
    pub bad_versions: String,
}

impl RemoteVersion {
    pub fn from_manifest_text(contents: &str) -> Result<Self> {
        let manifest = Manifest::parse(contents);
        match manifest.version() {
            Some(version) => Ok(Self {
                version,
                bad_versions: manifest.bad_versions().to_string(),
            }),
            None => Err(CtlError::Network(format!(
                "Unable to determine the latest version. Failed to download the latest \
                 valid MANIFEST from the server.\nResponse from server: {}",
                contents
            ))),
        }
    }

    pub fn should_replace(&self, installed: u64) -> bool {
        should_update(installed, self.version, &self.bad_versions)
    }
}

/// `bad_versions` is a `|`-separated list matched by exact string equality.
pub fn is_bad_version(current: u64, bad_versions: &str) -> bool {
    let current = current.to_string();
    bad_versions.split('|').any(|v| v == current)
}

/// Upgrade when behind, never when equal, and downgrade only away from a
/// version flagged as bad.
pub fn should_update(current: u64, next: u64, bad_versions: &str) -> bool {
    if current < next {
        return true;
    }
    if current == next {
        return false;
    }
    is_bad_version(current, bad_versions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_ignores_blank_and_malformed_lines() {
        let manifest = Manifest::parse("\nVERSION=7\nnot a pair\n  PLATFORM = mac \nKEY=\n");
        assert_eq!(manifest.version(), Some(7));
        assert_eq!(manifest.platform(), Some("mac"));
        assert_eq!(manifest.get("KEY"), Some(""));
        assert_eq!(manifest.iter().count(), 3);
    }

    #[test]
    fn test_parse_keeps_equals_in_value() {
        let manifest = Manifest::parse("URL=https://example.com/?a=b\n");
        assert_eq!(manifest.get("URL"), Some("https://example.com/?a=b"));
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let manifest: Manifest = [("VERSION", "7"), ("PLATFORM", "mac")].into_iter().collect();
        manifest.write(dir.path()).unwrap();

        let read = Manifest::read(dir.path()).unwrap();
        assert_eq!(read, manifest);
        assert!(Manifest::is_valid_in(dir.path()).unwrap());
    }

    #[test]
    fn test_missing_version_is_invalid() {
        let dir = TempDir::new().unwrap();
        let manifest: Manifest = [("PLATFORM", "mac")].into_iter().collect();
        manifest.write(dir.path()).unwrap();
        assert!(!Manifest::is_valid_in(dir.path()).unwrap());
    }

    #[test]
    fn test_absent_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest::read(dir.path()).unwrap();
        assert!(manifest.is_empty());
        assert_eq!(manifest.version(), None);
    }

    #[test]
    fn test_non_numeric_version_is_absent() {
        let manifest = Manifest::parse("VERSION=abc\nPLATFORM=mac\n");
        assert_eq!(manifest.version(), None);
    }

    #[test]
    fn test_modified_within() {
        let dir = TempDir::new().unwrap();
        assert!(!Manifest::modified_within(dir.path(), Duration::from_secs(60)).unwrap());
        Manifest::parse("VERSION=1").write(dir.path()).unwrap();
        assert!(Manifest::modified_within(dir.path(), Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn test_is_bad_version() {
        assert!(!is_bad_version(5, ""));
        assert!(is_bad_version(5, "5"));
        assert!(!is_bad_version(5, "15"));
        assert!(is_bad_version(5, "3|5|7"));
        assert!(!is_bad_version(5, "3|4|7"));
    }

    #[test]
    fn test_should_update() {
        assert!(!should_update(5, 5, ""));
        assert!(should_update(5, 6, ""));
        assert!(!should_update(5, 3, ""));
        assert!(should_update(5, 3, "5"));
        assert!(should_update(5, 3, "4|5"));
        assert!(!should_update(5, 3, "4|6"));
        // Equal versions never update, even when flagged.
        assert!(!should_update(5, 5, "5"));
    }

    #[test]
    fn test_remote_version_requires_version() {
        let remote = RemoteVersion::from_manifest_text("VERSION=11\nbad_version=9|10\n").unwrap();
        assert_eq!(remote.version, 11);
        assert!(remote.should_replace(10));
        assert!(RemoteVersion::from_manifest_text("<html>oops</html>").is_err());
    }
}
