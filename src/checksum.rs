//! SHA-256 integrity table shipped alongside each package.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::Result;

pub const CHECKSUM_FILE: &str = "sha256.json";

/// Windows packages list `.pdb` debug symbols that are not shipped.
const EXEMPT_EXTENSIONS: &[&str] = &["pdb"];

pub type ChecksumTable = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditOutcome {
    /// The package carries no checksum file.
    NoChecksums,
    Verified { files: usize },
    Mismatch {
        file: String,
        expected: String,
        actual: String,
    },
}

impl AuditOutcome {
    pub fn passed(&self) -> bool {
        !matches!(self, Self::Mismatch { .. })
    }
}

/// Older packages have no checksum file; that is an empty table, not an error.
pub fn load_table(dir: &Path) -> Result<ChecksumTable> {
    let path = dir.join(CHECKSUM_FILE);
    if !path.exists() {
        tracing::info!(path = %path.display(), "Checksum file does not exist");
        return Ok(ChecksumTable::new());
    }
    let reader = BufReader::new(File::open(&path)?);
    Ok(serde_json::from_reader(reader)?)
}

pub fn compute_hash(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn is_exempt(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| EXEMPT_EXTENSIONS.contains(&ext))
}

/// Stops at the first mismatch. A tracked file that is missing counts as one.
pub fn audit(dir: &Path) -> Result<AuditOutcome> {
    let table = load_table(dir)?;
    if table.is_empty() {
        return Ok(AuditOutcome::NoChecksums);
    }

    let mut files = 0;
    for (filename, expected) in &table {
        if is_exempt(filename) {
            tracing::debug!(file = %filename, "Skipping exempt file");
            continue;
        }
        let path = dir.join(filename);
        let actual = if path.is_file() {
            compute_hash(&path)?
        } else {
            "missing".to_string()
        };
        if !actual.eq_ignore_ascii_case(expected) {
            return Ok(AuditOutcome::Mismatch {
                file: filename.clone(),
                expected: expected.clone(),
                actual,
            });
        }
        files += 1;
    }
    Ok(AuditOutcome::Verified { files })
}

/// Writes the checksum table covering `filenames` under `dir`.
pub fn write_table(dir: &Path, filenames: &[&str]) -> Result<()> {
    let mut table = ChecksumTable::new();
    for name in filenames {
        table.insert(name.to_string(), compute_hash(&dir.join(name))?);
    }
    std::fs::write(dir.join(CHECKSUM_FILE), serde_json::to_vec_pretty(&table)?)?;
    Ok(())
}
