//! Package naming, archive validation, extraction and tree installation.

use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;
use tar::Archive;
use walkdir::WalkDir;
use xz2::read::XzDecoder;
use zip::ZipArchive;

use crate::error::{CtlError, Result};
use crate::manifest::{Manifest, MANIFEST_FILE};

/// (shown name, platform id) pairs offered to the operator.
pub const PLATFORM_CANDIDATES: &[(&str, &str)] = &[
    ("Goobuntu", "goobuntu"),
    ("Chrome OS", "chromeos"),
    ("MacOS", "mac"),
    ("Win64", "win64"),
];

const MAGICS: &[(&str, &[u8])] = &[
    ("tgz", &[0x1F, 0x8B]),
    ("txz", &[0xFD, b'7', b'z', b'X', b'Z', 0x00]),
    ("zip", b"PK"),
];

pub fn package_extension(platform: &str) -> Option<&'static str> {
    match platform {
        "win64" => Some("zip"),
        "mac" => Some("tgz"),
        "goobuntu" | "chromeos" => Some("txz"),
        _ => None,
    }
}

pub fn package_name(platform: &str) -> Result<String> {
    let ext = package_extension(platform).ok_or_else(|| {
        CtlError::Config(format!(
            "Unknown platform {} specified to get package name.",
            platform
        ))
    })?;
    Ok(format!("goma-{}.{}", platform, ext))
}

/// Directory inside an extracted package holding its files.
pub fn extracted_root(update_dir: &Path, platform: &str) -> std::path::PathBuf {
    update_dir.join(format!("goma-{}", platform))
}

/// A downloaded file looks sane: `MANIFEST` must be valid and archives
/// must start with their format's magic bytes.
pub fn is_valid_download(path: &Path) -> Result<bool> {
    if path.file_name().and_then(|n| n.to_str()) == Some(MANIFEST_FILE) {
        return match path.parent() {
            Some(dir) => Manifest::is_valid_in(dir),
            None => Ok(false),
        };
    }
    if !path.exists() {
        return Ok(false);
    }
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let Some((_, magic)) = MAGICS.iter().find(|(e, _)| *e == ext) else {
        return Ok(true);
    };

    let mut head = Vec::with_capacity(magic.len());
    File::open(path)?
        .take(magic.len() as u64)
        .read_to_end(&mut head)?;
    Ok(head == *magic)
}

/// Unpacks a tgz, txz or zip package into `dest`.
pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
    if !archive.exists() {
        return Err(CtlError::Integrity(format!(
            "Expected package file {} does not exist",
            archive.display()
        )));
    }
    fs::create_dir_all(dest)?;
    tracing::info!(archive = %archive.display(), dest = %dest.display(), "Extracting package");

    let reader = BufReader::new(File::open(archive)?);
    match archive.extension().and_then(|e| e.to_str()) {
        Some("tgz") => Archive::new(GzDecoder::new(reader)).unpack(dest)?,
        Some("txz") => Archive::new(XzDecoder::new(reader)).unpack(dest)?,
        Some("zip") => ZipArchive::new(reader)?.extract(dest)?,
        other => {
            return Err(CtlError::Integrity(format!(
                "unsupported package format: {:?}",
                other
            )))
        }
    }
    Ok(())
}

/// Copies `source` over `dest` like `cp -aRf`: existing files are replaced,
/// modification times kept, symlinks copied as links.
pub fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(|e| CtlError::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| CtlError::Other(e.to_string()))?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            copy_tree_entry(entry.path(), &target, file_type.is_symlink())?;
        }
    }
    Ok(())
}

/// Copies a single non-directory entry, as a link when `symlink` is set.
pub fn copy_tree_entry(from: &Path, to: &Path, symlink: bool) -> Result<()> {
    if symlink {
        copy_symlink(from, to)
    } else {
        copy_file(from, to)
    }
}

/// Copies one file keeping permissions and mtime. A busy target is
/// unlinked and written anew.
pub fn copy_file(from: &Path, to: &Path) -> Result<()> {
    if let Err(e) = fs::copy(from, to) {
        tracing::debug!(path = %to.display(), error = %e, "Replacing target file");
        remove_if_exists(to)?;
        fs::copy(from, to)?;
    }
    let meta = fs::metadata(from)?;
    filetime::set_file_mtime(to, filetime::FileTime::from_last_modification_time(&meta))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    let link = fs::read_link(from)?;
    remove_if_exists(to)?;
    std::os::unix::fs::symlink(link, to)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    copy_file(from, to)
}
