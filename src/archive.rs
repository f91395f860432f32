//! EPUB archive extraction
//!
//! An EPUB is a ZIP container. The pipeline works on an extracted
//! filesystem tree, so the first step unpacks the archive into a
//! destination directory. Decompression itself is delegated to the `zip`
//! crate; this module only walks entries and writes them out.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::error::{EpubError, Result};

/// Unpacks an archive into a directory.
///
/// The pipeline takes the extractor by reference so callers can swap in
/// their own implementation (for instance one that reuses a cache).
pub trait ArchiveExtractor {
    /// Extract `source` into `destination`, returning the extraction root.
    fn extract(&self, source: &Path, destination: &Path) -> Result<PathBuf>;
}

/// Default extractor backed by the `zip` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct ZipExtractor;

impl ArchiveExtractor for ZipExtractor {
    fn extract(&self, source: &Path, destination: &Path) -> Result<PathBuf> {
        extract_epub(source, destination)
    }
}

/// Extract every entry of the EPUB at `source` into `destination`.
///
/// Entries whose names would escape the destination (absolute paths or
/// `..` components) are skipped. Any read or decompression failure is
/// reported as [`EpubError::Archive`].
pub fn extract_epub(source: &Path, destination: &Path) -> Result<PathBuf> {
    let file = File::open(source)
        .map_err(|e| EpubError::Archive(format!("{}: {}", source.display(), e)))?;
    let mut archive = ZipArchive::new(file)?;
    fs::create_dir_all(destination)?;

    let mut written = 0usize;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(relative) = entry.enclosed_name() else {
            log::warn!("Skipping archive entry with unsafe path: {}", entry.name());
            continue;
        };
        let out_path = destination.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)
            .map_err(|e| EpubError::Archive(format!("{}: {}", entry.name(), e)))?;
        written += 1;
    }

    log::debug!(
        "Extracted {} files from {} into {}",
        written,
        source.display(),
        destination.display()
    );
    Ok(destination.to_path_buf())
}
