//! Export documents on disk: timestamped snapshots plus one well-known file.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use places_core::codec::format_file_stamp;
use places_core::ExportDocument;
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{ErrorContext, StoreError};

pub const EXPORT_FILE_NAME: &str = "places_export.json";

const TIMESTAMPED_PREFIX: &str = "places_export_";
const MAX_COLLISION_SUFFIX: u32 = 1_000;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExportFileInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// RFC 3339, UTC.
    pub modified_at: Option<String>,
}

/// The user's downloads directory, or the current directory when there is none.
#[must_use]
pub fn default_export_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Write `document` to `places_export_<stamp>.json` in `dir`. An existing file is never
/// overwritten: `_1`, `_2`, ... suffixes are tried instead.
///
/// # Errors
/// Returns an error when the directory cannot be created, no free name is found, or the
/// write fails.
pub fn write_timestamped_export(
    dir: &Path,
    document: &ExportDocument,
    exported_at: OffsetDateTime,
) -> Result<PathBuf, StoreError> {
    ensure_dir(dir)?;
    let stamp = format_file_stamp(exported_at)?;
    let body = document.to_pretty_json()?;

    for attempt in 0..=MAX_COLLISION_SUFFIX {
        let file_name = if attempt == 0 {
            format!("{TIMESTAMPED_PREFIX}{stamp}.json")
        } else {
            format!("{TIMESTAMPED_PREFIX}{stamp}_{attempt}.json")
        };
        let path = dir.join(file_name);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to create export file {}", path.display())
                });
            }
        };

        let written = file.write_all(body.as_bytes()).and_then(|()| file.sync_all());
        drop(file);
        discard_on_error(&path, written)?;

        tracing::info!(path = %path.display(), places = document.total_count, "wrote export");
        return Ok(path);
    }

    Err(std::io::Error::new(
        ErrorKind::AlreadyExists,
        format!("no free export file name for stamp {stamp}"),
    ))
    .with_context(|| format!("failed to choose export file name in {}", dir.display()))
}

/// Write `document` to the well-known [`EXPORT_FILE_NAME`] in `dir`, replacing any
/// previous copy.
///
/// # Errors
/// Returns an error when the directory cannot be created or the write fails.
pub fn write_latest_export(dir: &Path, document: &ExportDocument) -> Result<PathBuf, StoreError> {
    ensure_dir(dir)?;
    let path = dir.join(EXPORT_FILE_NAME);
    fs::write(&path, document.to_pretty_json()?)
        .with_context(|| format!("failed to write export file {}", path.display()))?;

    tracing::info!(path = %path.display(), places = document.total_count, "wrote latest export");
    Ok(path)
}

#[must_use]
pub fn exported_file_exists(dir: &Path) -> bool {
    dir.join(EXPORT_FILE_NAME).is_file()
}

/// Size and modification time of the well-known export file, if present.
///
/// # Errors
/// Returns an error when the file exists but its metadata cannot be read.
pub fn exported_file_info(dir: &Path) -> Result<Option<ExportFileInfo>, StoreError> {
    let path = dir.join(EXPORT_FILE_NAME);
    let metadata = match fs::metadata(&path) {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Ok(None),
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read metadata for {}", path.display()));
        }
    };

    let modified_at = metadata
        .modified()
        .ok()
        .map(OffsetDateTime::from)
        .and_then(|value| value.format(&time::format_description::well_known::Rfc3339).ok());

    Ok(Some(ExportFileInfo { path, size_bytes: metadata.len(), modified_at }))
}

/// Remove the well-known export file. Returns whether a file was deleted.
///
/// # Errors
/// Returns an error when the file exists but cannot be removed.
pub fn delete_exported_file(dir: &Path) -> Result<bool, StoreError> {
    let path = dir.join(EXPORT_FILE_NAME);
    match fs::remove_file(&path) {
        Ok(()) => {
            tracing::info!(path = %path.display(), "deleted export file");
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("failed to delete {}", path.display())),
    }
}

/// Read and validate the export document at `path`.
///
/// # Errors
/// Returns an error when the file cannot be read or is not a valid document.
pub fn read_export_document(path: &Path) -> Result<ExportDocument, StoreError> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read export file {}", path.display()))?;
    Ok(ExportDocument::parse(&text)?)
}

/// Remove a freshly created file whose contents could not be written in full.
fn discard_on_error(path: &Path, written: std::io::Result<()>) -> Result<(), StoreError> {
    let Err(err) = written else {
        return Ok(());
    };

    if let Err(remove_err) = fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %remove_err, "failed to remove partial export");
    }
    Err(err).with_context(|| format!("failed to write export file {}", path.display()))
}

fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create export directory {}", dir.display()))
}
