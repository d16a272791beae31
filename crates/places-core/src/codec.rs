//! Portable export document for the place collection.
//!
//! The wire shape is fixed by files already produced in the field:
//! `version`, `fecha_exportacion`, `total_lugares`, `lugares`.

use serde::{Deserialize, Serialize};
use time::format_description;
use time::OffsetDateTime;

use crate::Place;

pub const EXPORT_FORMAT_VERSION: &str = "1.0";

const EXPORTED_AT_FORMAT: &str = "[year]-[month]-[day] [hour]:[minute]:[second]";
const FILE_STAMP_FORMAT: &str = "[year][month][day]_[hour][minute][second]";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed export document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("export document declares a negative total_lugares ({0})")]
    NegativeTotal(i64),
    #[error("unsupported export format version {found:?}; expected {expected}")]
    UnsupportedFormatVersion { found: String, expected: &'static str },
    #[error("failed to format export timestamp: {0}")]
    Timestamp(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportDocument {
    #[serde(rename = "version")]
    pub format_version: String,
    /// `YYYY-MM-DD HH:mm:ss`, UTC.
    #[serde(rename = "fecha_exportacion")]
    pub exported_at: String,
    #[serde(rename = "total_lugares")]
    pub total_count: i64,
    #[serde(rename = "lugares")]
    pub places: Vec<Place>,
}

impl ExportDocument {
    /// Pretty-printed JSON with a stable field order.
    ///
    /// # Errors
    /// Returns [`CodecError::Json`] when serialization fails.
    pub fn to_pretty_json(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate a document. Nothing is returned unless the whole document is
    /// well formed.
    ///
    /// # Errors
    /// Returns a [`CodecError`] for invalid JSON, missing keys, type mismatches, an
    /// unsupported format version, or a negative total.
    pub fn parse(text: &str) -> Result<Self, CodecError> {
        let document: Self = serde_json::from_str(text)?;

        if document.format_version != EXPORT_FORMAT_VERSION {
            return Err(CodecError::UnsupportedFormatVersion {
                found: document.format_version,
                expected: EXPORT_FORMAT_VERSION,
            });
        }

        if document.total_count < 0 {
            return Err(CodecError::NegativeTotal(document.total_count));
        }

        Ok(document)
    }

    /// Whether `total_lugares` agrees with the number of entries actually present.
    #[must_use]
    pub fn count_matches(&self) -> bool {
        usize::try_from(self.total_count).is_ok_and(|total| total == self.places.len())
    }
}

/// Build an export document for `places`, stamped with `exported_at`.
///
/// # Errors
/// Returns [`CodecError::Timestamp`] when the timestamp cannot be formatted.
pub fn export(places: &[Place], exported_at: OffsetDateTime) -> Result<ExportDocument, CodecError> {
    Ok(ExportDocument {
        format_version: EXPORT_FORMAT_VERSION.to_string(),
        exported_at: format_exported_at(exported_at)?,
        total_count: i64::try_from(places.len()).unwrap_or(i64::MAX),
        places: places.to_vec(),
    })
}

/// Parse document text into place candidates.
///
/// # Errors
/// See [`ExportDocument::parse`].
pub fn import(text: &str) -> Result<Vec<Place>, CodecError> {
    Ok(ExportDocument::parse(text)?.places)
}

/// `YYYY-MM-DD HH:mm:ss`.
///
/// # Errors
/// Returns [`CodecError::Timestamp`] when formatting fails.
pub fn format_exported_at(value: OffsetDateTime) -> Result<String, CodecError> {
    format_with(value, EXPORTED_AT_FORMAT)
}

/// `YYYYMMDD_HHmmss`, used as the collision-avoiding suffix of export file names.
///
/// # Errors
/// Returns [`CodecError::Timestamp`] when formatting fails.
pub fn format_file_stamp(value: OffsetDateTime) -> Result<String, CodecError> {
    format_with(value, FILE_STAMP_FORMAT)
}

fn format_with(value: OffsetDateTime, description: &str) -> Result<String, CodecError> {
    let items = format_description::parse(description)
        .map_err(|err| CodecError::Timestamp(err.to_string()))?;
    value.format(&items).map_err(|err| CodecError::Timestamp(err.to_string()))
}
