//! Object-store key layout and fileId recovery for legacy records.

use crate::models::source::SourceObject;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("cannot resolve fileId from legacy filename `{0}`")]
    UnresolvableFileId(String),
    #[error("source record `{0}` has no owner id")]
    MissingOwner(String),
    #[error("invalid owner id `{0}`")]
    InvalidOwner(String),
    #[error("empty fileId")]
    EmptyFileId,
    #[error("invalid fileId `{0}`")]
    InvalidFileId(String),
}

/// Maps (oid, fileId) pairs onto object-store keys: `{prefix}{oid}/{fileId}`.
///
/// Owner ids may not contain `/`, which keeps the mapping injective.
#[derive(Clone, Debug)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn key(&self, oid: &str, file_id: &str) -> Result<String, KeyError> {
        Ok(format!("{}{}", self.owner_dir(oid)?, valid_file_id(file_id)?))
    }

    /// The key prefix holding every object of one owner, with a trailing `/`.
    pub fn owner_dir(&self, oid: &str) -> Result<String, KeyError> {
        if oid.is_empty() || oid.contains('/') {
            return Err(KeyError::InvalidOwner(oid.to_string()));
        }
        Ok(format!("{}{}/", self.prefix, oid))
    }
}

/// FileIds may nest with `/`, but every segment must name a file.
fn valid_file_id(file_id: &str) -> Result<&str, KeyError> {
    if file_id.is_empty() {
        return Err(KeyError::EmptyFileId);
    }
    if file_id
        .split('/')
        .any(|segment| matches!(segment, "" | "." | ".."))
    {
        return Err(KeyError::InvalidFileId(file_id.to_string()));
    }
    Ok(file_id)
}

/// Split a key into its directory (with trailing `/`) and its last segment.
pub fn split_key(key: &str) -> (&str, &str) {
    match key.rfind('/') {
        Some(at) => key.split_at(at + 1),
        None => ("", key),
    }
}

/// The application fileId of a source record.
///
/// Falls back to the second `/`-separated segment of the legacy filename.
pub fn resolve_file_id(record: &SourceObject) -> Result<String, KeyError> {
    if let Some(file_id) = record.file_id.as_deref().filter(|id| !id.is_empty()) {
        return Ok(file_id.to_string());
    }
    match record.filename.split('/').nth(1) {
        Some(segment) if !segment.is_empty() => Ok(segment.to_string()),
        _ => Err(KeyError::UnresolvableFileId(record.filename.clone())),
    }
}

pub fn resolve_oid(record: &SourceObject) -> Result<String, KeyError> {
    record
        .oid
        .clone()
        .filter(|oid| !oid.is_empty())
        .ok_or_else(|| KeyError::MissingOwner(record.id.clone()))
}
