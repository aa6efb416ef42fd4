//! The durable link between an owner/file pair and its object-store location.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Which path produced a relation record.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Uploaded by the live datastream service.
    Server,
    /// Uploaded by a batch migration run.
    Migration,
}

/// Object-store provider tag.
///
/// New providers must be added here explicitly; every dispatch site matches
/// exhaustively so an unhandled variant is a compile error.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CloudType {
    S3,
}

impl CloudType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudType::S3 => "s3",
        }
    }
}

impl fmt::Display for CloudType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloudType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "s3" => Ok(CloudType::S3),
            other => Err(other.to_string()),
        }
    }
}

/// Location and integrity information stored with each relation.
///
/// Any additional metadata carried over from the source item (display name,
/// MIME type, ...) lives in `extra` and is flattened into the same JSON
/// object, with the engine-owned fields taking precedence.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelationMetadata {
    pub file_id: String,
    pub bucket: String,
    pub key: String,
    pub filename: String,

    /// MD5 hex digest of the object content, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// Size in bytes.
    pub size: u64,

    pub source: Provenance,
    pub cloud_type: CloudType,

    /// Store-assigned version tag. Absent when the external sync tool did the copy.
    #[serde(rename = "ETag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RelationMetadata {
    /// Display name for client listings: the carried `name` if any, else the filename.
    pub fn display_name(&self) -> String {
        self.extra
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.filename.clone())
    }

    pub fn mime_type(&self) -> Option<String> {
        self.extra
            .get("mimeType")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// A row of the relation side-table.
///
/// At most one record exists per (`redbox_oid`, `metadata.file_id`).
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RelationRecord {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Owner identifier.
    pub redbox_oid: String,

    /// Upload timestamp carried over from the source item, if any.
    pub upload_date: Option<DateTime<Utc>>,

    #[sqlx(json)]
    pub metadata: RelationMetadata,

    /// Set on first insert, preserved across upserts.
    pub date_created: DateTime<Utc>,

    /// Updated on every write.
    pub last_save_date: DateTime<Utc>,
}

/// Client-safe projection of a relation record.
///
/// Never exposes bucket, key or digest.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentView {
    pub upload_date: DateTime<Utc>,
    pub metadata: AttachmentViewMetadata,
    pub redbox_oid: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentViewMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl AttachmentView {
    pub fn from_record(oid: &str, record: &RelationRecord) -> Self {
        Self {
            upload_date: record.last_save_date,
            metadata: AttachmentViewMetadata {
                name: record.metadata.display_name(),
                mime_type: record.metadata.mime_type(),
            },
            redbox_oid: oid.to_string(),
        }
    }
}
