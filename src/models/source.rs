//! Represents a legacy chunked-file record in the source bucket.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// A single file stored in the legacy chunked bucket.
///
/// Source objects are read-only inputs; nothing in this crate creates or
/// destroys them.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceObject {
    /// Internal identifier within the source bucket (hex ObjectId or string).
    pub id: String,

    /// Owner identifier (`metadata.redboxOid`, or `metadata.oid` on older records).
    pub oid: Option<String>,

    /// Application-level file id (`metadata.fileId`), absent on some legacy records.
    pub file_id: Option<String>,

    /// Legacy filename, usually `{oid}/{fileId}`.
    pub filename: String,

    /// Size in bytes.
    pub length: u64,

    /// Digest stored with the file document by older servers.
    pub md5: Option<String>,

    pub upload_date: Option<DateTime<Utc>>,

    /// Remaining metadata fields, merged into the relation record on upload.
    pub metadata: Map<String, Value>,
}
