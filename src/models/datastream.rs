//! Application-facing datastream descriptors used by the live service.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A reference to one attachment of an owner record.
///
/// `cloud_type` is the provider tag; when absent the service's configured
/// default provider applies. Provider-specific fields live in `metadata`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Datastream {
    pub file_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_type: Option<String>,

    /// Optional destination bucket overriding the configured one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,

    /// Attachment kind from the form; only `attachment` entries are synced.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Datastream {
    pub fn new(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            ..Self::default()
        }
    }

    pub fn is_attachment(&self) -> bool {
        self.kind.as_deref() == Some("attachment")
    }
}
