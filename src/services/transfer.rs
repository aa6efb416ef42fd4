//! Tiered transfer of one source object to the destination store.
//!
//! Tiers are tried strictly in order:
//!
//! 1. [`Tier::StreamUpload`]: stream straight from the source, no local copy.
//!    Skipped when resolving the digest already required a staged copy.
//! 2. [`Tier::LocalStage`]: upload from a local staged copy.
//! 3. [`Tier::ExternalSync`]: hand the staged copy to the external sync tool.
//!
//! The staged file, if any, is owned by the engine for the duration of the
//! call and removed when it returns, whatever the outcome.

use crate::{
    models::{relation::Provenance, source::SourceObject},
    services::{
        bounded,
        checksum::{ChecksumResolver, ResolvedDigest, StagedFile},
        keys::split_key,
        external_sync::{ExternalSync, SyncToolError},
        object_store::{ObjectStore, ObjectStoreError, ProgressFn, PutOutcome, PutRequest},
        source_store::{BlobReader, SourceError, SourceStore},
    },
};
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::fs::File;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    StreamUpload,
    LocalStage,
    ExternalSync,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::StreamUpload => "stream upload",
            Tier::LocalStage => "local stage",
            Tier::ExternalSync => "external sync",
        })
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("stream upload failed: {0}")]
    StreamUploadFailed(String),
    #[error("local re-upload failed: {0}")]
    LocalReuploadFailed(String),
    #[error("external sync failed: {0}")]
    ExternalSyncFailed(String),
}

/// Every tier failed.
#[derive(Debug, Error)]
#[error("all transfer tiers failed: {}", summarize(.errors))]
pub struct TransferFailure {
    pub attempts: Vec<Tier>,
    pub errors: Vec<TransferError>,
}

fn summarize(errors: &[TransferError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// What to transfer and where.
#[derive(Clone, Debug)]
pub struct TransferItem<'a> {
    pub object: &'a SourceObject,
    pub file_id: &'a str,
    pub bucket: &'a str,
    pub key: &'a str,
}

impl TransferItem<'_> {
    /// Key prefix the external tool copies into, with a trailing `/`.
    pub fn dest_dir(&self) -> &str {
        split_key(self.key).0
    }

    /// Name of the staged copy; `dest_dir() + file_name()` is the key.
    pub fn file_name(&self) -> &str {
        split_key(self.key).1
    }
}

/// Enough to build a relation record.
#[derive(Clone, Debug, PartialEq)]
pub struct TransferOutcome {
    pub tier: Tier,
    pub attempts: Vec<Tier>,
    pub bucket: String,
    pub key: String,
    pub digest: String,
    pub size: u64,
    pub source: Provenance,
    /// Absent when the external tool did the copy.
    pub etag: Option<String>,
}

#[derive(Clone)]
pub struct TransferEngine {
    source: Arc<dyn SourceStore>,
    store: Arc<dyn ObjectStore>,
    sync: Arc<dyn ExternalSync>,
    checksums: ChecksumResolver,
    timeout: Option<Duration>,
    progress: Option<ProgressFn>,
}

impl TransferEngine {
    pub fn new(
        source: Arc<dyn SourceStore>,
        store: Arc<dyn ObjectStore>,
        sync: Arc<dyn ExternalSync>,
        checksums: ChecksumResolver,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            source,
            store,
            sync,
            checksums,
            timeout,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Run the tiers in order until one succeeds.
    pub async fn transfer(
        &self,
        item: &TransferItem<'_>,
        resolved: ResolvedDigest,
    ) -> Result<TransferOutcome, TransferFailure> {
        let digest = resolved.digest;
        let mut staged = resolved.staged;
        let mut attempts = Vec::new();
        let mut errors = Vec::new();
        let mut tier = if staged.is_some() {
            Tier::LocalStage
        } else {
            Tier::StreamUpload
        };

        loop {
            attempts.push(tier);
            let result = match tier {
                Tier::StreamUpload => self.stream_upload(item, &digest).await,
                Tier::LocalStage => self.local_stage(item, &digest, &mut staged).await,
                Tier::ExternalSync => self.external_sync(item, staged.as_ref()).await,
            };

            match result {
                Ok(put) => {
                    info!("Uploaded `{}` via {}", item.key, tier);
                    return Ok(TransferOutcome {
                        tier,
                        attempts,
                        bucket: item.bucket.to_string(),
                        key: item.key.to_string(),
                        digest: put.as_ref().map(|p| p.digest.clone()).unwrap_or(digest),
                        size: put.as_ref().map(|p| p.size).unwrap_or(item.object.length),
                        source: Provenance::Migration,
                        etag: put.and_then(|p| p.etag),
                    });
                }
                Err(err) => {
                    warn!("{} of `{}` failed: {}", tier, item.key, err);
                    errors.push(err);
                    tier = match tier {
                        Tier::StreamUpload => Tier::LocalStage,
                        Tier::LocalStage => Tier::ExternalSync,
                        Tier::ExternalSync => return Err(TransferFailure { attempts, errors }),
                    };
                }
            }
        }
    }

    async fn put(&self, item: &TransferItem<'_>, digest: &str, body: BlobReader) -> Result<PutOutcome, ObjectStoreError> {
        let req = PutRequest {
            bucket: item.bucket,
            key: item.key,
            digest: Some(digest),
            size: Some(item.object.length),
        };
        bounded(self.timeout, self.store.put(&req, body, self.progress.clone()))
            .await
            .unwrap_or(Err(ObjectStoreError::TimedOut))
    }

    async fn stream_upload(&self, item: &TransferItem<'_>, digest: &str) -> Result<Option<PutOutcome>, TransferError> {
        let body = bounded(self.timeout, self.source.open_stream(item.object))
            .await
            .unwrap_or(Err(SourceError::TimedOut))
            .map_err(|err| TransferError::StreamUploadFailed(err.to_string()))?;
        self.put(item, digest, body)
            .await
            .map(Some)
            .map_err(|err| TransferError::StreamUploadFailed(err.to_string()))
    }

    async fn local_stage(
        &self,
        item: &TransferItem<'_>,
        digest: &str,
        staged: &mut Option<StagedFile>,
    ) -> Result<Option<PutOutcome>, TransferError> {
        let file = match staged.take() {
            Some(file) => file,
            None => {
                debug!("Staging `{}` for re-upload", item.file_id);
                self.checksums
                    .stage(item.object, item.file_name())
                    .await
                    .map_err(|err| TransferError::LocalReuploadFailed(err.to_string()))?
            }
        };
        let path = file.path().to_path_buf();
        *staged = Some(file);

        let body = File::open(&path)
            .await
            .map_err(|err| TransferError::LocalReuploadFailed(err.to_string()))?;
        self.put(item, digest, Box::pin(body))
            .await
            .map(Some)
            .map_err(|err| TransferError::LocalReuploadFailed(err.to_string()))
    }

    async fn external_sync(
        &self,
        item: &TransferItem<'_>,
        staged: Option<&StagedFile>,
    ) -> Result<Option<PutOutcome>, TransferError> {
        let Some(file) = staged else {
            return Err(TransferError::ExternalSyncFailed(
                "no staged copy to hand over".to_string(),
            ));
        };
        bounded(self.timeout, self.sync.copy(file.path(), item.bucket, item.dest_dir()))
            .await
            .unwrap_or_else(|_| Err(SyncToolError::Failed {
                status: "timeout".to_string(),
                stderr: String::new(),
            }))
            .map(|()| None)
            .map_err(|err| TransferError::ExternalSyncFailed(err.to_string()))
    }
}
