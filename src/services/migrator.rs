//! Batch migration from the legacy bucket into the object store.
//!
//! Items are processed one at a time in cursor order. A failing item is
//! logged, recorded in `errored`, and the run moves on; only configuration
//! and connection problems at startup abort a run.

use crate::{
    config::RunConfig,
    models::{
        relation::{CloudType, RelationMetadata},
        source::SourceObject,
        stats::RunStats,
    },
    services::{
        bounded,
        checksum::ChecksumResolver,
        external_sync::{ExternalSync, Rclone},
        keys::{KeyError, KeyLayout, resolve_file_id, resolve_oid, split_key},
        object_store::{ObjectStore, ProgressFn, S3ObjectStore, UploadProgress},
        relation_store::{RelationError, RelationStore, should_skip},
        source_store::{GridFsSource, SourceError, SourceStore},
        transfer::{TransferEngine, TransferFailure, TransferItem, TransferOutcome},
    },
};
use futures::StreamExt;
use serde_json::{Map, Value};
use std::{path::Path, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{error, info, warn};

/// Failures that abort a run before any item is processed.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("cannot read configuration: {0:#}")]
    ConfigUnreadable(anyhow::Error),
    #[error("the external sync tool (`rclone.configPath`, `rclone.remoteName`) is not configured")]
    MissingFallbackConfig,
    #[error("cannot create staging directory: {0}")]
    Staging(std::io::Error),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("cannot open relation store: {0}")]
    Target(#[from] RelationError),
}

/// Why one item did not make it.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("digest resolution failed: {0}")]
    Digest(#[from] SourceError),
    #[error("relation lookup failed: {0}")]
    RelationLookup(#[source] RelationError),
    #[error(transparent)]
    Transfer(#[from] TransferFailure),
    /// The object was transferred but has no matching record.
    #[error("relation write failed after upload: {0}")]
    RelationWriteFailed(#[source] RelationError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemOutcome {
    Skipped,
    Uploaded,
}

/// Metadata keys owned by the engine; source values under these names are dropped.
const RESERVED_METADATA: &[&str] = &[
    "fileId", "bucket", "key", "filename", "digest", "size", "source", "cloudType", "ETag",
];

pub struct Migrator {
    source: Arc<dyn SourceStore>,
    relations: RelationStore,
    checksums: ChecksumResolver,
    engine: TransferEngine,
    layout: KeyLayout,
    bucket: String,
    query: Map<String, Value>,
    skip_uploaded: bool,
    timeout: Option<Duration>,
}

impl Migrator {
    pub fn new(
        cfg: &RunConfig,
        source: Arc<dyn SourceStore>,
        store: Arc<dyn ObjectStore>,
        sync: Arc<dyn ExternalSync>,
        relations: RelationStore,
    ) -> Self {
        let timeout = cfg.s3.timeout();
        let checksums = ChecksumResolver::new(source.clone(), &cfg.mongodb.target.temp_dir, timeout);
        let mut engine = TransferEngine::new(source.clone(), store, sync, checksums.clone(), timeout);
        if cfg.s3.log_upload_progress {
            engine = engine.with_progress(log_progress());
        }

        Self {
            source,
            relations,
            checksums,
            engine,
            layout: KeyLayout::new(cfg.s3.key_prefix.clone()),
            bucket: cfg.s3.bucket_name.clone(),
            query: cfg.mongodb.source.query.clone(),
            skip_uploaded: cfg.s3.skip_uploaded,
            timeout,
        }
    }

    /// Connect every collaborator named by the configuration.
    pub async fn connect(cfg: &RunConfig) -> Result<Self, MigrationError> {
        let rclone = cfg
            .rclone
            .clone()
            .filter(|rclone| rclone.is_configured())
            .ok_or(MigrationError::MissingFallbackConfig)?;
        tokio::fs::create_dir_all(&cfg.mongodb.target.temp_dir)
            .await
            .map_err(MigrationError::Staging)?;

        info!("Connecting to source db: {}", cfg.mongodb.source.db_name);
        let source = GridFsSource::connect(&cfg.mongodb.source).await?;
        info!("Connecting to target db: {}", cfg.mongodb.target.connection_str);
        let relations = match RelationStore::connect(
            &cfg.mongodb.target.connection_str,
            &cfg.mongodb.target.collection,
        )
        .await
        {
            Ok(relations) => relations,
            Err(err) => {
                source.close().await;
                return Err(err.into());
            }
        };
        let store = S3ObjectStore::from_config(&cfg.s3).await;

        Ok(Self::new(
            cfg,
            Arc::new(source),
            Arc::new(store),
            Arc::new(Rclone::new(rclone)),
            relations,
        ))
    }

    /// Walk the source selection once.
    pub async fn run(&self) -> RunStats {
        let mut stats = RunStats::start();
        info!("Uploading to s3://{}/{}", self.bucket, self.layout.prefix());
        let query = Value::Object(self.query.clone());
        info!("Getting source records: {}", query);

        let cursor = bounded(self.timeout, self.source.find(&self.query))
            .await
            .unwrap_or(Err(SourceError::TimedOut));
        match cursor {
            Ok(mut cursor) => loop {
                match bounded(self.timeout, cursor.next()).await {
                    Ok(Some(Ok(object))) => self.process(&object, &mut stats).await,
                    Ok(Some(Err(err))) => {
                        error!("Source cursor failed, ending run: {}", err);
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        error!("Source cursor timed out, ending run");
                        break;
                    }
                }
            },
            Err(err) => error!("Cannot query source records: {}", err),
        }

        stats.finish();
        stats
    }

    pub async fn close(&self) {
        self.source.close().await;
        self.relations.close().await;
    }

    async fn process(&self, object: &SourceObject, stats: &mut RunStats) {
        let file_id = match resolve_file_id(object) {
            Ok(file_id) => file_id,
            Err(err) => {
                let label = object.filename.clone();
                warn!("Skipping source record `{}`: {}", object.id, err);
                stats.processed.push(label.clone());
                stats.errored.push(label);
                return;
            }
        };
        stats.processed.push(file_id.clone());

        match self.migrate_item(object, &file_id).await {
            Ok(ItemOutcome::Skipped) => {
                info!("Skipping: {}", file_id);
                stats.skipped.push(file_id);
            }
            Ok(ItemOutcome::Uploaded) => stats.uploaded.push(file_id),
            Err(err) => {
                error!(
                    "Failed to process: oid={} fileId={} error={}",
                    object.oid.as_deref().unwrap_or("<none>"),
                    file_id,
                    err
                );
                stats.errored.push(file_id);
            }
        }
    }

    /// Skip check, digest, transfer and relation write for one item.
    ///
    /// The digest is only compared when the recorded size already matches;
    /// a matching record without a digest skips without touching the source.
    pub async fn migrate_item(&self, object: &SourceObject, file_id: &str) -> Result<ItemOutcome, ItemError> {
        let oid = resolve_oid(object)?;
        let key = self.layout.key(&oid, file_id)?;
        let (_, file_name) = split_key(&key);

        let candidate = if self.skip_uploaded {
            self.relations
                .find(&oid, file_id)
                .await
                .map_err(ItemError::RelationLookup)?
                .filter(|record| record.metadata.size == object.length)
        } else {
            None
        };
        if candidate.as_ref().is_some_and(|record| record.metadata.digest.is_none()) {
            return Ok(ItemOutcome::Skipped);
        }

        let resolved = self.checksums.resolve(object, file_name).await?;
        if candidate.is_some() && should_skip(candidate.as_ref(), object.length, Some(&resolved.digest)) {
            return Ok(ItemOutcome::Skipped);
        }

        info!("Uploading: {}", file_id);
        let item = TransferItem {
            object,
            file_id,
            bucket: &self.bucket,
            key: &key,
        };
        let outcome = self.engine.transfer(&item, resolved).await?;

        let metadata = relation_metadata(object, file_id, &outcome);
        self.relations
            .upsert(&oid, object.upload_date, &metadata)
            .await
            .map_err(ItemError::RelationWriteFailed)?;
        Ok(ItemOutcome::Uploaded)
    }
}

/// Source metadata merged under the engine-owned fields.
fn relation_metadata(object: &SourceObject, file_id: &str, outcome: &TransferOutcome) -> RelationMetadata {
    let mut extra = object.metadata.clone();
    for reserved in RESERVED_METADATA {
        extra.remove(*reserved);
    }
    RelationMetadata {
        file_id: file_id.to_string(),
        bucket: outcome.bucket.clone(),
        key: outcome.key.clone(),
        filename: file_id.to_string(),
        digest: Some(outcome.digest.clone()),
        size: outcome.size,
        source: outcome.source,
        cloud_type: CloudType::S3,
        etag: outcome.etag.clone(),
        extra,
    }
}

fn log_progress() -> ProgressFn {
    Arc::new(|progress: &UploadProgress| {
        info!(
            "{}: part {} loaded {} of {} bytes",
            progress.key,
            progress.part,
            progress.loaded,
            progress
                .total
                .map(|total| total.to_string())
                .unwrap_or_else(|| "?".into())
        );
    })
}

/// Load the configuration at `path`, run one migration and report the statistics.
pub async fn migrate(path: &Path) -> Result<RunStats, MigrationError> {
    let cfg = RunConfig::load(path)
        .await
        .map_err(MigrationError::ConfigUnreadable)?;
    let migrator = Migrator::connect(&cfg).await?;
    let stats = migrator.run().await;
    migrator.close().await;
    Ok(stats)
}
