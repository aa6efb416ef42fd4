//! Live datastream service: single-object add/get/remove/list for files an
//! upload step has already staged locally.
//!
//! Uploads go straight to the object store with no tiered fallback. Errors
//! returned to callers carry generic messages; details stay in the logs.

use crate::{
    config::{DatastreamConfig, RunConfig},
    models::{
        datastream::Datastream,
        relation::{AttachmentView, CloudType, Provenance, RelationMetadata, RelationRecord},
    },
    services::{
        bounded,
        checksum::digest_file,
        external_sync::{ExternalSync, Rclone},
        keys::{KeyError, KeyLayout, split_key},
        object_store::{
            ObjectStore, ObjectStoreError, ObjectStoreResult, PutOutcome, PutRequest, S3ObjectStore,
        },
        relation_store::{RelationError, RelationStore},
        source_store::BlobReader,
    },
};
use async_trait::async_trait;
use serde::Serialize;
use std::{
    collections::HashSet,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::fs::File;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum DatastreamError {
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("Failed to upload file, check server logs.")]
    UploadFailed,
    #[error("Can't find attachment: {oid}/{file_id}")]
    NotFound { oid: String, file_id: String },
    #[error("Failed to download datastream, check server logs.")]
    DownloadFailed,
    #[error("Datastream not found in object store: {oid}/{file_id}")]
    ObjectNotFoundOnDelete { oid: String, file_id: String },
    #[error("Failed to remove datastream.")]
    RemoveFailed,
    #[error("Unsupported datastream cloud type: {0}")]
    UnsupportedCloudType(String),
    #[error("Invalid datastream reference, check server logs.")]
    InvalidReference(#[from] KeyError),
    #[error("Failed to update attachment link, check server logs.")]
    Relation(#[from] RelationError),
}

pub type DatastreamResult<T> = Result<T, DatastreamError>;

/// Outcome of a batch call; one message line per item.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct BatchResponse {
    pub success: bool,
    pub message: String,
}

impl BatchResponse {
    fn new() -> Self {
        Self {
            success: true,
            message: String::new(),
        }
    }

    fn record(&mut self, ok: bool, line: String) {
        self.success &= ok;
        if !self.message.is_empty() {
            self.message.push('\n');
        }
        self.message.push_str(&line);
    }
}

/// Operations one storage provider implements.
#[async_trait]
pub trait DatastreamProvider: Send + Sync {
    async fn add(&self, oid: &str, datastream: &Datastream) -> DatastreamResult<RelationRecord>;
    async fn get(&self, oid: &str, file_id: &str) -> DatastreamResult<BlobReader>;
    async fn remove(&self, oid: &str, datastream: &Datastream) -> DatastreamResult<()>;
    async fn list(&self, oid: &str, file_id: Option<&str>) -> DatastreamResult<Vec<AttachmentView>>;
}

/// Metadata keys written by the service itself.
const RESERVED_METADATA: &[&str] = &[
    "fileId", "bucket", "key", "filename", "digest", "size", "source", "cloudType", "ETag",
];

/// S3-compatible provider.
#[derive(Clone)]
pub struct S3Datastreams {
    store: Arc<dyn ObjectStore>,
    relations: RelationStore,
    sync: Option<Arc<dyn ExternalSync>>,
    layout: KeyLayout,
    bucket: String,
    staging_dir: PathBuf,
    use_object_bucket_metadata: bool,
    timeout: Option<Duration>,
}

impl S3Datastreams {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        relations: RelationStore,
        sync: Option<Arc<dyn ExternalSync>>,
        layout: KeyLayout,
        bucket: impl Into<String>,
        cfg: &DatastreamConfig,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            relations,
            sync,
            layout,
            bucket: bucket.into(),
            staging_dir: cfg.staging_dir.clone(),
            use_object_bucket_metadata: cfg.use_object_bucket_metadata,
            timeout,
        }
    }

    /// Object-store call under the configured timeout.
    async fn timed<T>(&self, call: impl Future<Output = ObjectStoreResult<T>>) -> ObjectStoreResult<T> {
        bounded(self.timeout, call)
            .await
            .unwrap_or(Err(ObjectStoreError::TimedOut))
    }

    /// Whether `get`/`remove` can find objects written to `bucket`.
    fn readable_bucket(&self, bucket: &str) -> bool {
        self.use_object_bucket_metadata || bucket == self.bucket
    }

    fn staged_path(&self, file_id: &str) -> DatastreamResult<PathBuf> {
        let name = Path::new(file_id);
        if file_id.is_empty() || name.file_name() != Some(name.as_os_str()) {
            return Err(DatastreamError::FileNotFound(file_id.to_string()));
        }
        Ok(self.staging_dir.join(name))
    }

    /// Bucket a stored object lives in.
    fn bucket_of<'a>(&'a self, requested: Option<&'a str>, record: &'a RelationRecord) -> &'a str {
        if !self.use_object_bucket_metadata {
            return &self.bucket;
        }
        requested
            .filter(|bucket| !bucket.is_empty())
            .or(Some(record.metadata.bucket.as_str()).filter(|bucket| !bucket.is_empty()))
            .unwrap_or(&self.bucket)
    }

    async fn upload_staged(&self, path: &Path, bucket: &str, key: &str, size: u64) -> ObjectStoreResult<PutOutcome> {
        let digest = digest_file(path).await?;
        let body = File::open(path).await?;
        let req = PutRequest {
            bucket,
            key,
            digest: Some(&digest),
            size: Some(size),
        };
        debug!("Uploading: {}", path.display());
        self.timed(self.store.put(&req, Box::pin(body), None)).await
    }

    async fn find_record(&self, oid: &str, file_id: &str) -> DatastreamResult<RelationRecord> {
        self.relations
            .find(oid, file_id)
            .await?
            .ok_or_else(|| {
                error!("Can't find datastream: {}, fileId: {}", oid, file_id);
                DatastreamError::NotFound {
                    oid: oid.to_string(),
                    file_id: file_id.to_string(),
                }
            })
    }
}

#[async_trait]
impl DatastreamProvider for S3Datastreams {
    async fn add(&self, oid: &str, datastream: &Datastream) -> DatastreamResult<RelationRecord> {
        let file_id = datastream.file_id.as_str();
        let path = self.staged_path(file_id)?;
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => {
                error!("File not found: {}", path.display());
                return Err(DatastreamError::FileNotFound(file_id.to_string()));
            }
        };

        let key = self.layout.key(oid, file_id)?;
        let bucket = datastream
            .bucket
            .as_deref()
            .filter(|bucket| !bucket.is_empty())
            .unwrap_or(&self.bucket);
        if !self.readable_bucket(bucket) {
            warn!(
                "Datastream {}/{} goes to bucket `{}`, but reads and removals use `{}` unless useObjectBucketMetadata is set",
                oid, file_id, bucket, self.bucket
            );
        }

        let uploaded = self.upload_staged(&path, bucket, &key, size).await;
        let put = match uploaded {
            Ok(put) => put,
            Err(err) => {
                error!("Failed to upload s3://{}/{}: {}", bucket, key, err);
                if let Some(sync) = &self.sync {
                    error!(
                        "To upload manually, run: {}",
                        sync.command_line(&path, bucket, split_key(&key).0)
                    );
                }
                return Err(DatastreamError::UploadFailed);
            }
        };
        info!("Upload success: {}", key);

        let mut extra = datastream.metadata.clone();
        for reserved in RESERVED_METADATA {
            extra.remove(*reserved);
        }
        let metadata = RelationMetadata {
            file_id: file_id.to_string(),
            bucket: bucket.to_string(),
            key,
            filename: file_id.to_string(),
            digest: Some(put.digest),
            size: put.size,
            source: Provenance::Server,
            cloud_type: CloudType::S3,
            etag: put.etag,
            extra,
        };
        self.relations
            .upsert(oid, None, &metadata)
            .await
            .map_err(|err| {
                error!("Failed to save attachment link: {}, {}: {}", oid, file_id, err);
                DatastreamError::Relation(err)
            })
    }

    async fn get(&self, oid: &str, file_id: &str) -> DatastreamResult<BlobReader> {
        debug!("Finding: {} with fileId: {}", oid, file_id);
        let record = self.find_record(oid, file_id).await?;
        let key = self.layout.key(oid, file_id)?;
        let bucket = self.bucket_of(None, &record);

        self.timed(self.store.get(bucket, &key)).await.map_err(|err| {
            error!("Failed to download datastream {}/{}: {}", oid, file_id, err);
            match err {
                ObjectStoreError::NotFound { .. } => DatastreamError::NotFound {
                    oid: oid.to_string(),
                    file_id: file_id.to_string(),
                },
                _ => DatastreamError::DownloadFailed,
            }
        })
    }

    async fn remove(&self, oid: &str, datastream: &Datastream) -> DatastreamResult<()> {
        let file_id = datastream.file_id.as_str();
        let record = self.find_record(oid, file_id).await?;
        let key = self.layout.key(oid, file_id)?;
        let bucket = self.bucket_of(datastream.bucket.as_deref(), &record);

        match self.timed(self.store.exists(bucket, &key)).await {
            Ok(true) => {}
            Ok(false) => {
                error!("Object not found: s3://{}/{}", bucket, key);
                return Err(DatastreamError::ObjectNotFoundOnDelete {
                    oid: oid.to_string(),
                    file_id: file_id.to_string(),
                });
            }
            Err(err) => {
                error!("Failed to check s3://{}/{}: {}", bucket, key, err);
                return Err(DatastreamError::RemoveFailed);
            }
        }

        debug!("Deleting: s3://{}/{}", bucket, key);
        if let Err(err) = self.timed(self.store.delete(bucket, &key)).await {
            error!("Failed to delete s3://{}/{}: {}", bucket, key, err);
            return Err(DatastreamError::RemoveFailed);
        }
        self.relations.delete(oid, file_id).await.map_err(|err| {
            error!("Failed to delete attachment link: {}, {}: {}", oid, file_id, err);
            DatastreamError::Relation(err)
        })?;
        info!("Removed datastream {}/{}", oid, file_id);
        Ok(())
    }

    async fn list(&self, oid: &str, file_id: Option<&str>) -> DatastreamResult<Vec<AttachmentView>> {
        debug!("Listing attachments of oid: {}", oid);
        let records = self
            .relations
            .list(oid, file_id.filter(|id| !id.is_empty()))
            .await?;
        Ok(records
            .iter()
            .map(|record| AttachmentView::from_record(oid, record))
            .collect())
    }
}

/// Dispatches datastream calls to the provider named by each datastream.
#[derive(Clone)]
pub struct DatastreamService {
    default_cloud_type: CloudType,
    s3: S3Datastreams,
    relations: RelationStore,
    staging_dir: PathBuf,
}

impl DatastreamService {
    pub fn new(cfg: &DatastreamConfig, s3: S3Datastreams, relations: RelationStore) -> Self {
        Self {
            default_cloud_type: cfg.default_cloud_type,
            s3,
            relations,
            staging_dir: cfg.staging_dir.clone(),
        }
    }

    /// Wire the service from the run configuration.
    pub async fn from_config(cfg: &RunConfig) -> Result<Self, RelationError> {
        let relations = RelationStore::connect(
            &cfg.mongodb.target.connection_str,
            &cfg.mongodb.target.collection,
        )
        .await?;
        let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::from_config(&cfg.s3).await);
        let sync = cfg
            .rclone
            .clone()
            .filter(|rclone| rclone.is_configured())
            .map(|rclone| Arc::new(Rclone::new(rclone)) as Arc<dyn ExternalSync>);
        let s3 = S3Datastreams::new(
            store,
            relations.clone(),
            sync,
            KeyLayout::new(cfg.s3.key_prefix.clone()),
            cfg.s3.bucket_name.clone(),
            &cfg.datastream,
            cfg.s3.timeout(),
        );
        Ok(Self::new(&cfg.datastream, s3, relations))
    }

    pub fn relations(&self) -> &RelationStore {
        &self.relations
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    fn provider(&self, cloud_type: Option<&str>) -> DatastreamResult<&dyn DatastreamProvider> {
        let cloud_type = match cloud_type.filter(|tag| !tag.trim().is_empty()) {
            None => self.default_cloud_type,
            Some(tag) => tag.parse::<CloudType>().map_err(|tag| {
                error!("Cloud type unsupported: {}", tag);
                DatastreamError::UnsupportedCloudType(tag)
            })?,
        };
        match cloud_type {
            CloudType::S3 => Ok(&self.s3),
        }
    }

    pub async fn add(&self, oid: &str, datastream: &Datastream) -> DatastreamResult<RelationRecord> {
        self.provider(datastream.cloud_type.as_deref())?
            .add(oid, datastream)
            .await
    }

    pub async fn get(&self, oid: &str, file_id: &str) -> DatastreamResult<BlobReader> {
        self.provider(None)?.get(oid, file_id).await
    }

    pub async fn remove(&self, oid: &str, datastream: &Datastream) -> DatastreamResult<()> {
        self.provider(datastream.cloud_type.as_deref())?
            .remove(oid, datastream)
            .await
    }

    pub async fn list(&self, oid: &str, file_id: Option<&str>) -> DatastreamResult<Vec<AttachmentView>> {
        self.provider(None)?.list(oid, file_id).await
    }

    pub async fn add_many(&self, oid: &str, datastreams: &[Datastream]) -> BatchResponse {
        let mut response = BatchResponse::new();
        self.add_into(&mut response, oid, datastreams).await;
        response
    }

    /// Adds first, then removals. Failures are reported per item and never stop the batch.
    pub async fn add_and_remove_many(
        &self,
        oid: &str,
        add: &[Datastream],
        remove: &[Datastream],
    ) -> BatchResponse {
        let mut response = BatchResponse::new();
        self.add_into(&mut response, oid, add).await;
        for datastream in remove {
            match self.remove(oid, datastream).await {
                Ok(()) => response.record(true, format!("Successfully removed: {}", describe(datastream))),
                Err(err) => response.record(
                    false,
                    format!("Failed to remove: {}, error is:\n{}", describe(datastream), err),
                ),
            }
        }
        response
    }

    /// Sync the difference between two attachment lists of one record.
    pub async fn update(&self, oid: &str, previous: &[Datastream], current: &[Datastream]) -> BatchResponse {
        let (add, remove) = attachment_diff(previous, current);
        debug!(
            "Updating datastreams of {}: {} to add, {} to remove",
            oid,
            add.len(),
            remove.len()
        );
        self.add_and_remove_many(oid, &add, &remove).await
    }

    async fn add_into(&self, response: &mut BatchResponse, oid: &str, datastreams: &[Datastream]) {
        for datastream in datastreams {
            match self.add(oid, datastream).await {
                Ok(_) => response.record(true, format!("Successfully uploaded: {}", describe(datastream))),
                Err(err) => response.record(
                    false,
                    format!("Failed to upload: {}, error is:\n{}", describe(datastream), err),
                ),
            }
        }
    }
}

fn describe(datastream: &Datastream) -> String {
    serde_json::to_string(datastream).unwrap_or_else(|_| datastream.file_id.clone())
}

/// Attachment-typed entries added in `current` and dropped from `previous`, by fileId.
pub fn attachment_diff(previous: &[Datastream], current: &[Datastream]) -> (Vec<Datastream>, Vec<Datastream>) {
    let before: HashSet<&str> = previous.iter().map(|d| d.file_id.as_str()).collect();
    let after: HashSet<&str> = current.iter().map(|d| d.file_id.as_str()).collect();

    let add = current
        .iter()
        .filter(|d| d.is_attachment() && !before.contains(d.file_id.as_str()))
        .cloned()
        .collect();
    let remove = previous
        .iter()
        .filter(|d| d.is_attachment() && !after.contains(d.file_id.as_str()))
        .cloned()
        .collect();
    (add, remove)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryObjectStore, RecordingSync, memory_relations};
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    struct Fixture {
        service: DatastreamService,
        store: Arc<MemoryObjectStore>,
        relations: RelationStore,
        staging: tempfile::TempDir,
    }

    async fn fixture_with(use_object_bucket_metadata: bool) -> Fixture {
        fixture_timed(use_object_bucket_metadata, None).await
    }

    async fn fixture_timed(use_object_bucket_metadata: bool, timeout: Option<Duration>) -> Fixture {
        let staging = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::default());
        let relations = memory_relations().await;
        let cfg = DatastreamConfig {
            staging_dir: staging.path().to_path_buf(),
            default_cloud_type: CloudType::S3,
            use_object_bucket_metadata,
        };
        let s3 = S3Datastreams::new(
            store.clone(),
            relations.clone(),
            Some(Arc::new(RecordingSync::default())),
            KeyLayout::new("attachments"),
            "attachments",
            &cfg,
            timeout,
        );
        Fixture {
            service: DatastreamService::new(&cfg, s3, relations.clone()),
            store,
            relations,
            staging,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(false).await
    }

    impl Fixture {
        fn stage(&self, file_id: &str, data: &[u8]) {
            std::fs::write(self.staging.path().join(file_id), data).unwrap();
        }
    }

    fn attachment(file_id: &str) -> Datastream {
        Datastream {
            kind: Some("attachment".into()),
            ..Datastream::new(file_id)
        }
    }

    #[tokio::test]
    async fn add_uploads_and_records_server_provenance() {
        let fx = fixture().await;
        fx.stage("f1", b"hello");
        let mut datastream = Datastream::new("f1");
        datastream.metadata.insert("name".into(), json!("report.pdf"));
        datastream.metadata.insert("mimeType".into(), json!("application/pdf"));
        datastream.metadata.insert("bucket".into(), json!("ignored"));

        let record = fx.service.add("abc", &datastream).await.unwrap();
        assert_eq!(record.metadata.source, Provenance::Server);
        assert_eq!(record.metadata.key, "attachments/abc/f1");
        assert_eq!(record.metadata.bucket, "attachments");
        assert_eq!(record.metadata.size, 5);
        assert_eq!(
            record.metadata.digest,
            Some(format!("{:x}", md5::compute(b"hello")))
        );
        assert!(record.metadata.etag.is_some());
        assert_eq!(fx.store.object("attachments", "attachments/abc/f1").unwrap(), b"hello");
    }

    #[tokio::test]
    async fn add_honours_bucket_override() {
        let fx = fixture().await;
        fx.stage("f1", b"hello");
        let datastream = Datastream {
            bucket: Some("other".into()),
            ..Datastream::new("f1")
        };
        let record = fx.service.add("abc", &datastream).await.unwrap();
        assert_eq!(record.metadata.bucket, "other");
        assert!(fx.store.object("other", "attachments/abc/f1").is_some());
    }

    #[tokio::test]
    async fn bucket_override_is_readable_only_with_object_bucket_metadata() {
        let fx = fixture().await;
        assert!(fx.service.s3.readable_bucket("attachments"));
        assert!(!fx.service.s3.readable_bucket("other"));
        let fx = fixture_with(true).await;
        assert!(fx.service.s3.readable_bucket("other"));

        let fx = fixture().await;
        fx.stage("f1", b"hello");
        let datastream = Datastream {
            bucket: Some("other".into()),
            ..Datastream::new("f1")
        };
        fx.service.add("abc", &datastream).await.unwrap();
        assert!(matches!(
            fx.service.get("abc", "f1").await,
            Err(DatastreamError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn stalled_store_times_out() {
        let fx = fixture_timed(false, Some(Duration::from_millis(50))).await;
        fx.stage("f1", b"hello");
        fx.service.add("abc", &Datastream::new("f1")).await.unwrap();
        fx.store.stall(true);

        fx.stage("f2", b"world");
        assert!(matches!(
            fx.service.add("abc", &Datastream::new("f2")).await,
            Err(DatastreamError::UploadFailed)
        ));
        assert!(matches!(
            fx.service.get("abc", "f1").await,
            Err(DatastreamError::DownloadFailed)
        ));
        assert!(matches!(
            fx.service.remove("abc", &Datastream::new("f1")).await,
            Err(DatastreamError::RemoveFailed)
        ));
        assert!(fx.relations.find("abc", "f1").await.unwrap().is_some());
        assert!(fx.relations.find("abc", "f2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stalled_store_waits_without_timeout() {
        let fx = fixture().await;
        fx.stage("f1", b"hello");
        fx.store.stall(true);

        let waited = tokio::time::timeout(
            Duration::from_millis(200),
            fx.service.add("abc", &Datastream::new("f1")),
        )
        .await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn add_without_staged_file_fails() {
        let fx = fixture().await;
        let err = fx.service.add("abc", &Datastream::new("missing")).await.unwrap_err();
        assert!(matches!(err, DatastreamError::FileNotFound(ref id) if id == "missing"));
        let err = fx.service.add("abc", &Datastream::new("../etc")).await.unwrap_err();
        assert!(matches!(err, DatastreamError::FileNotFound(_)));
        assert!(fx.relations.find("abc", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_upload_leaves_no_record() {
        let fx = fixture().await;
        fx.stage("f1", b"hello");
        fx.store.fail_next_puts(1);
        let err = fx.service.add("abc", &Datastream::new("f1")).await.unwrap_err();
        assert!(matches!(err, DatastreamError::UploadFailed));
        assert_eq!(err.to_string(), "Failed to upload file, check server logs.");
        assert!(fx.relations.find("abc", "f1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unsupported_provider_fails_fast() {
        let fx = fixture().await;
        fx.stage("f1", b"hello");
        let datastream = Datastream {
            cloud_type: Some("azure".into()),
            ..Datastream::new("f1")
        };
        let err = fx.service.add("abc", &datastream).await.unwrap_err();
        assert!(matches!(err, DatastreamError::UnsupportedCloudType(ref t) if t == "azure"));
        assert!(fx.store.object("attachments", "attachments/abc/f1").is_none());
        assert!(matches!(
            fx.service.remove("abc", &datastream).await,
            Err(DatastreamError::UnsupportedCloudType(_))
        ));
    }

    #[tokio::test]
    async fn get_streams_stored_object() {
        let fx = fixture().await;
        fx.stage("f1", b"hello");
        fx.service.add("abc", &Datastream::new("f1")).await.unwrap();

        let mut reader = fx.service.get("abc", "f1").await.unwrap();
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"hello");

        assert!(matches!(
            fx.service.get("abc", "f2").await,
            Err(DatastreamError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn get_uses_recorded_bucket_when_enabled() {
        let fx = fixture_with(true).await;
        fx.stage("f1", b"hello");
        let datastream = Datastream {
            bucket: Some("other".into()),
            ..Datastream::new("f1")
        };
        fx.service.add("abc", &datastream).await.unwrap();
        assert!(fx.service.get("abc", "f1").await.is_ok());
        fx.service.remove("abc", &Datastream::new("f1")).await.unwrap();
        assert!(fx.store.object("other", "attachments/abc/f1").is_none());
    }

    #[tokio::test]
    async fn remove_deletes_object_and_record() {
        let fx = fixture().await;
        fx.stage("f1", b"hello");
        fx.service.add("abc", &Datastream::new("f1")).await.unwrap();

        fx.service.remove("abc", &Datastream::new("f1")).await.unwrap();
        assert!(fx.store.object("attachments", "attachments/abc/f1").is_none());
        assert!(fx.relations.find("abc", "f1").await.unwrap().is_none());

        assert!(matches!(
            fx.service.remove("abc", &Datastream::new("f1")).await,
            Err(DatastreamError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn remove_of_absent_object_keeps_record() {
        let fx = fixture().await;
        fx.stage("f1", b"hello");
        fx.service.add("abc", &Datastream::new("f1")).await.unwrap();
        fx.store.remove_object("attachments", "attachments/abc/f1");

        let err = fx.service.remove("abc", &Datastream::new("f1")).await.unwrap_err();
        assert!(matches!(err, DatastreamError::ObjectNotFoundOnDelete { .. }));
        assert!(fx.relations.find("abc", "f1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_delete_keeps_record() {
        let fx = fixture().await;
        fx.stage("f1", b"hello");
        fx.service.add("abc", &Datastream::new("f1")).await.unwrap();
        fx.store.fail_deletes(true);

        let err = fx.service.remove("abc", &Datastream::new("f1")).await.unwrap_err();
        assert!(matches!(err, DatastreamError::RemoveFailed));
        assert!(fx.relations.find("abc", "f1").await.unwrap().is_some());
        assert!(fx.store.object("attachments", "attachments/abc/f1").is_some());
    }

    #[tokio::test]
    async fn list_projects_client_view() {
        let fx = fixture().await;
        for (file_id, name) in [("f1", "one.txt"), ("f2", "two.txt")] {
            fx.stage(file_id, file_id.as_bytes());
            let mut datastream = Datastream::new(file_id);
            datastream.metadata.insert("name".into(), json!(name));
            fx.service.add("abc", &datastream).await.unwrap();
        }

        let all = fx.service.list("abc", None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].metadata.name, "one.txt");
        assert_eq!(all[0].redbox_oid, "abc");

        let one = fx.service.list("abc", Some("f2")).await.unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].metadata.name, "two.txt");
        assert!(fx.service.list("xyz", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_many_reports_each_item() {
        let fx = fixture().await;
        fx.stage("f1", b"one");
        let response = fx
            .service
            .add_many("abc", &[Datastream::new("f1"), Datastream::new("f2")])
            .await;
        assert!(!response.success);
        let lines: Vec<&str> = response.message.lines().collect();
        assert!(lines[0].starts_with("Successfully uploaded: "));
        assert!(lines[1].starts_with("Failed to upload: "));
        assert!(fx.relations.find("abc", "f1").await.unwrap().is_some());

        let ok = fx.service.add_many("abc", &[Datastream::new("f1")]).await;
        assert!(ok.success);
    }

    #[tokio::test]
    async fn update_adds_and_removes_attachments() {
        let fx = fixture().await;
        fx.stage("f1", b"one");
        fx.stage("f2", b"two");
        fx.service.add("abc", &attachment("f1")).await.unwrap();

        let response = fx
            .service
            .update("abc", &[attachment("f1")], &[attachment("f2")])
            .await;
        assert!(response.success, "{}", response.message);
        assert!(fx.relations.find("abc", "f1").await.unwrap().is_none());
        assert!(fx.relations.find("abc", "f2").await.unwrap().is_some());
    }

    #[test]
    fn diff_only_considers_attachments() {
        let mut link = Datastream::new("l1");
        link.kind = Some("link".into());
        let previous = vec![attachment("a"), attachment("b"), link.clone()];
        let current = vec![attachment("b"), attachment("c")];

        let (add, remove) = attachment_diff(&previous, &current);
        assert_eq!(add, vec![attachment("c")]);
        assert_eq!(remove, vec![attachment("a")]);

        let (add, remove) = attachment_diff(&[], &[link]);
        assert!(add.is_empty() && remove.is_empty());
    }
}
