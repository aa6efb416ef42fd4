//! In-memory stand-ins for the source store, object store and sync tool.

use crate::{
    config::{
        DatastreamConfig, RcloneConfig, RunConfig, S3ClientConfig, S3Config, SourceConfig,
        StoresConfig, TargetConfig,
    },
    models::{
        relation::{CloudType, Provenance, RelationMetadata},
        source::SourceObject,
    },
    services::{
        external_sync::{ExternalSync, SyncToolError},
        object_store::{
            ObjectStore, ObjectStoreError, ObjectStoreResult, ProgressFn, PutOutcome, PutRequest,
            UploadProgress, verify_digest,
        },
        relation_store::RelationStore,
        source_store::{BlobReader, SourceCursor, SourceError, SourceStore},
    },
};
use async_trait::async_trait;
use chrono::Utc;
use futures::{StreamExt, stream};
use serde_json::{Map, Value, json};
use sqlx::sqlite::SqlitePoolOptions;
use std::{
    collections::HashMap,
    io::Cursor,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

/// A source record for `{oid}/{file_id}` with the given content.
pub fn source_object(oid: &str, file_id: &str, data: &[u8]) -> (SourceObject, Vec<u8>) {
    let mut metadata = Map::new();
    metadata.insert("redboxOid".into(), json!(oid));
    metadata.insert("fileId".into(), json!(file_id));
    let object = SourceObject {
        id: Uuid::new_v4().simple().to_string(),
        oid: Some(oid.to_string()),
        file_id: Some(file_id.to_string()),
        filename: format!("{}/{}", oid, file_id),
        length: data.len() as u64,
        md5: None,
        upload_date: Some(Utc::now()),
        metadata,
    };
    (object, data.to_vec())
}

struct SourceEntry {
    object: SourceObject,
    data: Vec<u8>,
    digest: Option<String>,
}

#[derive(Default)]
pub struct MemorySource {
    entries: Mutex<Vec<SourceEntry>>,
    fail_streams: AtomicBool,
    fail_stage: AtomicBool,
    stall_cursor: AtomicBool,
    stage_calls: AtomicUsize,
}

impl MemorySource {
    /// Add a record. `digest` is what the server reports inline; `None` means it cannot.
    pub fn insert(&self, (mut object, data): (SourceObject, Vec<u8>), digest: Option<&str>) -> SourceObject {
        object.length = data.len() as u64;
        self.entries.lock().unwrap().push(SourceEntry {
            object: object.clone(),
            data,
            digest: digest.map(str::to_string),
        });
        object
    }

    /// Swap the bytes of a stored record, keeping an inline digest consistent.
    pub fn replace_content(&self, id: &str, data: &[u8]) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.iter_mut().find(|e| e.object.id == id).unwrap();
        entry.object.length = data.len() as u64;
        entry.data = data.to_vec();
        if entry.digest.is_some() {
            entry.digest = Some(format!("{:x}", md5::compute(data)));
        }
    }

    pub fn fail_streams(&self, fail: bool) {
        self.fail_streams.store(fail, Ordering::SeqCst);
    }

    pub fn fail_stage(&self, fail: bool) {
        self.fail_stage.store(fail, Ordering::SeqCst);
    }

    /// Keep the cursor open after the last record, never yielding again.
    pub fn stall_cursor(&self, stall: bool) {
        self.stall_cursor.store(stall, Ordering::SeqCst);
    }

    pub fn stage_calls(&self) -> usize {
        self.stage_calls.load(Ordering::SeqCst)
    }

    fn data(&self, object: &SourceObject) -> Result<Vec<u8>, SourceError> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.object.id == object.id)
            .map(|e| e.data.clone())
            .ok_or_else(|| SourceError::Download {
                id: object.id.clone(),
                reason: "no such file".into(),
            })
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn find(&self, _query: &Map<String, Value>) -> Result<SourceCursor, SourceError> {
        let objects: Vec<_> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| Ok(e.object.clone()))
            .collect();
        if self.stall_cursor.load(Ordering::SeqCst) {
            return Ok(stream::iter(objects).chain(stream::pending()).boxed());
        }
        Ok(stream::iter(objects).boxed())
    }

    async fn open_stream(&self, object: &SourceObject) -> Result<BlobReader, SourceError> {
        if self.fail_streams.load(Ordering::SeqCst) {
            return Err(SourceError::Download {
                id: object.id.clone(),
                reason: "stream refused".into(),
            });
        }
        Ok(Box::pin(Cursor::new(self.data(object)?)))
    }

    async fn inline_digest(&self, object: &SourceObject) -> Result<String, SourceError> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.object.id == object.id)
            .and_then(|e| e.digest.clone())
            .ok_or_else(|| SourceError::DigestUnavailable {
                id: object.id.clone(),
                reason: "filemd5 unsupported".into(),
            })
    }

    async fn stage(&self, object: &SourceObject, dest: &Path) -> Result<(), SourceError> {
        self.stage_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_stage.load(Ordering::SeqCst) {
            return Err(SourceError::Download {
                id: object.id.clone(),
                reason: "dump tool failed".into(),
            });
        }
        let data = self.data(object)?;
        tokio::fs::write(dest, data).await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    put_calls: AtomicUsize,
    failing_puts: AtomicUsize,
    fail_deletes: AtomicBool,
    stalled: AtomicBool,
}

impl MemoryObjectStore {
    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn remove_object(&self, bucket: &str, key: &str) {
        self.objects
            .lock()
            .unwrap()
            .remove(&(bucket.to_string(), key.to_string()));
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    /// Reject the next `n` uploads.
    pub fn fail_next_puts(&self, n: usize) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Make every call hang until the caller gives up.
    pub fn stall(&self, stall: bool) {
        self.stalled.store(stall, Ordering::SeqCst);
    }

    async fn hang_if_stalled(&self) {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        req: &PutRequest<'_>,
        mut body: BlobReader,
        progress: Option<ProgressFn>,
    ) -> ObjectStoreResult<PutOutcome> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.hang_if_stalled().await;
        let rejected = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(ObjectStoreError::Upload {
                bucket: req.bucket.to_string(),
                key: req.key.to_string(),
                source: "503 Slow Down".into(),
            });
        }

        let mut data = Vec::new();
        body.read_to_end(&mut data).await?;
        let digest = format!("{:x}", md5::compute(&data));
        verify_digest(req, &digest)?;
        if let Some(progress) = progress {
            progress(&UploadProgress {
                key: req.key.to_string(),
                loaded: data.len() as u64,
                total: req.size,
                part: 1,
            });
        }

        let size = data.len() as u64;
        self.objects
            .lock()
            .unwrap()
            .insert((req.bucket.to_string(), req.key.to_string()), data);
        Ok(PutOutcome {
            etag: Some(format!("\"{}\"", digest)),
            size,
            digest,
        })
    }

    async fn get(&self, bucket: &str, key: &str) -> ObjectStoreResult<BlobReader> {
        self.hang_if_stalled().await;
        self.object(bucket, key)
            .map(|data| Box::pin(Cursor::new(data)) as BlobReader)
            .ok_or_else(|| ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn exists(&self, bucket: &str, key: &str) -> ObjectStoreResult<bool> {
        self.hang_if_stalled().await;
        Ok(self.object(bucket, key).is_some())
    }

    async fn delete(&self, bucket: &str, key: &str) -> ObjectStoreResult<()> {
        self.hang_if_stalled().await;
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Delete {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: "403 Forbidden".into(),
            });
        }
        self.remove_object(bucket, key);
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct SyncCall {
    pub path: PathBuf,
    pub bucket: String,
    pub dest_dir: String,
    /// Whether the local file existed when the tool was invoked.
    pub existed: bool,
}

#[derive(Default)]
pub struct RecordingSync {
    calls: Mutex<Vec<SyncCall>>,
    fail: AtomicBool,
}

impl RecordingSync {
    pub fn calls(&self) -> Vec<SyncCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExternalSync for RecordingSync {
    async fn copy(&self, local: &Path, bucket: &str, dest_dir: &str) -> Result<(), SyncToolError> {
        self.calls.lock().unwrap().push(SyncCall {
            path: local.to_path_buf(),
            bucket: bucket.to_string(),
            dest_dir: dest_dir.to_string(),
            existed: local.exists(),
        });
        if self.fail.load(Ordering::SeqCst) {
            return Err(SyncToolError::Failed {
                status: "exit status: 1".into(),
                stderr: "remote unreachable".into(),
            });
        }
        Ok(())
    }

    fn command_line(&self, local: &Path, bucket: &str, dest_dir: &str) -> String {
        format!("rclone copy {} remote:{}/{}", local.display(), bucket, dest_dir)
    }
}

/// A relation store over a private in-memory SQLite database.
pub async fn memory_relations() -> RelationStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = RelationStore::new(Arc::new(pool), "cloudattachment").unwrap();
    store.ensure_schema().await.unwrap();
    store
}

pub fn relation_metadata(file_id: &str, size: u64, digest: Option<&str>) -> RelationMetadata {
    RelationMetadata {
        file_id: file_id.to_string(),
        bucket: "attachments".into(),
        key: format!("attachments/abc/{}", file_id),
        filename: file_id.to_string(),
        digest: digest.map(str::to_string),
        size,
        source: Provenance::Migration,
        cloud_type: CloudType::S3,
        etag: None,
        extra: Map::new(),
    }
}

/// A run configuration staging into `temp_dir`, with the sync tool configured.
pub fn run_config(temp_dir: &Path) -> RunConfig {
    RunConfig {
        mongodb: StoresConfig {
            source: SourceConfig {
                connection_str: "mongodb://localhost:27017".into(),
                db_name: "redbox".into(),
                query: Map::new(),
                bucket_name: "fs".into(),
                dump_tool: "mongofiles".into(),
            },
            target: TargetConfig {
                connection_str: "sqlite::memory:".into(),
                db_name: None,
                collection: "cloudattachment".into(),
                temp_dir: temp_dir.to_path_buf(),
            },
        },
        s3: S3Config {
            bucket_name: "attachments".into(),
            key_prefix: "attachments".into(),
            client_config: S3ClientConfig::default(),
            skip_uploaded: true,
            log_upload_progress: true,
            part_size_bytes: 8 * 1024 * 1024,
            timeout_secs: None,
        },
        rclone: Some(RcloneConfig {
            config_path: "/etc/rclone.conf".into(),
            remote_name: "s3remote".into(),
            binary: "rclone".into(),
        }),
        datastream: DatastreamConfig::default(),
    }
}

/// An executable that ignores its arguments, sleeps a second, then creates `marker`.
#[cfg(unix)]
pub fn slow_tool(dir: &Path, marker: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("slow-tool.sh");
    std::fs::write(
        &path,
        format!("#!/bin/sh\nsleep 1\ntouch '{}'\n", marker.display()),
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
