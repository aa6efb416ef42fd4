//! Read access to the legacy chunked-file bucket.
//!
//! The migration only ever reads from the source: it walks a filtered
//! cursor over the bucket's file documents, asks the server for a
//! whole-file digest, and pulls bytes either as a live stream or into a
//! local staging file. [`GridFsSource`] implements this against a MongoDB
//! GridFS bucket; tests use an in-memory implementation.

use crate::{config::SourceConfig, models::source::SourceObject};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use mongodb::{
    Client, Database,
    bson::{Bson, Document, doc, oid::ObjectId},
    gridfs::{FilesCollectionDocument, GridFsBucket},
    options::GridFsBucketOptions,
};
use serde_json::{Map, Value};
use std::{io, path::Path, pin::Pin};
use thiserror::Error;
use tokio::{fs::File, io::AsyncRead, process::Command};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, warn};

/// A readable byte source handed to the object store.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Cursor over the selected source records, in server order.
pub type SourceCursor = BoxStream<'static, Result<SourceObject, SourceError>>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot connect to source store: {0}")]
    Connect(String),
    #[error("invalid source query: {0}")]
    InvalidQuery(String),
    #[error("source query failed: {0}")]
    Query(String),
    #[error("inline digest unavailable for `{id}`: {reason}")]
    DigestUnavailable { id: String, reason: String },
    #[error("cannot download `{id}`: {reason}")]
    Download { id: String, reason: String },
    #[error("source operation timed out")]
    TimedOut,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Open a cursor over all records matching `query`.
    async fn find(&self, query: &Map<String, Value>) -> Result<SourceCursor, SourceError>;

    /// Stream the object's bytes straight from the store, by legacy filename.
    async fn open_stream(&self, object: &SourceObject) -> Result<BlobReader, SourceError>;

    /// Ask the server for a precomputed MD5 of the whole object.
    async fn inline_digest(&self, object: &SourceObject) -> Result<String, SourceError>;

    /// Download the whole object to `dest`.
    async fn stage(&self, object: &SourceObject, dest: &Path) -> Result<(), SourceError>;

    async fn close(&self) {}
}

/// MongoDB GridFS bucket as the source store.
pub struct GridFsSource {
    client: Client,
    db: Database,
    bucket: GridFsBucket,
    cfg: SourceConfig,
}

impl GridFsSource {
    /// Connect and verify the server answers before any item is read.
    pub async fn connect(cfg: &SourceConfig) -> Result<Self, SourceError> {
        debug!("Connecting to source db {}", cfg.db_name);
        let client = Client::with_uri_str(&cfg.connection_str)
            .await
            .map_err(|err| SourceError::Connect(err.to_string()))?;
        let db = client.database(&cfg.db_name);
        db.run_command(doc! { "ping": 1 })
            .await
            .map_err(|err| SourceError::Connect(err.to_string()))?;

        let mut options = GridFsBucketOptions::default();
        options.bucket_name = Some(cfg.bucket_name.clone());
        let bucket = db.gridfs_bucket(options);

        Ok(Self {
            client,
            db,
            bucket,
            cfg: cfg.clone(),
        })
    }

    /// Download through the external dump utility.
    async fn stage_with_dump_tool(&self, object: &SourceObject, dest: &Path) -> Result<(), SourceError> {
        dump_to_file(&self.cfg, &object.id, dest).await
    }

    async fn stage_with_driver(&self, object: &SourceObject, dest: &Path) -> Result<(), SourceError> {
        let stream = self
            .bucket
            .open_download_stream(object_id(&object.id))
            .await
            .map_err(|err| SourceError::Download {
                id: object.id.clone(),
                reason: err.to_string(),
            })?;
        let mut reader = stream.compat();
        let mut file = File::create(dest).await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl SourceStore for GridFsSource {
    async fn find(&self, query: &Map<String, Value>) -> Result<SourceCursor, SourceError> {
        let filter = match Bson::try_from(Value::Object(query.clone())) {
            Ok(Bson::Document(filter)) => filter,
            Ok(other) => return Err(SourceError::InvalidQuery(other.to_string())),
            Err(err) => return Err(SourceError::InvalidQuery(err.to_string())),
        };
        let cursor = self
            .bucket
            .find(filter)
            .await
            .map_err(|err| SourceError::Query(err.to_string()))?;

        Ok(cursor
            .map_err(|err| SourceError::Query(err.to_string()))
            .map_ok(source_object)
            .boxed())
    }

    async fn open_stream(&self, object: &SourceObject) -> Result<BlobReader, SourceError> {
        let stream = self
            .bucket
            .open_download_stream_by_name(&object.filename)
            .await
            .map_err(|err| SourceError::Download {
                id: object.id.clone(),
                reason: err.to_string(),
            })?;
        Ok(Box::pin(stream.compat()))
    }

    async fn inline_digest(&self, object: &SourceObject) -> Result<String, SourceError> {
        if let Some(md5) = object.md5.as_deref().filter(|md5| !md5.is_empty()) {
            return Ok(md5.to_string());
        }
        let reply = self
            .db
            .run_command(doc! { "filemd5": object_id(&object.id), "root": self.cfg.bucket_name.as_str() })
            .await
            .map_err(|err| SourceError::DigestUnavailable {
                id: object.id.clone(),
                reason: err.to_string(),
            })?;
        reply
            .get_str("md5")
            .map(str::to_string)
            .map_err(|err| SourceError::DigestUnavailable {
                id: object.id.clone(),
                reason: err.to_string(),
            })
    }

    async fn stage(&self, object: &SourceObject, dest: &Path) -> Result<(), SourceError> {
        match self.stage_with_driver(object, dest).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(
                    "Driver download of `{}` failed ({}), trying {}",
                    object.id, err, self.cfg.dump_tool
                );
                self.stage_with_dump_tool(object, dest).await
            }
        }
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
    }
}

/// Internal ids are hex ObjectIds on every server we migrate from, but
/// hand-inserted files may use plain strings.
fn object_id(id: &str) -> Bson {
    match ObjectId::parse_str(id) {
        Ok(oid) => Bson::ObjectId(oid),
        Err(_) => Bson::String(id.to_string()),
    }
}

fn source_object(file: FilesCollectionDocument) -> SourceObject {
    let id = match &file.id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    };
    let metadata = file.metadata.map(document_to_map).unwrap_or_default();
    let oid = ["redboxOid", "oid"]
        .iter()
        .find_map(|field| metadata.get(*field).and_then(Value::as_str))
        .map(str::to_string);
    let file_id = metadata
        .get("fileId")
        .and_then(Value::as_str)
        .map(str::to_string);

    SourceObject {
        id,
        oid,
        file_id,
        filename: file.filename.unwrap_or_default(),
        length: file.length,
        md5: None,
        upload_date: chrono::DateTime::from_timestamp_millis(file.upload_date.timestamp_millis()),
        metadata,
    }
}

fn document_to_map(document: Document) -> Map<String, Value> {
    match Bson::Document(document).into_relaxed_extjson() {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// `{dump_tool} --uri=.. -d <db> [--prefix=<bucket>] get_id <id> -l=<dest>`.
///
/// The child is killed if the returned future is dropped before it exits.
async fn dump_to_file(cfg: &SourceConfig, id: &str, dest: &Path) -> Result<(), SourceError> {
    let selector = object_id(id).into_relaxed_extjson().to_string();
    let mut command = Command::new(&cfg.dump_tool);
    command
        .arg(format!("--uri={}", cfg.connection_str))
        .arg("-d")
        .arg(&cfg.db_name);
    if cfg.bucket_name != "fs" {
        command.arg(format!("--prefix={}", cfg.bucket_name));
    }
    command
        .arg("get_id")
        .arg(&selector)
        .arg(format!("-l={}", dest.display()))
        .kill_on_drop(true);

    debug!("Running {} get_id {}", cfg.dump_tool, selector);
    let output = command.output().await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(SourceError::Download {
            id: id.to_string(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
