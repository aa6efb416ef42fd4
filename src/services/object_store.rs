//! Destination object store (S3-compatible).
//!
//! Uploads read the body in fixed-size parts. A body that fits in one part
//! goes out as a single `PutObject` carrying `Content-MD5`; anything larger
//! becomes a multipart upload with per-part `Content-MD5`, and the
//! whole-object digest is checked before the upload is completed. Failed
//! multipart uploads are aborted so no orphaned parts are left behind.

use crate::{
    config::S3Config,
    services::{checksum::content_md5, source_store::BlobReader},
};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{
    Client,
    config::{Credentials, StalledStreamProtectionConfig},
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
};
use md5::Context;
use std::{io, sync::Arc};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("failed to upload s3://{bucket}/{key}: {source}")]
    Upload {
        bucket: String,
        key: String,
        source: BoxError,
    },
    #[error("failed to download s3://{bucket}/{key}: {source}")]
    Download {
        bucket: String,
        key: String,
        source: BoxError,
    },
    #[error("failed to head s3://{bucket}/{key}: {source}")]
    Head {
        bucket: String,
        key: String,
        source: BoxError,
    },
    #[error("failed to delete s3://{bucket}/{key}: {source}")]
    Delete {
        bucket: String,
        key: String,
        source: BoxError,
    },
    #[error("object s3://{bucket}/{key} not found")]
    NotFound { bucket: String, key: String },
    #[error("digest mismatch for `{key}`: expected {expected}, sent {actual}")]
    DigestMismatch {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("object store operation timed out")]
    TimedOut,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

/// Where and what to upload.
#[derive(Clone, Debug)]
pub struct PutRequest<'a> {
    pub bucket: &'a str,
    pub key: &'a str,
    /// Expected MD5 hex digest of the body, verified before the upload completes.
    pub digest: Option<&'a str>,
    /// Expected size, reported to progress callbacks.
    pub size: Option<u64>,
}

/// What a successful upload produced.
#[derive(Clone, Debug, PartialEq)]
pub struct PutOutcome {
    pub etag: Option<String>,
    pub size: u64,
    /// MD5 hex digest of the bytes actually sent.
    pub digest: String,
}

#[derive(Clone, Debug)]
pub struct UploadProgress {
    pub key: String,
    pub loaded: u64,
    pub total: Option<u64>,
    pub part: i32,
}

/// Progress callback supplied by the caller of an upload.
pub type ProgressFn = Arc<dyn Fn(&UploadProgress) + Send + Sync>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        req: &PutRequest<'_>,
        body: BlobReader,
        progress: Option<ProgressFn>,
    ) -> ObjectStoreResult<PutOutcome>;

    /// Fetch the object. Missing objects yield [`ObjectStoreError::NotFound`].
    async fn get(&self, bucket: &str, key: &str) -> ObjectStoreResult<BlobReader>;

    async fn exists(&self, bucket: &str, key: &str) -> ObjectStoreResult<bool>;

    async fn delete(&self, bucket: &str, key: &str) -> ObjectStoreResult<()>;
}

/// [`ObjectStore`] backed by the AWS SDK; works with any S3-compatible endpoint.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    part_size: usize,
}

/// S3 rejects multipart parts below 5 MiB (except the last one).
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

impl S3ObjectStore {
    pub fn new(client: Client, part_size: usize) -> Self {
        Self {
            client,
            part_size: part_size.max(MIN_PART_SIZE),
        }
    }

    /// Build a client from the run configuration, falling back to the
    /// standard AWS environment for anything it leaves unset.
    pub async fn from_config(cfg: &S3Config) -> Self {
        let client_cfg = &cfg.client_config;
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &client_cfg.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let (Some(access_key), Some(secret_key)) =
            (&client_cfg.access_key_id, &client_cfg.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "run-config",
            ));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(client_cfg.force_path_style)
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled());
        if let Some(endpoint) = &client_cfg.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Self::new(Client::from_conf(builder.build()), cfg.part_size_bytes)
    }

    async fn put_single(&self, req: &PutRequest<'_>, data: Vec<u8>, digest: String) -> ObjectStoreResult<PutOutcome> {
        let size = data.len() as u64;
        let mut put = self
            .client
            .put_object()
            .bucket(req.bucket)
            .key(req.key)
            .content_length(size as i64)
            .body(ByteStream::from(data));
        if let Some(md5) = content_md5(&digest) {
            put = put.content_md5(md5);
        }
        let output = put.send().await.map_err(|e| upload_error(req, e))?;

        Ok(PutOutcome {
            etag: output.e_tag().map(str::to_string),
            size,
            digest,
        })
    }

    /// Upload every part, returning the completed part list, total size and digest.
    async fn upload_parts(
        &self,
        req: &PutRequest<'_>,
        upload_id: &str,
        first: Vec<u8>,
        body: &mut BlobReader,
        progress: Option<&ProgressFn>,
    ) -> ObjectStoreResult<(Vec<CompletedPart>, u64, String)> {
        let mut whole = Context::new();
        let mut parts = Vec::new();
        let mut loaded: u64 = 0;
        let mut part_number: i32 = 1;
        let mut chunk = first;

        while !chunk.is_empty() {
            whole.consume(&chunk);
            loaded += chunk.len() as u64;
            let part_md5 = format!("{:x}", md5::compute(&chunk));

            let mut upload = self
                .client
                .upload_part()
                .bucket(req.bucket)
                .key(req.key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk));
            if let Some(md5) = content_md5(&part_md5) {
                upload = upload.content_md5(md5);
            }
            let output = upload.send().await.map_err(|e| upload_error(req, e))?;
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            report(progress, req, loaded, part_number);

            part_number += 1;
            chunk = read_part(body, self.part_size).await?;
        }

        Ok((parts, loaded, format!("{:x}", whole.compute())))
    }

    async fn put_multipart(
        &self,
        req: &PutRequest<'_>,
        first: Vec<u8>,
        mut body: BlobReader,
        progress: Option<&ProgressFn>,
    ) -> ObjectStoreResult<PutOutcome> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(req.bucket)
            .key(req.key)
            .send()
            .await
            .map_err(|e| upload_error(req, e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| upload_error(req, "missing upload id"))?
            .to_string();

        let uploaded = self
            .upload_parts(req, &upload_id, first, &mut body, progress)
            .await
            .and_then(|(parts, size, digest)| {
                verify_digest(req, &digest)?;
                Ok((parts, size, digest))
            });
        let (parts, size, digest) = match uploaded {
            Ok(done) => done,
            Err(err) => {
                self.abort(req, &upload_id).await;
                return Err(err);
            }
        };

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(req.bucket)
            .key(req.key)
            .upload_id(&upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await;
        match output {
            Ok(output) => Ok(PutOutcome {
                etag: output.e_tag().map(str::to_string),
                size,
                digest,
            }),
            Err(err) => {
                self.abort(req, &upload_id).await;
                Err(upload_error(req, err))
            }
        }
    }

    async fn abort(&self, req: &PutRequest<'_>, upload_id: &str) {
        if let Err(err) = self
            .client
            .abort_multipart_upload()
            .bucket(req.bucket)
            .key(req.key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!("failed to abort multipart upload of {}: {}", req.key, err);
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        req: &PutRequest<'_>,
        mut body: BlobReader,
        progress: Option<ProgressFn>,
    ) -> ObjectStoreResult<PutOutcome> {
        debug!("Uploading s3://{}/{}", req.bucket, req.key);
        let first = read_part(&mut body, self.part_size).await?;

        if first.len() < self.part_size {
            let digest = format!("{:x}", md5::compute(&first));
            verify_digest(req, &digest)?;
            let outcome = self.put_single(req, first, digest).await?;
            report(progress.as_ref(), req, outcome.size, 1);
            return Ok(outcome);
        }

        self.put_multipart(req, first, body, progress.as_ref()).await
    }

    async fn get(&self, bucket: &str, key: &str) -> ObjectStoreResult<BlobReader> {
        debug!("Downloading s3://{}/{}", bucket, key);
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .is_some_and(aws_sdk_s3::operation::get_object::GetObjectError::is_no_such_key)
                {
                    ObjectStoreError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    ObjectStoreError::Download {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                        source: Box::new(err),
                    }
                }
            })?;
        Ok(Box::pin(output.body.into_async_read()))
    }

    async fn exists(&self, bucket: &str, key: &str) -> ObjectStoreResult<bool> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(aws_sdk_s3::operation::head_object::HeadObjectError::is_not_found)
                {
                    return Ok(false);
                }
                Err(ObjectStoreError::Head {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    source: Box::new(err),
                })
            }
        }
    }

    async fn delete(&self, bucket: &str, key: &str) -> ObjectStoreResult<()> {
        debug!("Deleting s3://{}/{}", bucket, key);
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Delete {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: Box::new(e),
            })?;
        Ok(())
    }
}

fn upload_error(req: &PutRequest<'_>, source: impl Into<BoxError>) -> ObjectStoreError {
    ObjectStoreError::Upload {
        bucket: req.bucket.to_string(),
        key: req.key.to_string(),
        source: source.into(),
    }
}

fn report(progress: Option<&ProgressFn>, req: &PutRequest<'_>, loaded: u64, part: i32) {
    if let Some(progress) = progress {
        progress(&UploadProgress {
            key: req.key.to_string(),
            loaded,
            total: req.size,
            part,
        });
    }
}

/// Compare the digest of the bytes sent with the expected one, if any.
pub fn verify_digest(req: &PutRequest<'_>, actual: &str) -> ObjectStoreResult<()> {
    match req.digest {
        Some(expected) if !expected.eq_ignore_ascii_case(actual) => Err(ObjectStoreError::DigestMismatch {
            key: req.key.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Read up to `size` bytes; a short result means the body is exhausted.
pub async fn read_part(body: &mut BlobReader, size: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(size);
    body.as_mut().take(size as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}
