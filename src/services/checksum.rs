//! Source digests and local staging files.
//!
//! Both strategies yield the MD5 hex digest of the full object, so a digest
//! resolved inline and one computed from staged bytes are interchangeable
//! for integrity headers and skip comparisons.

use crate::{
    models::source::SourceObject,
    services::{
        bounded,
        source_store::{SourceError, SourceStore},
    },
};
use md5::Context;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{fs::File, io::AsyncReadExt};
use tracing::debug;
use uuid::Uuid;

const READ_BUFFER_SIZE: usize = 256 * 1024;

/// A file downloaded into the staging directory.
///
/// Each staged file lives in its own `{temp_dir}/{uuid}/` directory and is
/// named after the last segment of its key, so external tools copying it
/// into the key's directory land on the key.
/// Both are removed when the value is dropped, on every exit path.
#[derive(Debug)]
pub struct StagedFile {
    dir: PathBuf,
    path: PathBuf,
}

impl StagedFile {
    pub async fn allocate(temp_root: &Path, file_name: &str) -> io::Result<Self> {
        let dir = temp_root.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir).await?;
        let name = Path::new(file_name)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("blob"));
        let path = dir.join(name);
        Ok(Self { dir, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("removed staged file {}", self.path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => debug!("failed to remove staged file {}: {}", self.path.display(), err),
        }
        let _ = std::fs::remove_dir(&self.dir);
    }
}

/// How the digest of a source object was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DigestStrategy {
    /// Precomputed by the source server; no bytes moved.
    Inline,
    /// Computed from a local staged copy.
    Staged,
}

#[derive(Debug)]
pub struct ResolvedDigest {
    pub digest: String,
    pub strategy: DigestStrategy,
    /// The staged copy, present iff `strategy` is `Staged`.
    pub staged: Option<StagedFile>,
}

/// Resolves content digests for source objects.
#[derive(Clone)]
pub struct ChecksumResolver {
    source: Arc<dyn SourceStore>,
    temp_dir: PathBuf,
    timeout: Option<Duration>,
}

impl ChecksumResolver {
    pub fn new(source: Arc<dyn SourceStore>, temp_dir: impl Into<PathBuf>, timeout: Option<Duration>) -> Self {
        Self {
            source,
            temp_dir: temp_dir.into(),
            timeout,
        }
    }

    /// Inline digest when the server can provide one, otherwise stage and hash.
    pub async fn resolve(&self, object: &SourceObject, file_name: &str) -> Result<ResolvedDigest, SourceError> {
        let inline = bounded(self.timeout, self.source.inline_digest(object))
            .await
            .unwrap_or(Err(SourceError::TimedOut));
        match inline {
            Ok(digest) => Ok(ResolvedDigest {
                digest,
                strategy: DigestStrategy::Inline,
                staged: None,
            }),
            Err(err) => {
                debug!("Inline digest for `{}` unavailable ({}), staging", object.filename, err);
                let staged = self.stage(object, file_name).await?;
                let digest = digest_file(staged.path()).await?;
                Ok(ResolvedDigest {
                    digest,
                    strategy: DigestStrategy::Staged,
                    staged: Some(staged),
                })
            }
        }
    }

    /// Download `object` into a fresh staging file.
    pub async fn stage(&self, object: &SourceObject, file_name: &str) -> Result<StagedFile, SourceError> {
        let staged = StagedFile::allocate(&self.temp_dir, file_name).await?;
        bounded(self.timeout, self.source.stage(object, staged.path()))
            .await
            .unwrap_or(Err(SourceError::TimedOut))?;
        Ok(staged)
    }
}

/// MD5 hex digest of a local file, streamed in fixed-size chunks.
pub async fn digest_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path).await?;
    let mut context = Context::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        context.consume(&buffer[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}

/// Convert an MD5 hex digest into the base64 form of a `Content-MD5` header.
pub fn content_md5(hex_digest: &str) -> Option<String> {
    use base64::{Engine as _, engine::general_purpose};

    let raw = hex::decode(hex_digest).ok()?;
    (raw.len() == 16).then(|| general_purpose::STANDARD.encode(raw))
}
