use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::models::relation::CloudType;

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Blob migration and datastream sync for S3-compatible stores")]
pub struct Args {
    /// Path to the JSON run configuration
    pub config: Option<PathBuf>,

    /// Serve the live datastream API instead of running a batch migration
    #[arg(long)]
    pub serve: bool,

    /// Host to bind to when serving (overrides BLOB_SYNC_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to when serving (overrides BLOB_SYNC_PORT)
    #[arg(long)]
    pub port: Option<u16>,
}

/// Listener settings for `--serve`, merged from CLI args and environment.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub host: String,
    pub port: u16,
}

impl ServeConfig {
    pub fn from_env_and_args(args: &Args) -> Result<Self> {
        let env_host = env::var("BLOB_SYNC_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("BLOB_SYNC_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing BLOB_SYNC_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading BLOB_SYNC_PORT"),
        };

        Ok(Self {
            host: args.host.clone().unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The run configuration file, read once at startup and handed to each
/// component constructor.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub mongodb: StoresConfig,
    pub s3: S3Config,
    #[serde(default)]
    pub rclone: Option<RcloneConfig>,
    #[serde(default)]
    pub datastream: DatastreamConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct StoresConfig {
    pub source: SourceConfig,
    pub target: TargetConfig,
}

/// The legacy chunked bucket the migration reads from.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    pub connection_str: String,
    pub db_name: String,
    /// Filter over the bucket's file documents.
    #[serde(default)]
    pub query: Map<String, Value>,
    #[serde(default = "default_source_bucket")]
    pub bucket_name: String,
    /// Dump utility used when the driver cannot download a file.
    #[serde(default = "default_dump_tool")]
    pub dump_tool: String,
}

/// The relation side-table the migration and live service write to.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    /// SQL database URL, e.g. `sqlite://./data/attachments.db`.
    pub connection_str: String,
    #[serde(default)]
    pub db_name: Option<String>,
    pub collection: String,
    pub temp_dir: PathBuf,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct S3Config {
    pub bucket_name: String,
    #[serde(default)]
    pub key_prefix: String,
    #[serde(default)]
    pub client_config: S3ClientConfig,
    #[serde(default)]
    pub skip_uploaded: bool,
    #[serde(default, rename = "logS3UploadProgress")]
    pub log_upload_progress: bool,
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
    /// Upper bound for each network or subprocess step. Absent means no timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl S3Config {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct S3ClientConfig {
    pub region: Option<String>,
    pub endpoint: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct RcloneConfig {
    #[serde(default)]
    pub config_path: String,
    #[serde(default)]
    pub remote_name: String,
    #[serde(default = "default_rclone_binary")]
    pub binary: String,
}

impl RcloneConfig {
    pub fn is_configured(&self) -> bool {
        !self.config_path.trim().is_empty() && !self.remote_name.trim().is_empty()
    }
}

/// Live service settings.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DatastreamConfig {
    /// Where a prior upload step leaves files, named by fileId.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    #[serde(default = "default_cloud_type")]
    pub default_cloud_type: CloudType,
    /// Use the bucket stored in the relation record for get/remove.
    #[serde(default)]
    pub use_object_bucket_metadata: bool,
}

impl Default for DatastreamConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            default_cloud_type: default_cloud_type(),
            use_object_bucket_metadata: false,
        }
    }
}

fn default_source_bucket() -> String {
    "fs".into()
}

fn default_dump_tool() -> String {
    "mongofiles".into()
}

fn default_part_size() -> usize {
    8 * 1024 * 1024
}

fn default_rclone_binary() -> String {
    "rclone".into()
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("/attachments/staging")
}

fn default_cloud_type() -> CloudType {
    CloudType::S3
}

impl RunConfig {
    /// Read and parse the configuration file.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}
