//! Engine components, leaf-first: key layout, source and destination
//! stores, digests, the relation side-table, the tiered transfer engine,
//! and the two drivers built on them (batch migrator, live datastreams).

pub mod checksum;
pub mod datastream_service;
pub mod external_sync;
pub mod keys;
pub mod migrator;
pub mod object_store;
pub mod relation_store;
pub mod source_store;
pub mod transfer;

use std::{future::Future, time::Duration};
use tokio::time::error::Elapsed;

/// Await `fut`, giving up after `limit` when one is configured.
pub(crate) async fn bounded<F: Future>(limit: Option<Duration>, fut: F) -> Result<F::Output, Elapsed> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await,
        None => Ok(fut.await),
    }
}
