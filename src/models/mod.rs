//! Core data models for the blob migration and datastream service.
//!
//! Relation records map onto the SQLite side-table via `sqlx::FromRow` and
//! serialize with the camelCase field names the application layer expects.

pub mod datastream;
pub mod relation;
pub mod source;
pub mod stats;
