//! Lifecycle Module
//!
//! Schema creation and validation on open, purging of expired entries, and
//! the background purge task.
//!
//! # Tasks
//! - Purge: Removes expired rows at configured intervals

pub mod purge;
pub mod schema;

pub use purge::{purge_expired, spawn_purge_task, vacuum};
pub use schema::{ensure_schema, SchemaState, SCHEMA_VERSION};
