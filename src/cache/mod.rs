//! Cache Module
//!
//! Persistent blob caching over SQLite: record codec, storage gateway,
//! key snapshot and the cache engine itself.

mod codec;
pub(crate) mod entry;
mod gateway;
mod key_index;
mod stats;
mod store;


// Re-export public types
pub use codec::{decode, encode, EncodedRow, RawRow};
pub use entry::{current_time, CacheEntry, Liveness};
pub use gateway::{StorageGateway, WriteOp};
pub use key_index::KeyIndex;
pub use stats::CacheStats;
pub use store::BlobCache;
