// SPDX-License-Identifier: MPL-2.0

mod cursors;
mod db;
mod identity;
mod schema;
mod service;

pub use cursors::CursorStore;
pub use db::StateDb;
pub use identity::{CachedIdentity, IdentityStore};
pub use service::ServiceStore;

use thiserror::Error;

/// Cache entries older than this are deleted on read and treated as a miss.
pub const CACHE_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database path error: {0}")]
    Path(String),
}
