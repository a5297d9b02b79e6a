//! Backend key-value store with TTLs and prefix watches.
//!
//! Every mutation is assigned the next value of a single store-wide index.
//! A snapshot taken with [`Store::get`] reports the index it reflects, and
//! [`Store::watch`] from that index delivers every later mutation under the
//! prefix, in index order, with no gaps. A watcher that falls behind or asks
//! for history the store no longer holds gets a terminal error and must
//! resync from a fresh snapshot.

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::StoreError;

pub use memory::{MemoryStore, DEFAULT_HISTORY, DEFAULT_WATCH_BUFFER};

pub type StoreResult<T> = Result<T, StoreError>;

/// Live mutations under a prefix.
pub type WatchStream = BoxStream<'static, StoreResult<StoreEvent>>;

/// A key and its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub key: String,
    pub value: String,
    /// Index of the mutation that first created the key. Updates keep it.
    pub created_index: u64,
    /// Index of the latest mutation of the key.
    pub modified_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreAction {
    Set,
    Update,
    Delete,
    Expire,
}

impl StoreAction {
    pub fn is_removal(&self) -> bool {
        matches!(self, Self::Delete | Self::Expire)
    }
}

/// One mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEvent {
    pub index: u64,
    pub action: StoreAction,
    /// The node after the mutation, or as it was when removed.
    pub node: Node,
    /// The value before the mutation, if the key existed.
    pub prev_value: Option<String>,
}

/// An atomic read of every key under a prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Store index the snapshot reflects.
    pub index: u64,
    /// Nodes ordered by key.
    pub nodes: Vec<Node>,
}

/// A transactional key-value store.
///
/// A `ttl` of `None` means the key never expires.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Creates or replaces a key. Replacing keeps the key's created index.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<Node>;

    /// Replaces an existing key's value and TTL.
    ///
    /// Fails with [`StoreError::NotFound`] if the key does not exist.
    async fn update(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<Node>;

    /// Resets an existing key's TTL without changing its value.
    async fn refresh(&self, key: &str, ttl: Option<Duration>) -> StoreResult<Node>;

    async fn delete(&self, key: &str) -> StoreResult<Node>;

    async fn get(&self, prefix: &str) -> StoreResult<Snapshot>;

    /// Streams mutations under `prefix` with index strictly greater than
    /// `after_index`.
    async fn watch(&self, prefix: &str, after_index: u64) -> StoreResult<WatchStream>;
}
