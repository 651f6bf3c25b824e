//! Central store abstraction
//!
//! The store is a keyed table with composite primary key `(pk, sk)`, range
//! queries by sort key under a fixed partition key, and item-level TTL in
//! seconds. All hot-path reads are a `pk` equality plus an `sk` range; the
//! only sanctioned cross-partition scans are the aggregator's `STATE#`
//! enumeration and the query layer's incident listing.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// One stored row.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub pk: String,
    pub sk: String,
    pub value: serde_json::Value,
    /// Expiry as epoch seconds; `None` never expires.
    pub expires_at: Option<u64>,
    /// Monotonic guard used by [`Store::put_if_newer`]. For state rows this
    /// is the aggregator tick timestamp.
    pub version: u64,
}

impl Item {
    pub fn new<T: Serialize>(pk: String, sk: String, value: &T) -> crate::Result<Self> {
        Ok(Self {
            pk,
            sk,
            value: serde_json::to_value(value)?,
            expires_at: None,
            version: 0,
        })
    }

    pub fn with_ttl(mut self, written_at_ms: u64, ttl_secs: u64) -> Self {
        self.expires_at = Some(written_at_ms / 1000 + ttl_secs);
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn decode<T: DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_value(self.value.clone())?)
    }
}

/// Inclusive sort-key range under one partition key.
#[derive(Debug, Clone)]
pub enum SortRange {
    All,
    AtLeast(String),
    Between(String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Unconditional upsert.
    async fn put(&self, item: Item) -> crate::Result<()>;

    /// Upsert that only applies when the stored row's version is not newer
    /// than the incoming one. Returns whether the write applied. This is the
    /// guard that makes two overlapping aggregator ticks safe.
    async fn put_if_newer(&self, item: Item) -> crate::Result<bool>;

    async fn get(&self, pk: &str, sk: &str) -> crate::Result<Option<Item>>;

    async fn query(
        &self,
        pk: &str,
        range: SortRange,
        order: Order,
        limit: Option<usize>,
    ) -> crate::Result<Vec<Item>>;

    /// Enumerate rows whose partition key starts with `prefix`, ordered by
    /// `(pk, sk)`. Scan path; keep off the per-tick hot path.
    async fn scan_pk_prefix(&self, prefix: &str) -> crate::Result<Vec<Item>>;
}

/// Smallest string strictly greater than every string with this prefix.
/// Keys here are ASCII, so bumping the last byte is enough.
pub(crate) fn prefix_upper_bound(prefix: &str) -> String {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(last) = bytes.pop() {
        if last < 0xFF {
            bytes.push(last + 1);
            return String::from_utf8_lossy(&bytes).into_owned();
        }
    }
    // Unreachable for non-empty ASCII prefixes; fall back to "match all".
    "\u{10FFFF}".to_string()
}

pub(crate) use prefix_upper_bound as upper_bound;
