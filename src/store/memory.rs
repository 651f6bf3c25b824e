//! In-memory store backend
//!
//! Backs tests and single-process local runs. Same visibility rules as the
//! SQLite backend: expired rows are invisible to reads.

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{upper_bound, Item, Order, SortRange, Store};
use crate::model::epoch_ms;

#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<BTreeMap<(String, String), Item>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn expired(item: &Item, now_secs: u64) -> bool {
        item.expires_at.is_some_and(|at| at < now_secs)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(&self, item: Item) -> crate::Result<()> {
        let mut rows = self.rows.write().await;
        rows.insert((item.pk.clone(), item.sk.clone()), item);
        Ok(())
    }

    async fn put_if_newer(&self, item: Item) -> crate::Result<bool> {
        let mut rows = self.rows.write().await;
        let key = (item.pk.clone(), item.sk.clone());
        match rows.get(&key) {
            Some(existing) if existing.version > item.version => Ok(false),
            _ => {
                rows.insert(key, item);
                Ok(true)
            }
        }
    }

    async fn get(&self, pk: &str, sk: &str) -> crate::Result<Option<Item>> {
        let now_secs = epoch_ms() / 1000;
        let rows = self.rows.read().await;
        Ok(rows
            .get(&(pk.to_string(), sk.to_string()))
            .filter(|item| !Self::expired(item, now_secs))
            .cloned())
    }

    async fn query(
        &self,
        pk: &str,
        range: SortRange,
        order: Order,
        limit: Option<usize>,
    ) -> crate::Result<Vec<Item>> {
        let now_secs = epoch_ms() / 1000;
        let rows = self.rows.read().await;

        let (lo, hi) = match range {
            SortRange::All => (Bound::Unbounded, Bound::Unbounded),
            SortRange::AtLeast(from) => (Bound::Included((pk.to_string(), from)), Bound::Unbounded),
            SortRange::Between(from, to) => (
                Bound::Included((pk.to_string(), from)),
                Bound::Included((pk.to_string(), to)),
            ),
        };
        let lo = match lo {
            Bound::Unbounded => Bound::Included((pk.to_string(), String::new())),
            other => other,
        };
        let hi = match hi {
            Bound::Unbounded => Bound::Excluded((upper_bound(pk), String::new())),
            other => other,
        };

        let mut matched: Vec<Item> = rows
            .range((lo, hi))
            .map(|(_, item)| item)
            .filter(|item| item.pk == pk && !Self::expired(item, now_secs))
            .cloned()
            .collect();
        if order == Order::Desc {
            matched.reverse();
        }
        if let Some(limit) = limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn scan_pk_prefix(&self, prefix: &str) -> crate::Result<Vec<Item>> {
        let now_secs = epoch_ms() / 1000;
        let rows = self.rows.read().await;
        Ok(rows
            .range((
                Bound::Included((prefix.to_string(), String::new())),
                Bound::Excluded((upper_bound(prefix), String::new())),
            ))
            .map(|(_, item)| item)
            .filter(|item| item.pk.starts_with(prefix) && !Self::expired(item, now_secs))
            .cloned()
            .collect())
    }
}
