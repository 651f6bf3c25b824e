//! SQLite store backend
//!
//! One table holds every key space; the `(pk, sk)` primary key gives us the
//! range queries the schema needs. Expired rows are filtered on read and
//! purged lazily on write.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::{upper_bound, Item, Order, SortRange, Store};
use crate::model::epoch_ms;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    pk         TEXT NOT NULL,
    sk         TEXT NOT NULL,
    value      TEXT NOT NULL,
    expires_at INTEGER,
    version    INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (pk, sk)
);
";

/// Thread-safe SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> crate::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> crate::Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Poisoning only happens if a holder panicked; propagating the
        // panic is the right behavior for a corrupted connection.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn purge_expired(conn: &Connection, now_secs: u64) -> rusqlite::Result<()> {
        conn.execute(
            "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at < ?1",
            params![now_secs],
        )?;
        Ok(())
    }

    fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, Option<u64>, u64)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
        ))
    }

    fn decode_row(
        (pk, sk, value, expires_at, version): (String, String, String, Option<u64>, u64),
    ) -> crate::Result<Item> {
        Ok(Item {
            pk,
            sk,
            value: serde_json::from_str(&value)?,
            expires_at,
            version,
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn put(&self, item: Item) -> crate::Result<()> {
        let conn = self.lock();
        Self::purge_expired(&conn, epoch_ms() / 1000)?;
        conn.execute(
            "INSERT INTO kv (pk, sk, value, expires_at, version) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (pk, sk) DO UPDATE
             SET value = excluded.value, expires_at = excluded.expires_at, version = excluded.version",
            params![
                item.pk,
                item.sk,
                item.value.to_string(),
                item.expires_at,
                item.version
            ],
        )?;
        Ok(())
    }

    async fn put_if_newer(&self, item: Item) -> crate::Result<bool> {
        let conn = self.lock();
        Self::purge_expired(&conn, epoch_ms() / 1000)?;
        let changed = conn.execute(
            "INSERT INTO kv (pk, sk, value, expires_at, version) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (pk, sk) DO UPDATE
             SET value = excluded.value, expires_at = excluded.expires_at, version = excluded.version
             WHERE kv.version <= excluded.version",
            params![
                item.pk,
                item.sk,
                item.value.to_string(),
                item.expires_at,
                item.version
            ],
        )?;
        Ok(changed > 0)
    }

    async fn get(&self, pk: &str, sk: &str) -> crate::Result<Option<Item>> {
        let now_secs = epoch_ms() / 1000;
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT pk, sk, value, expires_at, version FROM kv
                 WHERE pk = ?1 AND sk = ?2 AND (expires_at IS NULL OR expires_at >= ?3)",
                params![pk, sk, now_secs],
                Self::row_to_item,
            )
            .optional()?;
        row.map(Self::decode_row).transpose()
    }

    async fn query(
        &self,
        pk: &str,
        range: SortRange,
        order: Order,
        limit: Option<usize>,
    ) -> crate::Result<Vec<Item>> {
        let now_secs = epoch_ms() / 1000;
        let (lo, hi) = match range {
            SortRange::All => (String::new(), None),
            SortRange::AtLeast(from) => (from, None),
            SortRange::Between(from, to) => (from, Some(to)),
        };
        let direction = match order {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        };
        let limit = limit.map(|l| l as i64).unwrap_or(-1);

        let sql = format!(
            "SELECT pk, sk, value, expires_at, version FROM kv
             WHERE pk = ?1 AND sk >= ?2 AND (?3 IS NULL OR sk <= ?3)
               AND (expires_at IS NULL OR expires_at >= ?4)
             ORDER BY sk {} LIMIT ?5",
            direction
        );

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![pk, lo, hi, now_secs, limit], Self::row_to_item)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(Self::decode_row(row?)?);
        }
        Ok(items)
    }

    async fn scan_pk_prefix(&self, prefix: &str) -> crate::Result<Vec<Item>> {
        let now_secs = epoch_ms() / 1000;
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT pk, sk, value, expires_at, version FROM kv
             WHERE pk >= ?1 AND pk < ?2 AND (expires_at IS NULL OR expires_at >= ?3)
             ORDER BY pk, sk",
        )?;
        let rows = stmt.query_map(
            params![prefix, upper_bound(prefix), now_secs],
            Self::row_to_item,
        )?;
        let mut items = Vec::new();
        for row in rows {
            items.push(Self::decode_row(row?)?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{check_pk, check_sk, ts13};

    fn item(pk: &str, sk: &str, n: u64) -> Item {
        Item {
            pk: pk.to_string(),
            sk: sk.to_string(),
            value: serde_json::json!({ "n": n }),
            expires_at: None,
            version: n,
        }
    }

    #[tokio::test]
    async fn open_creates_schema_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lookout.db");
        let store = SqliteStore::open(&path).unwrap();
        store.put(item("STATE#web", "CURRENT", 1)).await.unwrap();

        // Re-open and read back.
        drop(store);
        let store = SqliteStore::open(&path).unwrap();
        let got = store.get("STATE#web", "CURRENT").await.unwrap();
        assert_eq!(got.unwrap().value["n"], 1);
    }

    #[tokio::test]
    async fn put_overwrites_existing_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put(item("STATE#web", "CURRENT", 1)).await.unwrap();
        store.put(item("STATE#web", "CURRENT", 2)).await.unwrap();
        let got = store.get("STATE#web", "CURRENT").await.unwrap().unwrap();
        assert_eq!(got.value["n"], 2);
        assert_eq!(got.version, 2);
    }

    #[tokio::test]
    async fn put_if_newer_guards_against_stale_writers() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.put_if_newer(item("STATE#web", "CURRENT", 10)).await.unwrap());
        assert!(!store.put_if_newer(item("STATE#web", "CURRENT", 9)).await.unwrap());
        let got = store.get("STATE#web", "CURRENT").await.unwrap().unwrap();
        assert_eq!(got.version, 10);
    }

    #[tokio::test]
    async fn query_window_matches_check_keys() {
        let store = SqliteStore::open_in_memory().unwrap();
        let base = 1_700_000_000_000u64;
        for (offset, region) in [(0, "eu"), (60_000, "eu"), (60_000, "us"), (120_000, "eu")] {
            let ts = base + offset;
            let mut row = item(&check_pk("web"), &check_sk(ts, region), ts);
            row.value = serde_json::json!({ "region": region, "ts": ts });
            store.put(row).await.unwrap();
        }

        let recent = store
            .query(
                &check_pk("web"),
                SortRange::AtLeast(ts13(base + 60_000)),
                Order::Asc,
                None,
            )
            .await
            .unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].value["region"], "eu");
        assert_eq!(recent[1].value["region"], "us");
    }

    #[tokio::test]
    async fn desc_limit_returns_newest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        for n in 1..=4u64 {
            store
                .put(item("INCIDENT#web", &ts13(n * 1000), n))
                .await
                .unwrap();
        }
        let newest = store
            .query("INCIDENT#web", SortRange::All, Order::Desc, Some(2))
            .await
            .unwrap();
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].value["n"], 4);
        assert_eq!(newest[1].value["n"], 3);
    }

    #[tokio::test]
    async fn expired_rows_are_hidden_and_purged() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut stale = item("CHECK#web", "0000000000001#eu", 1);
        stale.expires_at = Some(1);
        store.put(stale).await.unwrap();
        assert!(store.get("CHECK#web", "0000000000001#eu").await.unwrap().is_none());

        // The next write purges the expired row entirely.
        store.put(item("CHECK#web", "0000000000002#eu", 2)).await.unwrap();
        let all = store
            .query("CHECK#web", SortRange::All, Order::Asc, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn scan_prefix_excludes_neighbors() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put(item("INCIDENT#api", ts13(1).as_str(), 1)).await.unwrap();
        store.put(item("INCIDENT#web", ts13(2).as_str(), 2)).await.unwrap();
        store.put(item("STATE#web", "CURRENT", 3)).await.unwrap();

        let incidents = store.scan_pk_prefix("INCIDENT#").await.unwrap();
        assert_eq!(incidents.len(), 2);
    }
}
