//! Checkpoint store
//!
//! One cursor per logical stream (`StreamId::checkpoint_key`). Ingestion
//! streams store the last fully committed block; metric families store the
//! end timestamp of the last closed bucket; reconciliation stores the last
//! head it matured against.
//!
//! The stored cursor never decreases: a regressing write is logged and
//! ignored. Backfills call `reset` first.

use super::db::Store;
use super::types::StreamId;
use crate::error::Result;
use rusqlite::{Connection, OptionalExtension};

/// Read a stored cursor. Works on a plain connection or inside a transaction.
pub fn get_checkpoint(conn: &Connection, key: &str) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT cursor FROM checkpoints WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?)
}

/// Advance a cursor. Returns `false` when the write was a regression and was
/// ignored. Pass the sub-range's transaction so the checkpoint commits
/// atomically with its effects.
pub fn set_checkpoint(conn: &Connection, key: &str, cursor: i64) -> Result<bool> {
    let changed = conn.execute(
        "INSERT INTO checkpoints (key, cursor, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET
            cursor = excluded.cursor,
            updated_at = excluded.updated_at
         WHERE excluded.cursor >= checkpoints.cursor",
        rusqlite::params![key, cursor, chrono::Utc::now().timestamp()],
    )?;

    if changed == 0 {
        log::warn!(
            "⚠️  Ignoring checkpoint regression for {} (attempted {})",
            key,
            cursor
        );
        return Ok(false);
    }
    log::debug!("checkpoint {} -> {}", key, cursor);
    Ok(true)
}

/// Remove a cursor so the next run starts from genesis.
pub fn reset_checkpoint(conn: &Connection, key: &str) -> Result<()> {
    conn.execute("DELETE FROM checkpoints WHERE key = ?1", [key])?;
    log::info!("🔄 Reset checkpoint {}", key);
    Ok(())
}

/// Checkpoint access with genesis defaults.
#[derive(Clone)]
pub struct CheckpointStore {
    store: Store,
    genesis_block: u64,
    genesis_timestamp: i64,
}

impl CheckpointStore {
    pub fn new(store: Store, genesis_block: u64, genesis_timestamp: i64) -> Self {
        Self {
            store,
            genesis_block,
            genesis_timestamp,
        }
    }

    /// Stored cursor, or the genesis cursor appropriate for the stream.
    pub fn get(&self, id: &StreamId) -> Result<i64> {
        Ok(self.get_stored(id)?.unwrap_or_else(|| self.genesis(id)))
    }

    pub fn get_stored(&self, id: &StreamId) -> Result<Option<i64>> {
        let key = id.checkpoint_key();
        self.store.with_conn(|conn| get_checkpoint(conn, &key))
    }

    pub fn set(&self, id: &StreamId, cursor: i64) -> Result<bool> {
        let key = id.checkpoint_key();
        self.store.with_conn(|conn| set_checkpoint(conn, &key, cursor))
    }

    pub fn reset(&self, id: &StreamId) -> Result<()> {
        let key = id.checkpoint_key();
        self.store.with_conn(|conn| reset_checkpoint(conn, &key))
    }

    pub fn genesis(&self, id: &StreamId) -> i64 {
        match id {
            StreamId::Metrics(_) => self.genesis_timestamp,
            StreamId::Ingest(_) | StreamId::Reconcile => self.genesis_block as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::pipeline::db::test_support::create_test_store;
    use crate::pipeline::types::{MetricFamily, StreamKind};

    #[test]
    fn test_defaults_to_genesis() {
        let (_file, store) = create_test_store();
        let checkpoints = CheckpointStore::new(store, 17_000_000, 1_700_000_000);

        assert_eq!(
            checkpoints.get(&StreamId::Ingest(StreamKind::Operators)).unwrap(),
            17_000_000
        );
        assert_eq!(
            checkpoints.get(&StreamId::Metrics(MetricFamily::Tvl)).unwrap(),
            1_700_000_000
        );
        assert!(checkpoints
            .get_stored(&StreamId::Ingest(StreamKind::Operators))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_monotonic_set() {
        let (_file, store) = create_test_store();
        let checkpoints = CheckpointStore::new(store, 0, 0);
        let id = StreamId::Ingest(StreamKind::Deposits);

        assert!(checkpoints.set(&id, 2_000).unwrap());
        assert!(checkpoints.set(&id, 2_000).unwrap());
        assert!(!checkpoints.set(&id, 1_500).unwrap());
        assert_eq!(checkpoints.get(&id).unwrap(), 2_000);

        assert!(checkpoints.set(&id, 3_000).unwrap());
        assert_eq!(checkpoints.get(&id).unwrap(), 3_000);
    }

    #[test]
    fn test_reset_allows_backfill() {
        let (_file, store) = create_test_store();
        let checkpoints = CheckpointStore::new(store, 10, 0);
        let id = StreamId::Reconcile;

        checkpoints.set(&id, 900).unwrap();
        checkpoints.reset(&id).unwrap();
        assert_eq!(checkpoints.get(&id).unwrap(), 10);
        assert!(checkpoints.set(&id, 100).unwrap());
    }

    #[test]
    fn test_set_inside_rolled_back_tx_does_not_persist() {
        let (_file, store) = create_test_store();
        let checkpoints = CheckpointStore::new(store.clone(), 0, 0);
        let id = StreamId::Ingest(StreamKind::Pods);
        let key = id.checkpoint_key();

        let result: Result<()> = store.with_tx(|tx| {
            set_checkpoint(tx, &key, 500)?;
            Err(SyncError::Timeout("commit aborted".into()))
        });
        assert!(result.is_err());
        assert!(checkpoints.get_stored(&id).unwrap().is_none());
    }
}
