//! Idempotent materializer
//!
//! Applies ordered canonical events to a stream's sink inside the caller's
//! transaction. Every event is first recorded in `event_log` keyed by
//! `(tx_hash, log_index)`; the sink only sees events whose insert actually
//! created a row, so redelivered events have no side effects.

use super::sinks::{sink_for, ApplyContext};
use super::types::{Address, CanonicalEvent, EventPayload, StreamKind};
use crate::error::{Result, SyncError};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

/// How a run treats rows the stream already owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterializeMode {
    /// Delete all owned rows and rebuild from the first sub-range
    FullRebuild,
    /// Upsert on top of existing state
    #[default]
    Incremental,
}

/// Writes one stream's projections. Implementations run inside the
/// sub-range transaction and must not perform I/O other than SQL.
pub trait Sink: Send + Sync {
    fn stream(&self) -> StreamKind;

    /// Tables cleared by a full rebuild.
    fn owned_tables(&self) -> &'static [&'static str];

    /// Apply one event that has not been applied before.
    fn apply(&self, conn: &Connection, event: &CanonicalEvent, ctx: &ApplyContext) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaterializeStats {
    pub applied: usize,
    pub duplicates: usize,
}

/// Delete every row the stream owns, including its event log.
pub fn clear_owned(conn: &Connection, sink: &dyn Sink) -> Result<()> {
    for table in sink.owned_tables() {
        conn.execute(&format!("DELETE FROM {}", table), [])?;
    }
    let removed = conn.execute(
        "DELETE FROM event_log WHERE stream = ?1",
        [sink.stream().as_str()],
    )?;
    log::info!(
        "🔄 Full rebuild of {}: cleared {} tables, {} logged events",
        sink.stream().as_str(),
        sink.owned_tables().len(),
        removed
    );
    Ok(())
}

/// Append to `event_log`. Returns `true` if this is the first delivery.
pub fn record_event(conn: &Connection, stream: StreamKind, event: &CanonicalEvent) -> Result<bool> {
    let payload = serde_json::to_string(&event.payload)?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO event_log
            (tx_hash, log_index, stream, kind, address, block_number, tx_index, block_time, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            event.tx_hash,
            event.log_index as i64,
            stream.as_str(),
            event.kind().as_str(),
            event.address.as_str(),
            event.block_number as i64,
            event.tx_index as i64,
            event.block_time,
            payload,
        ],
    )?;
    Ok(inserted > 0)
}

/// Apply `events` (already in canonical order) to the stream's sink.
pub fn materialize(
    conn: &Connection,
    stream: StreamKind,
    events: &[CanonicalEvent],
    mode: MaterializeMode,
    ctx: &ApplyContext,
) -> Result<MaterializeStats> {
    let sink = sink_for(stream);
    if mode == MaterializeMode::FullRebuild {
        clear_owned(conn, sink.as_ref())?;
    }

    let mut stats = MaterializeStats::default();
    for event in events {
        if record_event(conn, stream, event)? {
            sink.apply(conn, event, ctx)?;
            stats.applied += 1;
        } else {
            stats.duplicates += 1;
        }
    }

    if stats.duplicates > 0 {
        log::debug!(
            "{}: {} redelivered events ignored",
            stream.as_str(),
            stats.duplicates
        );
    }
    Ok(stats)
}

/// Read a stream's logged events with `after < block_time <= until`, in
/// `(block, tx_index, log_index)` order.
pub fn load_stream_events(
    conn: &Connection,
    stream: StreamKind,
    after: i64,
    until: i64,
) -> Result<Vec<CanonicalEvent>> {
    let mut stmt = conn.prepare(
        "SELECT address, tx_hash, tx_index, log_index, block_number, block_time, payload
         FROM event_log
         WHERE stream = ?1 AND block_time > ?2 AND block_time <= ?3
         ORDER BY block_number, tx_index, log_index",
    )?;

    let rows = stmt.query_map(params![stream.as_str(), after, until], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, i64>(5)?,
            row.get::<_, String>(6)?,
        ))
    })?;

    let mut events = Vec::new();
    for row in rows {
        let (address, tx_hash, tx_index, log_index, block_number, block_time, payload) = row?;
        let address = Address::parse(&address)
            .ok_or_else(|| SyncError::Corrupt(format!("event_log address {:?}", address)))?;
        let payload: EventPayload = serde_json::from_str(&payload)?;
        events.push(CanonicalEvent {
            address,
            tx_hash,
            tx_index: tx_index as u64,
            log_index: log_index as u64,
            block_number: block_number as u64,
            block_time,
            payload,
        });
    }
    Ok(events)
}

/// Earliest logged event time across `streams`, if any.
pub fn first_event_time(conn: &Connection, streams: &[StreamKind]) -> Result<Option<i64>> {
    let mut first: Option<i64> = None;
    for stream in streams {
        let t: Option<i64> = conn.query_row(
            "SELECT MIN(block_time) FROM event_log WHERE stream = ?1",
            [stream.as_str()],
            |row| row.get(0),
        )?;
        first = match (first, t) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::test_support::create_test_store;
    use crate::pipeline::db::Store;
    use crate::streamer_core::metadata::EntityMetadata;
    use num_bigint::BigInt;

    fn addr(byte: u8) -> Address {
        Address::from_bytes(&[byte; 20])
    }

    fn event(block: u64, tx: u64, log: u64, payload: EventPayload) -> CanonicalEvent {
        CanonicalEvent {
            address: addr(0xde),
            tx_hash: format!("0x{:064x}", block * 10_000 + tx),
            tx_index: tx,
            log_index: log,
            block_number: block,
            block_time: 1_700_000_000 + block as i64 * 12,
            payload,
        }
    }

    fn register(block: u64, operator: u8) -> CanonicalEvent {
        event(
            block,
            operator as u64,
            0,
            EventPayload::OperatorRegistered {
                operator: addr(operator),
                delegation_approver: Address::zero(),
            },
        )
    }

    fn apply(store: &Store, stream: StreamKind, events: &[CanonicalEvent], mode: MaterializeMode) -> MaterializeStats {
        store
            .with_tx(|tx| materialize(tx, stream, events, mode, &ApplyContext::default()))
            .unwrap()
    }

    fn query_i64(store: &Store, sql: &str) -> i64 {
        store
            .with_conn(|conn| Ok(conn.query_row(sql, [], |row| row.get(0))?))
            .unwrap()
    }

    fn query_text(store: &Store, sql: &str) -> Option<String> {
        store
            .with_conn(|conn| Ok(conn.query_row(sql, [], |row| row.get(0))?))
            .unwrap()
    }

    #[test]
    fn test_redelivery_is_noop() {
        let (_file, store) = create_test_store();
        apply(&store, StreamKind::Operators, &[register(1, 0xaa)], MaterializeMode::Incremental);

        let deposits = vec![
            event(5, 0, 0, EventPayload::Deposit {
                staker: addr(1),
                token: addr(2),
                strategy: addr(3),
                shares: BigInt::from(100),
            }),
            event(6, 1, 4, EventPayload::Deposit {
                staker: addr(1),
                token: addr(2),
                strategy: addr(3),
                shares: BigInt::from(50),
            }),
        ];

        let first = apply(&store, StreamKind::Deposits, &deposits, MaterializeMode::Incremental);
        let second = apply(&store, StreamKind::Deposits, &deposits, MaterializeMode::Incremental);
        assert_eq!(first, MaterializeStats { applied: 2, duplicates: 0 });
        assert_eq!(second, MaterializeStats { applied: 0, duplicates: 2 });

        assert_eq!(
            query_text(&store, "SELECT shares FROM staker_deposits").as_deref(),
            Some("150")
        );
    }

    #[test]
    fn test_full_rebuild_matches_single_application() {
        let (_file, store) = create_test_store();
        let events = vec![register(1, 0xaa), register(2, 0xbb)];

        apply(&store, StreamKind::Operators, &events, MaterializeMode::FullRebuild);
        apply(&store, StreamKind::Operators, &events, MaterializeMode::FullRebuild);

        assert_eq!(query_i64(&store, "SELECT COUNT(*) FROM operators"), 2);
        assert_eq!(
            query_i64(&store, "SELECT COUNT(*) FROM event_log WHERE stream = 'operators'"),
            2
        );
    }

    #[test]
    fn test_older_event_does_not_overwrite_newer_projection() {
        let (_file, store) = create_test_store();
        apply(&store, StreamKind::Operators, &[register(1, 0xaa)], MaterializeMode::Incremental);

        let newer = event(20, 0, 1, EventPayload::OperatorMetadataUriUpdated {
            operator: addr(0xaa),
            metadata_uri: "https://b.example/meta.json".into(),
        });
        let older = event(10, 0, 1, EventPayload::OperatorMetadataUriUpdated {
            operator: addr(0xaa),
            metadata_uri: "https://a.example/meta.json".into(),
        });

        // network delivered the newer event first
        apply(&store, StreamKind::Operators, &[newer], MaterializeMode::Incremental);
        apply(&store, StreamKind::Operators, &[older], MaterializeMode::Incremental);

        assert_eq!(
            query_text(&store, "SELECT metadata_uri FROM operators").as_deref(),
            Some("https://b.example/meta.json")
        );
    }

    #[test]
    fn test_encumbered_magnitude_ordered_within_block() {
        let (_file, store) = create_test_store();
        let update = |log: u64, magnitude: u64| {
            event(30, 2, log, EventPayload::EncumberedMagnitudeUpdated {
                operator: addr(0xaa),
                strategy: addr(3),
                encumbered_magnitude: magnitude,
            })
        };

        // same block and transaction, later log delivered first
        apply(&store, StreamKind::Allocations, &[update(5, 700)], MaterializeMode::Incremental);
        apply(&store, StreamKind::Allocations, &[update(3, 200)], MaterializeMode::Incremental);
        assert_eq!(query_i64(&store, "SELECT encumbered_magnitude FROM encumbered_magnitudes"), 700);

        apply(&store, StreamKind::Allocations, &[update(6, 900)], MaterializeMode::Incremental);
        assert_eq!(query_i64(&store, "SELECT encumbered_magnitude FROM encumbered_magnitudes"), 900);
    }

    #[test]
    fn test_metadata_projected_from_context() {
        let (_file, store) = create_test_store();
        apply(&store, StreamKind::Operators, &[register(1, 0xaa)], MaterializeMode::Incremental);

        let uri = "https://op.example/meta.json";
        let mut ctx = ApplyContext::default();
        ctx.metadata.insert(
            uri.to_string(),
            EntityMetadata {
                name: Some("Op A".into()),
                ..Default::default()
            },
        );
        let update = event(3, 0, 0, EventPayload::OperatorMetadataUriUpdated {
            operator: addr(0xaa),
            metadata_uri: uri.into(),
        });
        store
            .with_tx(|tx| materialize(tx, StreamKind::Operators, &[update], MaterializeMode::Incremental, &ctx))
            .unwrap();

        assert_eq!(
            query_text(&store, "SELECT metadata_name FROM operators").as_deref(),
            Some("Op A")
        );
        assert_eq!(query_text(&store, "SELECT metadata_logo FROM operators"), None);
    }

    #[test]
    fn test_referential_gap_is_dropped() {
        let (_file, store) = create_test_store();
        let delegation = event(4, 0, 0, EventPayload::StakerDelegated {
            staker: addr(1),
            operator: addr(0xcc),
        });

        let stats = apply(&store, StreamKind::Delegations, &[delegation], MaterializeMode::Incremental);
        assert_eq!(stats.applied, 1);
        assert_eq!(query_i64(&store, "SELECT COUNT(*) FROM stakers"), 0);
    }

    #[test]
    fn test_staker_counts_follow_delegation_changes() {
        let (_file, store) = create_test_store();
        apply(
            &store,
            StreamKind::Operators,
            &[register(1, 0xaa), register(1, 0xbb)],
            MaterializeMode::Incremental,
        );

        let events = vec![
            event(5, 0, 0, EventPayload::StakerDelegated { staker: addr(1), operator: addr(0xaa) }),
            event(5, 1, 0, EventPayload::StakerDelegated { staker: addr(2), operator: addr(0xaa) }),
            event(6, 0, 0, EventPayload::StakerUndelegated { staker: addr(1), operator: addr(0xaa) }),
            event(7, 0, 0, EventPayload::StakerDelegated { staker: addr(1), operator: addr(0xbb) }),
        ];
        apply(&store, StreamKind::Delegations, &events, MaterializeMode::Incremental);

        let count = |op: &Address| {
            query_i64(
                &store,
                &format!("SELECT total_stakers FROM operator_stakers WHERE operator = '{}'", op),
            )
        };
        assert_eq!(count(&addr(0xaa)), 1);
        assert_eq!(count(&addr(0xbb)), 1);
    }

    #[test]
    fn test_operator_shares_and_strategy_totals() {
        let (_file, store) = create_test_store();
        apply(&store, StreamKind::Operators, &[register(1, 0xaa)], MaterializeMode::Incremental);

        let events = vec![
            event(5, 0, 0, EventPayload::OperatorSharesIncreased {
                operator: addr(0xaa),
                staker: addr(1),
                strategy: addr(3),
                shares: BigInt::from(300),
            }),
            event(6, 0, 0, EventPayload::OperatorSharesDecreased {
                operator: addr(0xaa),
                staker: addr(1),
                strategy: addr(3),
                shares: BigInt::from(120),
            }),
        ];
        apply(&store, StreamKind::OperatorShares, &events, MaterializeMode::Incremental);

        assert_eq!(
            query_text(&store, "SELECT shares FROM operator_strategy_shares").as_deref(),
            Some("180")
        );
        assert_eq!(
            query_text(&store, "SELECT shares FROM strategy_delegated_shares").as_deref(),
            Some("180")
        );
    }

    #[test]
    fn test_withdrawal_completion_marks_row() {
        let (_file, store) = create_test_store();
        let root = format!("0x{:064x}", 77);
        let events = vec![
            event(5, 0, 0, EventPayload::WithdrawalQueued {
                withdrawal_root: root.clone(),
                staker: addr(1),
                delegated_to: addr(0xaa),
                withdrawer: addr(1),
                nonce: BigInt::from(0),
                start_block: 5,
                strategies: vec![],
            }),
            event(9, 0, 0, EventPayload::WithdrawalCompleted { withdrawal_root: root }),
        ];
        apply(&store, StreamKind::Withdrawals, &events, MaterializeMode::Incremental);

        assert_eq!(query_i64(&store, "SELECT is_completed FROM withdrawals"), 1);
        assert_eq!(query_i64(&store, "SELECT completed_block FROM withdrawals"), 9);
    }

    #[test]
    fn test_load_stream_events_window_is_half_open() {
        let (_file, store) = create_test_store();
        let events = vec![register(1, 0xaa), register(2, 0xbb), register(3, 0xcc)];
        apply(&store, StreamKind::Operators, &events, MaterializeMode::Incremental);

        let t1 = events[0].block_time;
        let t3 = events[2].block_time;
        let loaded = store
            .with_conn(|conn| load_stream_events(conn, StreamKind::Operators, t1, t3))
            .unwrap();

        let blocks: Vec<_> = loaded.iter().map(|e| e.block_number).collect();
        assert_eq!(blocks, vec![2, 3]);
        assert_eq!(loaded[1], events[2]);

        let first = store
            .with_conn(|conn| first_event_time(conn, &[StreamKind::Operators, StreamKind::Avs]))
            .unwrap();
        assert_eq!(first, Some(t1));
    }
}
