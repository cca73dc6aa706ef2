//! Deferred-effect applier
//!
//! Two-phase state for changes that only take effect at a future block.
//!
//! Phase 1 runs at event time inside the sink's transaction and records
//! `(pending_delta, effect_block)` against the subject row. Each subject has
//! a single pending slot: a newer event overwrites it.
//!
//! Phase 2 (`apply_matured`) runs against a head block and folds every
//! pending delta with `effect_block <= head` into the current value, in one
//! `BEGIN IMMEDIATE` transaction. Negative deltas also release the same
//! amount from a dependent counter, floored at zero.

use super::db::Store;
use crate::error::{Result, SyncError};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};

/// Counter on a related table that a negative matured delta reduces.
#[derive(Debug, Clone, Copy)]
pub struct DependentCounter {
    pub table: &'static str,
    /// `(dependent column, subject column)` pairs joining the two rows
    pub key_columns: &'static [(&'static str, &'static str)],
    pub counter: &'static str,
}

/// A table holding deferred effects. Every such table has the columns
/// `pending_delta`, `effect_block` and `last_block` next to its subject
/// key and current-value column.
#[derive(Debug, Clone, Copy)]
pub struct DeferredTable {
    pub table: &'static str,
    pub subject_columns: &'static [&'static str],
    pub current_column: &'static str,
    pub dependent: Option<DependentCounter>,
}

pub const ALLOCATIONS: DeferredTable = DeferredTable {
    table: "allocations",
    subject_columns: &["operator", "avs", "operator_set_id", "strategy"],
    current_column: "current_magnitude",
    dependent: Some(DependentCounter {
        table: "encumbered_magnitudes",
        key_columns: &[("operator", "operator"), ("strategy", "strategy")],
        counter: "encumbered_magnitude",
    }),
};

/// Snapshot of one subject's deferred state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredState {
    pub current: i64,
    pub pending_delta: i64,
    pub effect_block: u64,
}

fn subject_filter(spec: &DeferredTable) -> String {
    spec.subject_columns
        .iter()
        .enumerate()
        .map(|(i, col)| format!("{} = ?{}", col, i + 1))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Current deferred state of a subject, if the row exists.
pub fn load_state(conn: &Connection, spec: &DeferredTable, subject: &[Value]) -> Result<Option<DeferredState>> {
    let sql = format!(
        "SELECT {}, pending_delta, effect_block FROM {} WHERE {}",
        spec.current_column,
        spec.table,
        subject_filter(spec)
    );
    Ok(conn
        .query_row(&sql, params_from_iter(subject.iter()), |row| {
            Ok(DeferredState {
                current: row.get(0)?,
                pending_delta: row.get(1)?,
                effect_block: row.get::<_, i64>(2)? as u64,
            })
        })
        .optional()?)
}

fn write_state(
    conn: &Connection,
    spec: &DeferredTable,
    subject: &[Value],
    state: DeferredState,
    block: u64,
) -> Result<()> {
    let cols = spec.subject_columns.join(", ");
    let n = spec.subject_columns.len();
    let placeholders = (1..=n + 4).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ");
    let sql = format!(
        "INSERT INTO {table} ({cols}, {cur}, pending_delta, effect_block, last_block)
         VALUES ({placeholders})
         ON CONFLICT({cols}) DO UPDATE SET
            {cur} = excluded.{cur},
            pending_delta = excluded.pending_delta,
            effect_block = excluded.effect_block,
            last_block = excluded.last_block",
        table = spec.table,
        cols = cols,
        cur = spec.current_column,
        placeholders = placeholders,
    );

    let mut values: Vec<Value> = subject.to_vec();
    values.push(Value::Integer(state.current));
    values.push(Value::Integer(state.pending_delta));
    values.push(Value::Integer(state.effect_block as i64));
    values.push(Value::Integer(block as i64));
    conn.execute(&sql, params_from_iter(values.iter()))?;
    Ok(())
}

/// Phase 1 for events carrying a new target value: `pending = target - current`.
pub fn record_pending_target(
    conn: &Connection,
    spec: &DeferredTable,
    subject: &[Value],
    target: i64,
    effect_block: u64,
    event_block: u64,
) -> Result<DeferredState> {
    let current = settled_current(conn, spec, subject, event_block)?;
    record(conn, spec, subject, current, target - current, effect_block, event_block)
}

/// Current value as of `event_block`: a pending change that had already
/// taken effect by then is folded in before the slot is overwritten.
fn settled_current(conn: &Connection, spec: &DeferredTable, subject: &[Value], event_block: u64) -> Result<i64> {
    Ok(match load_state(conn, spec, subject)? {
        Some(s) if s.pending_delta != 0 && s.effect_block <= event_block => {
            if s.pending_delta < 0 {
                release_dependent(conn, spec, subject, -s.pending_delta)?;
            }
            s.current + s.pending_delta
        }
        Some(s) => s.current,
        None => 0,
    })
}

fn record(
    conn: &Connection,
    spec: &DeferredTable,
    subject: &[Value],
    current: i64,
    delta: i64,
    effect_block: u64,
    event_block: u64,
) -> Result<DeferredState> {
    let state = if delta == 0 {
        DeferredState { current, pending_delta: 0, effect_block: 0 }
    } else {
        DeferredState { current, pending_delta: delta, effect_block }
    };
    write_state(conn, spec, subject, state, event_block)?;
    Ok(state)
}

fn release_dependent(conn: &Connection, spec: &DeferredTable, subject: &[Value], amount: i64) -> Result<()> {
    let Some(dep) = spec.dependent else {
        return Ok(());
    };

    let mut filters = Vec::with_capacity(dep.key_columns.len());
    let mut values = vec![Value::Integer(amount)];
    for (dep_col, subject_col) in dep.key_columns {
        let idx = spec
            .subject_columns
            .iter()
            .position(|c| c == subject_col)
            .ok_or_else(|| {
                SyncError::Schema(format!(
                    "{}.{} joins unknown subject column {} of {}",
                    dep.table, dep_col, subject_col, spec.table
                ))
            })?;
        values.push(subject[idx].clone());
        filters.push(format!("{} = ?{}", dep_col, values.len()));
    }

    let sql = format!(
        "UPDATE {table} SET {counter} = MAX(0, {counter} - ?1) WHERE {filters}",
        table = dep.table,
        counter = dep.counter,
        filters = filters.join(" AND "),
    );
    conn.execute(&sql, params_from_iter(values.iter()))?;
    Ok(())
}

/// Phase 2: mature every pending delta with `effect_block <= head`.
///
/// Returns the number of subjects updated. Re-running with the same head
/// is a no-op since matured rows have `pending_delta = 0`.
pub fn apply_matured(store: &Store, spec: &DeferredTable, head: u64) -> Result<usize> {
    store.with_immediate_tx(|tx| apply_matured_in(tx, spec, head))
}

/// `apply_matured` inside a caller-owned transaction.
pub fn apply_matured_in(tx: &Connection, spec: &DeferredTable, head: u64) -> Result<usize> {
    let sql = format!(
        "SELECT {cols}, {cur}, pending_delta FROM {table}
         WHERE pending_delta != 0 AND effect_block <= ?1",
        cols = spec.subject_columns.join(", "),
        cur = spec.current_column,
        table = spec.table,
    );
    let n = spec.subject_columns.len();

    let matured: Vec<(Vec<Value>, i64, i64)> = {
        let mut stmt = tx.prepare(&sql)?;
        let rows = stmt.query_map([head as i64], |row| {
            let mut subject = Vec::with_capacity(n);
            for i in 0..n {
                subject.push(row.get::<_, Value>(i)?);
            }
            Ok((subject, row.get(n)?, row.get(n + 1)?))
        })?;
        rows.collect::<std::result::Result<_, _>>()?
    };

    let update = format!(
        "UPDATE {table} SET {cur} = ?{c}, pending_delta = 0, effect_block = 0 WHERE {filter}",
        table = spec.table,
        cur = spec.current_column,
        c = n + 1,
        filter = subject_filter(spec),
    );

    for (subject, current, pending) in &matured {
        let mut values = subject.clone();
        values.push(Value::Integer(current + pending));
        tx.execute(&update, params_from_iter(values.iter()))?;

        if *pending < 0 {
            release_dependent(tx, spec, subject, -pending)?;
        }
        log::debug!("matured {} {:?}: {} -> {}", spec.table, subject, current, current + pending);
    }

    if !matured.is_empty() {
        log::info!("✅ Matured {} pending {} at head {}", matured.len(), spec.table, head);
    }
    Ok(matured.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::test_support::create_test_store;

    fn subject() -> Vec<Value> {
        vec![
            Value::Text("0xop".into()),
            Value::Text("0xavs".into()),
            Value::Integer(1),
            Value::Text("0xstrat".into()),
        ]
    }

    fn state(store: &Store) -> DeferredState {
        store
            .with_conn(|conn| load_state(conn, &ALLOCATIONS, &subject()))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_pending_not_visible_before_effect_block() {
        let (_file, store) = create_test_store();
        store
            .with_tx(|tx| record_pending_target(tx, &ALLOCATIONS, &subject(), 1_000, 500, 100).map(|_| ()))
            .unwrap();

        assert_eq!(apply_matured(&store, &ALLOCATIONS, 499).unwrap(), 0);
        assert_eq!(
            state(&store),
            DeferredState { current: 0, pending_delta: 1_000, effect_block: 500 }
        );

        assert_eq!(apply_matured(&store, &ALLOCATIONS, 500).unwrap(), 1);
        assert_eq!(
            state(&store),
            DeferredState { current: 1_000, pending_delta: 0, effect_block: 0 }
        );

        assert_eq!(apply_matured(&store, &ALLOCATIONS, 900).unwrap(), 0);
        assert_eq!(state(&store).current, 1_000);
    }

    #[test]
    fn test_new_event_overwrites_pending_slot() {
        let (_file, store) = create_test_store();
        store
            .with_tx(|tx| {
                record_pending_target(tx, &ALLOCATIONS, &subject(), 1_000, 500, 100)?;
                record_pending_target(tx, &ALLOCATIONS, &subject(), 400, 600, 200)?;
                Ok(())
            })
            .unwrap();

        assert_eq!(
            state(&store),
            DeferredState { current: 0, pending_delta: 400, effect_block: 600 }
        );
    }

    #[test]
    fn test_matured_pending_is_folded_before_overwrite() {
        let (_file, store) = create_test_store();
        store
            .with_tx(|tx| {
                record_pending_target(tx, &ALLOCATIONS, &subject(), 1_000, 150, 100)?;
                // emitted after block 150: the first change is already effective
                record_pending_target(tx, &ALLOCATIONS, &subject(), 600, 900, 200)?;
                Ok(())
            })
            .unwrap();

        assert_eq!(
            state(&store),
            DeferredState { current: 1_000, pending_delta: -400, effect_block: 900 }
        );
    }

    #[test]
    fn test_negative_delta_releases_encumbered_floored_at_zero() {
        let (_file, store) = create_test_store();
        store
            .with_tx(|tx| {
                tx.execute(
                    "INSERT INTO allocations (operator, avs, operator_set_id, strategy, current_magnitude, last_block)
                     VALUES ('0xop', '0xavs', 1, '0xstrat', 1000, 1)",
                    [],
                )?;
                tx.execute(
                    "INSERT INTO encumbered_magnitudes (operator, strategy, encumbered_magnitude, last_block)
                     VALUES ('0xop', '0xstrat', 700, 1)",
                    [],
                )?;
                record_pending_target(tx, &ALLOCATIONS, &subject(), 100, 50, 10)?;
                Ok(())
            })
            .unwrap();

        apply_matured(&store, &ALLOCATIONS, 50).unwrap();
        assert_eq!(state(&store).current, 100);

        let encumbered: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT encumbered_magnitude FROM encumbered_magnitudes WHERE operator = '0xop'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(encumbered, 0);
    }

    #[test]
    fn test_target_equal_to_current_clears_slot() {
        let (_file, store) = create_test_store();
        store
            .with_tx(|tx| {
                record_pending_target(tx, &ALLOCATIONS, &subject(), 300, 20, 10)?;
                record_pending_target(tx, &ALLOCATIONS, &subject(), 300, 40, 30)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(
            state(&store),
            DeferredState { current: 300, pending_delta: 0, effect_block: 0 }
        );
    }

    #[test]
    fn test_unknown_dependent_join_column_is_rejected() {
        const MISJOINED: DeferredTable = DeferredTable {
            dependent: Some(DependentCounter {
                table: "encumbered_magnitudes",
                key_columns: &[("operator", "operator"), ("strategy", "token")],
                counter: "encumbered_magnitude",
            }),
            ..ALLOCATIONS
        };

        let (_file, store) = create_test_store();
        store
            .with_tx(|tx| {
                record_pending_target(tx, &ALLOCATIONS, &subject(), 1_000, 10, 5)?;
                Ok(())
            })
            .unwrap();
        apply_matured(&store, &ALLOCATIONS, 10).unwrap();
        store
            .with_tx(|tx| {
                record_pending_target(tx, &ALLOCATIONS, &subject(), 400, 20, 15)?;
                Ok(())
            })
            .unwrap();

        let err = apply_matured(&store, &MISJOINED, 20).unwrap_err();
        assert!(matches!(err, SyncError::Schema(_)));
        // The failed pass rolled back: the decrease is still pending.
        assert_eq!(
            state(&store),
            DeferredState { current: 1_000, pending_delta: -600, effect_block: 20 }
        );
    }
}
