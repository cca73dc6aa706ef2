//! Windowed aggregation engine
//!
//! Folds already-materialized events into sparse running series stored in
//! `metric_buckets`. Buckets are half-open `(start, end]` windows labelled by
//! `end`; an event exactly on a boundary belongs to the bucket that ends
//! there. Only closed buckets (`end <= floor(until)`) are written.
//!
//! Per key, `cumulative(n) = cumulative(n-1) + delta(n)`. The carry-forward
//! comes from `SeriesAccumulator`, seeded from the newest stored row at or
//! before the start of the run, so re-running a range rewrites identical
//! rows.

use super::materializer::{first_event_time, load_stream_events};
use super::merge::merge_streams;
use super::types::{Address, CanonicalEvent, EventPayload, MetricFamily};
use super::valuation::Valuation;
use super::windows::{CalendarWindows, Granularity};
use crate::error::{Result, SyncError};
use num_bigint::BigInt;
use num_traits::Zero;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::ops::{Add, Sub};
use std::str::FromStr;

/// Value type of a series: arbitrary-precision integers for shares and
/// counts, `Decimal` for ETH-denominated series.
pub trait MetricValue: Clone + Debug + PartialEq + Add<Output = Self> + Sub<Output = Self> {
    fn zero_value() -> Self;
    fn is_zero_value(&self) -> bool;
    fn parse_metric(text: &str) -> Option<Self>;
    fn to_metric_text(&self) -> String;
}

impl MetricValue for BigInt {
    fn zero_value() -> Self {
        BigInt::zero()
    }

    fn is_zero_value(&self) -> bool {
        self.is_zero()
    }

    fn parse_metric(text: &str) -> Option<Self> {
        text.parse().ok()
    }

    fn to_metric_text(&self) -> String {
        self.to_string()
    }
}

impl MetricValue for Decimal {
    fn zero_value() -> Self {
        Decimal::ZERO
    }

    fn is_zero_value(&self) -> bool {
        self.is_zero()
    }

    fn parse_metric(text: &str) -> Option<Self> {
        Decimal::from_str(text).ok()
    }

    fn to_metric_text(&self) -> String {
        self.normalize().to_string()
    }
}

/// One emitted bucket, values in their stored text form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketRow {
    pub metric: String,
    pub series_key: String,
    pub bucket_ts: i64,
    pub cumulative: String,
    pub delta: String,
}

/// Running per-key state of one metric across windows.
#[derive(Debug, Clone)]
pub struct SeriesAccumulator<V> {
    metric: &'static str,
    last: HashMap<String, V>,
    pending: BTreeMap<String, V>,
}

impl<V: MetricValue> SeriesAccumulator<V> {
    pub fn new(metric: &'static str) -> Self {
        Self {
            metric,
            last: HashMap::new(),
            pending: BTreeMap::new(),
        }
    }

    /// Seed every key with its newest stored cumulative at or before `at`.
    pub fn seed(conn: &Connection, metric: &'static str, granularity: Granularity, at: i64) -> Result<Self> {
        let mut acc = Self::new(metric);
        let mut stmt = conn.prepare(
            "SELECT series_key, cumulative FROM metric_buckets
             WHERE metric = ?1 AND granularity = ?2
               AND (series_key, bucket_ts) IN (
                   SELECT series_key, MAX(bucket_ts) FROM metric_buckets
                   WHERE metric = ?1 AND granularity = ?2 AND bucket_ts <= ?3
                   GROUP BY series_key)",
        )?;
        let rows = stmt.query_map(params![metric, granularity.as_str(), at], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (key, text) = row?;
            let value = V::parse_metric(&text)
                .ok_or_else(|| SyncError::Corrupt(format!("{} {} = {:?}", metric, key, text)))?;
            acc.last.insert(key, value);
        }
        Ok(acc)
    }

    pub fn metric(&self) -> &'static str {
        self.metric
    }

    /// Last known cumulative for `key`, zero if never seen.
    pub fn last(&self, key: &str) -> V {
        self.last.get(key).cloned().unwrap_or_else(V::zero_value)
    }

    /// Fold `delta` into the open bucket.
    pub fn add(&mut self, key: &str, delta: V) {
        let entry = self
            .pending
            .entry(key.to_string())
            .or_insert_with(V::zero_value);
        *entry = entry.clone() + delta;
    }

    /// Close the open bucket at `bucket_ts`, emitting one row per key with a
    /// non-zero delta.
    pub fn close(&mut self, bucket_ts: i64) -> Vec<BucketRow> {
        let pending = std::mem::take(&mut self.pending);
        let mut rows = Vec::with_capacity(pending.len());
        for (key, delta) in pending {
            if delta.is_zero_value() {
                continue;
            }
            let cumulative = self.last(&key) + delta.clone();
            rows.push(self.row(&key, bucket_ts, &cumulative, &delta));
            self.last.insert(key, cumulative);
        }
        rows
    }

    /// Record a level (not a delta) for `key` at `bucket_ts`; the delta is
    /// the difference from the previous level. `None` when unchanged.
    pub fn set(&mut self, key: &str, bucket_ts: i64, level: V) -> Option<BucketRow> {
        let delta = level.clone() - self.last(key);
        if delta.is_zero_value() {
            return None;
        }
        let row = self.row(key, bucket_ts, &level, &delta);
        self.last.insert(key.to_string(), level);
        Some(row)
    }

    fn row(&self, key: &str, bucket_ts: i64, cumulative: &V, delta: &V) -> BucketRow {
        BucketRow {
            metric: self.metric.to_string(),
            series_key: key.to_string(),
            bucket_ts,
            cumulative: cumulative.to_metric_text(),
            delta: delta.to_metric_text(),
        }
    }
}

/// Upsert bucket rows. Re-writing a bucket with identical values is a no-op
/// in effect.
pub fn write_buckets(conn: &Connection, granularity: Granularity, rows: &[BucketRow]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO metric_buckets (metric, series_key, granularity, bucket_ts, cumulative, delta)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(metric, series_key, granularity, bucket_ts) DO UPDATE SET
            cumulative = excluded.cumulative,
            delta = excluded.delta",
    )?;
    for row in rows {
        stmt.execute(params![
            row.metric,
            row.series_key,
            granularity.as_str(),
            row.bucket_ts,
            row.cumulative,
            row.delta
        ])?;
    }
    Ok(rows.len())
}

/// Remove every stored bucket of `metrics` at `granularity` (backfill).
pub fn clear_metrics(conn: &Connection, metrics: &[&str], granularity: Granularity) -> Result<usize> {
    let mut removed = 0;
    for metric in metrics {
        removed += conn.execute(
            "DELETE FROM metric_buckets WHERE metric = ?1 AND granularity = ?2",
            params![metric, granularity.as_str()],
        )?;
    }
    Ok(removed)
}

/// Stored series for one key, oldest bucket first.
pub fn load_series(
    conn: &Connection,
    metric: &str,
    series_key: &str,
    granularity: Granularity,
) -> Result<Vec<BucketRow>> {
    let mut stmt = conn.prepare(
        "SELECT bucket_ts, cumulative, delta FROM metric_buckets
         WHERE metric = ?1 AND series_key = ?2 AND granularity = ?3
         ORDER BY bucket_ts",
    )?;
    let rows = stmt.query_map(params![metric, series_key, granularity.as_str()], |row| {
        Ok(BucketRow {
            metric: metric.to_string(),
            series_key: series_key.to_string(),
            bucket_ts: row.get(0)?,
            cumulative: row.get(1)?,
            delta: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

/// Newest stored cumulative per key of `metric`.
pub fn latest_values<V: MetricValue>(
    conn: &Connection,
    metric: &'static str,
    granularity: Granularity,
) -> Result<HashMap<String, V>> {
    let acc = SeriesAccumulator::<V>::seed(conn, metric, granularity, i64::MAX)?;
    Ok(acc.last)
}

/// Per-family accumulators and the fold from events to key-space deltas.
enum Folder {
    Tvl {
        shares: SeriesAccumulator<BigInt>,
        deposits: SeriesAccumulator<BigInt>,
        withdrawals: SeriesAccumulator<BigInt>,
        tvl_eth: SeriesAccumulator<Decimal>,
    },
    OperatorShares {
        pairs: SeriesAccumulator<BigInt>,
        strategies: SeriesAccumulator<BigInt>,
    },
    Stakers {
        operators: SeriesAccumulator<BigInt>,
    },
}

impl Folder {
    fn seed(conn: &Connection, family: MetricFamily, granularity: Granularity, at: i64) -> Result<Self> {
        Ok(match family {
            MetricFamily::Tvl => Folder::Tvl {
                shares: SeriesAccumulator::seed(conn, "strategy_shares", granularity, at)?,
                deposits: SeriesAccumulator::seed(conn, "strategy_deposit_shares", granularity, at)?,
                withdrawals: SeriesAccumulator::seed(conn, "strategy_withdrawal_shares", granularity, at)?,
                tvl_eth: SeriesAccumulator::seed(conn, "strategy_tvl_eth", granularity, at)?,
            },
            MetricFamily::OperatorShares => Folder::OperatorShares {
                pairs: SeriesAccumulator::seed(conn, "operator_strategy_shares", granularity, at)?,
                strategies: SeriesAccumulator::seed(conn, "strategy_delegated_shares", granularity, at)?,
            },
            MetricFamily::Stakers => Folder::Stakers {
                operators: SeriesAccumulator::seed(conn, "operator_stakers", granularity, at)?,
            },
        })
    }

    fn fold(&mut self, event: &CanonicalEvent) {
        match (self, &event.payload) {
            (
                Folder::Tvl { shares, deposits, .. },
                EventPayload::Deposit { strategy, shares: amount, .. },
            ) => {
                shares.add(strategy.as_str(), amount.clone());
                deposits.add(strategy.as_str(), amount.clone());
            }
            (
                Folder::Tvl { shares, withdrawals, .. },
                EventPayload::WithdrawalQueued { strategies, .. },
            ) => {
                for entry in strategies {
                    shares.add(entry.strategy.as_str(), -entry.shares.clone());
                    withdrawals.add(entry.strategy.as_str(), entry.shares.clone());
                }
            }
            (
                Folder::OperatorShares { pairs, strategies },
                EventPayload::OperatorSharesIncreased { operator, strategy, shares, .. },
            ) => {
                pairs.add(&pair_key(operator, strategy), shares.clone());
                strategies.add(strategy.as_str(), shares.clone());
            }
            (
                Folder::OperatorShares { pairs, strategies },
                EventPayload::OperatorSharesDecreased { operator, strategy, shares, .. },
            ) => {
                pairs.add(&pair_key(operator, strategy), -shares.clone());
                strategies.add(strategy.as_str(), -shares.clone());
            }
            (Folder::Stakers { operators }, EventPayload::StakerDelegated { operator, .. }) => {
                operators.add(operator.as_str(), BigInt::from(1));
            }
            (Folder::Stakers { operators }, EventPayload::StakerUndelegated { operator, .. }) => {
                operators.add(operator.as_str(), BigInt::from(-1));
            }
            _ => {}
        }
    }

    fn close(&mut self, bucket_ts: i64, valuation: &Valuation) -> Vec<BucketRow> {
        match self {
            Folder::Tvl { shares, deposits, withdrawals, tvl_eth } => {
                let share_rows = shares.close(bucket_ts);
                let mut rows = Vec::with_capacity(share_rows.len() * 2);
                for row in &share_rows {
                    let Some(strategy) = Address::parse(&row.series_key) else {
                        continue;
                    };
                    let eth = valuation.shares_to_eth(&strategy, &shares.last(&row.series_key), bucket_ts);
                    rows.extend(tvl_eth.set(&row.series_key, bucket_ts, eth));
                }
                rows.extend(share_rows);
                rows.extend(deposits.close(bucket_ts));
                rows.extend(withdrawals.close(bucket_ts));
                rows
            }
            Folder::OperatorShares { pairs, strategies } => {
                let mut rows = pairs.close(bucket_ts);
                rows.extend(strategies.close(bucket_ts));
                rows
            }
            Folder::Stakers { operators } => operators.close(bucket_ts),
        }
    }
}

/// Series key of the operator×strategy key space.
pub fn pair_key(operator: &Address, strategy: &Address) -> String {
    format!("{}:{}", operator, strategy)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregationReport {
    pub family: MetricFamily,
    /// Exclusive start of the aggregated range
    pub from: i64,
    /// Inclusive end; the new checkpoint
    pub to: i64,
    pub windows: usize,
    pub events: usize,
    pub buckets_written: usize,
}

/// Aggregate one metric family over closed buckets up to `until`.
///
/// `start` is the exclusive lower bound (a stored checkpoint or an explicit
/// override) and is snapped down to a bucket boundary. With `backfill`, or
/// when there is no `start`, the run begins at the bucket holding the
/// family's first logged event; `backfill` also clears the family's rows.
/// Returns `None` when there is nothing to aggregate.
pub fn aggregate_family(
    conn: &Connection,
    family: MetricFamily,
    granularity: Granularity,
    start: Option<i64>,
    until: i64,
    backfill: bool,
    valuation: &Valuation,
) -> Result<Option<AggregationReport>> {
    let to = granularity.floor(until);

    if backfill {
        let removed = clear_metrics(conn, family.metrics(), granularity)?;
        log::info!("🔄 Backfill {}: cleared {} buckets", family.as_str(), removed);
    }

    let from = match (start, backfill) {
        (Some(s), false) => granularity.floor(s),
        _ => match first_event_time(conn, family.source_streams())? {
            Some(first) => granularity.ceil(first) - granularity.seconds(),
            None => return Ok(None),
        },
    };
    if from >= to {
        return Ok(None);
    }

    let streams = family
        .source_streams()
        .iter()
        .map(|s| load_stream_events(conn, *s, from, to))
        .collect::<Result<Vec<_>>>()?;
    let events = merge_streams(streams);

    let mut folder = Folder::seed(conn, family, granularity, from)?;
    let mut rows = Vec::new();
    let mut windows = 0;
    let mut cursor = 0;

    for (_, end) in CalendarWindows::new(from, to, granularity) {
        windows += 1;
        while cursor < events.len() && events[cursor].block_time <= end {
            folder.fold(&events[cursor]);
            cursor += 1;
        }
        rows.extend(folder.close(end, valuation));
    }

    let written = write_buckets(conn, granularity, &rows)?;
    log::info!(
        "📊 {} ({}, {}]: {} events, {} windows, {} buckets",
        family.as_str(),
        from,
        to,
        events.len(),
        windows,
        written
    );

    Ok(Some(AggregationReport {
        family,
        from,
        to,
        windows,
        events: events.len(),
        buckets_written: written,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::test_support::create_test_store;
    use crate::pipeline::db::Store;
    use crate::pipeline::materializer::record_event;
    use crate::pipeline::types::{StrategyShares, StreamKind};

    const HOUR: i64 = 3_600;
    // 2024-01-01T00:00:00Z
    const T0: i64 = 1_704_067_200;

    fn addr(byte: u8) -> Address {
        Address::from_bytes(&[byte; 20])
    }

    fn log_event(store: &Store, stream: StreamKind, block: u64, time: i64, payload: EventPayload) {
        let event = CanonicalEvent {
            address: addr(0xde),
            tx_hash: format!("0x{:064x}", block),
            tx_index: 0,
            log_index: 0,
            block_number: block,
            block_time: time,
            payload,
        };
        store.with_conn(|conn| record_event(conn, stream, &event)).unwrap();
    }

    fn deposit(store: &Store, block: u64, time: i64, strategy: u8, shares: i64) {
        log_event(
            store,
            StreamKind::Deposits,
            block,
            time,
            EventPayload::Deposit {
                staker: addr(1),
                token: addr(2),
                strategy: addr(strategy),
                shares: BigInt::from(shares),
            },
        );
    }

    fn withdraw(store: &Store, block: u64, time: i64, strategy: u8, shares: i64) {
        log_event(
            store,
            StreamKind::Withdrawals,
            block,
            time,
            EventPayload::WithdrawalQueued {
                withdrawal_root: format!("0x{:064x}", block),
                staker: addr(1),
                delegated_to: addr(9),
                withdrawer: addr(1),
                nonce: BigInt::from(0),
                start_block: block,
                strategies: vec![StrategyShares {
                    strategy: addr(strategy),
                    shares: BigInt::from(shares),
                }],
            },
        );
    }

    fn run(store: &Store, family: MetricFamily, start: Option<i64>, until: i64, backfill: bool) -> Option<AggregationReport> {
        store
            .with_tx(|tx| {
                aggregate_family(tx, family, Granularity::Hourly, start, until, backfill, &Valuation::default())
            })
            .unwrap()
    }

    fn series(store: &Store, metric: &str, key: &str) -> Vec<(i64, String, String)> {
        store
            .with_conn(|conn| load_series(conn, metric, key, Granularity::Hourly))
            .unwrap()
            .into_iter()
            .map(|r| (r.bucket_ts, r.cumulative, r.delta))
            .collect()
    }

    #[test]
    fn test_accumulator_carry_forward_and_sparse_output() {
        let mut acc = SeriesAccumulator::<BigInt>::new("m");
        acc.add("a", BigInt::from(5));
        acc.add("b", BigInt::from(3));
        acc.add("b", BigInt::from(-3));
        let rows = acc.close(100);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cumulative, "5");

        assert!(acc.close(200).is_empty());

        acc.add("a", BigInt::from(-2));
        let rows = acc.close(300);
        assert_eq!((rows[0].cumulative.as_str(), rows[0].delta.as_str()), ("3", "-2"));
    }

    #[test]
    fn test_accumulator_level_series() {
        let mut acc = SeriesAccumulator::<Decimal>::new("eth");
        let row = acc.set("s", 10, Decimal::from(200)).unwrap();
        assert_eq!((row.cumulative.as_str(), row.delta.as_str()), ("200", "200"));
        assert!(acc.set("s", 20, Decimal::from(200)).is_none());
        let row = acc.set("s", 30, Decimal::from(120)).unwrap();
        assert_eq!(row.delta, "-80");
    }

    #[test]
    fn test_boundary_event_belongs_to_closing_bucket() {
        let (_file, store) = create_test_store();
        // exactly on T0 + HOUR: bucket (T0, T0+HOUR]
        deposit(&store, 1, T0 + HOUR, 3, 10);
        // one second later: next bucket
        deposit(&store, 2, T0 + HOUR + 1, 3, 5);

        run(&store, MetricFamily::Tvl, Some(T0), T0 + 3 * HOUR, false).unwrap();

        let key = addr(3).to_string();
        assert_eq!(
            series(&store, "strategy_shares", &key),
            vec![
                (T0 + HOUR, "10".to_string(), "10".to_string()),
                (T0 + 2 * HOUR, "15".to_string(), "5".to_string()),
            ]
        );
    }

    #[test]
    fn test_event_at_from_is_excluded() {
        let (_file, store) = create_test_store();
        deposit(&store, 1, T0, 3, 10);
        deposit(&store, 2, T0 + 60, 3, 1);

        run(&store, MetricFamily::Tvl, Some(T0), T0 + HOUR, false).unwrap();
        let key = addr(3).to_string();
        assert_eq!(
            series(&store, "strategy_shares", &key),
            vec![(T0 + HOUR, "1".to_string(), "1".to_string())]
        );
    }

    #[test]
    fn test_open_bucket_is_not_written() {
        let (_file, store) = create_test_store();
        deposit(&store, 1, T0 + 100, 3, 10);

        assert!(run(&store, MetricFamily::Tvl, Some(T0), T0 + HOUR - 1, false).is_none());
        assert!(series(&store, "strategy_shares", &addr(3).to_string()).is_empty());
    }

    #[test]
    fn test_conservation_and_incremental_continuation() {
        let (_file, store) = create_test_store();
        deposit(&store, 1, T0 + 10, 3, 100);
        withdraw(&store, 2, T0 + HOUR + 10, 3, 40);
        deposit(&store, 3, T0 + 5 * HOUR, 3, 7);

        let first = run(&store, MetricFamily::Tvl, None, T0 + 2 * HOUR, false).unwrap();
        assert_eq!(first.from, T0);
        assert_eq!(first.to, T0 + 2 * HOUR);
        run(&store, MetricFamily::Tvl, Some(first.to), T0 + 6 * HOUR, false).unwrap();

        let key = addr(3).to_string();
        let rows = series(&store, "strategy_shares", &key);
        let total: BigInt = rows.iter().map(|(_, _, d)| d.parse::<BigInt>().unwrap()).sum();
        assert_eq!(total, BigInt::from(67));
        assert_eq!(rows.last().unwrap().1, "67");

        assert_eq!(
            series(&store, "strategy_withdrawal_shares", &key),
            vec![(T0 + 2 * HOUR, "40".to_string(), "40".to_string())]
        );
    }

    #[test]
    fn test_rerun_and_backfill_are_idempotent() {
        let (_file, store) = create_test_store();
        deposit(&store, 1, T0 + 10, 3, 100);
        withdraw(&store, 2, T0 + HOUR + 10, 3, 40);

        run(&store, MetricFamily::Tvl, None, T0 + 3 * HOUR, false);
        let key = addr(3).to_string();
        let once = series(&store, "strategy_shares", &key);

        run(&store, MetricFamily::Tvl, Some(T0), T0 + 3 * HOUR, false);
        assert_eq!(series(&store, "strategy_shares", &key), once);

        run(&store, MetricFamily::Tvl, Some(T0 + 2 * HOUR), T0 + 3 * HOUR, true);
        assert_eq!(series(&store, "strategy_shares", &key), once);
    }

    #[test]
    fn test_staker_and_operator_share_families() {
        let (_file, store) = create_test_store();
        let op = addr(0xaa);
        log_event(&store, StreamKind::Delegations, 1, T0 + 5, EventPayload::StakerDelegated { staker: addr(1), operator: op.clone() });
        log_event(&store, StreamKind::Delegations, 2, T0 + 6, EventPayload::StakerDelegated { staker: addr(2), operator: op.clone() });
        log_event(&store, StreamKind::Delegations, 3, T0 + HOUR + 1, EventPayload::StakerUndelegated { staker: addr(1), operator: op.clone() });
        log_event(
            &store,
            StreamKind::OperatorShares,
            4,
            T0 + 7,
            EventPayload::OperatorSharesIncreased {
                operator: op.clone(),
                staker: addr(1),
                strategy: addr(3),
                shares: BigInt::from(50),
            },
        );

        run(&store, MetricFamily::Stakers, None, T0 + 2 * HOUR, false).unwrap();
        run(&store, MetricFamily::OperatorShares, None, T0 + 2 * HOUR, false).unwrap();

        assert_eq!(
            series(&store, "operator_stakers", op.as_str()),
            vec![
                (T0 + HOUR, "2".to_string(), "2".to_string()),
                (T0 + 2 * HOUR, "1".to_string(), "-1".to_string()),
            ]
        );
        assert_eq!(
            series(&store, "operator_strategy_shares", &pair_key(&op, &addr(3))),
            vec![(T0 + HOUR, "50".to_string(), "50".to_string())]
        );
        assert_eq!(
            series(&store, "strategy_delegated_shares", &addr(3).to_string()).len(),
            1
        );
    }
}
