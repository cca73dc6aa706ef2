//! Shared fixtures for the sync integration tests: an in-memory
//! `LogSource`, ABI word encoders and raw log builders.

#![allow(dead_code)]

use async_trait::async_trait;
use num_bigint::BigInt;
use restakeflow::pipeline::config::ContractAddresses;
use restakeflow::pipeline::types::{Address, EventKind, RawLog};
use restakeflow::pipeline::{PipelineConfig, Store, SyncRunner};
use restakeflow::streamer_core::{EntityMetadata, LogFilter, LogSource, MetadataSource};
use restakeflow::{Result, SyncError};
use rusqlite::types::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

pub const SCHEMA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/sql");

/// 2024-01-01T00:00:00Z, an hour and day boundary
pub const T0: i64 = 1_704_067_200;
pub const HOUR: i64 = 3_600;
/// Five minutes per block keeps a handful of blocks per hourly bucket
pub const BLOCK_SECONDS: i64 = 300;

pub fn addr(byte: u8) -> Address {
    Address::from_bytes(&[byte; 20])
}

pub fn eth(units: u64) -> BigInt {
    BigInt::from(units) * BigInt::from(10u64).pow(18)
}

pub fn word_n(v: u64) -> String {
    format!("{:064x}", v)
}

pub fn word_big(v: &BigInt) -> String {
    format!("{:0>64}", v.to_str_radix(16))
}

pub fn word_a(a: &Address) -> String {
    format!("{:0>64}", a.as_str().trim_start_matches("0x"))
}

pub fn topic_a(a: &Address) -> String {
    format!("0x{}", word_a(a))
}

/// Head-encoded `string` at offset 0x20 (single dynamic argument).
pub fn string_data(s: &str) -> Vec<String> {
    let bytes = hex::encode(s.as_bytes());
    let padded_len = s.len().div_ceil(32) * 64;
    vec![word_n(32), word_n(s.len() as u64), format!("{:0<width$}", bytes, width = padded_len)]
}

/// Raw log for `kind` emitted by its default contract. Block times are
/// filled in by `FakeLogSource` on delivery.
pub fn raw_log(kind: EventKind, topics: Vec<String>, data: Vec<String>, block: u64, tx_index: u64, log_index: u64) -> RawLog {
    let contract = ContractAddresses::default().address_for(kind.contract()).clone();
    let mut all = vec![kind.topic0().to_string()];
    all.extend(topics);
    RawLog {
        address: Some(contract.to_string()),
        topics: all,
        data: Some(format!("0x{}", data.concat())),
        block_number: Some(block),
        transaction_hash: Some(format!("0x{:032x}{:032x}", block, tx_index)),
        transaction_index: Some(tx_index),
        log_index: Some(log_index),
        block_time: None,
        removed: false,
    }
}

pub fn operator_registered(op: &Address, block: u64) -> RawLog {
    raw_log(EventKind::OperatorRegistered, vec![topic_a(op)], vec![word_a(&Address::zero())], block, 0, 0)
}

pub fn operator_metadata(op: &Address, uri: &str, block: u64) -> RawLog {
    raw_log(EventKind::OperatorMetadataUriUpdated, vec![topic_a(op)], string_data(uri), block, 0, 1)
}

pub fn deposit(staker: &Address, strategy: &Address, shares: &BigInt, block: u64, tx_index: u64) -> RawLog {
    raw_log(
        EventKind::Deposit,
        vec![],
        vec![word_a(staker), word_a(&addr(0x70)), word_a(strategy), word_big(shares)],
        block,
        tx_index,
        0,
    )
}

pub fn delegated(staker: &Address, op: &Address, block: u64, tx_index: u64) -> RawLog {
    raw_log(EventKind::StakerDelegated, vec![topic_a(staker), topic_a(op)], vec![], block, tx_index, 0)
}

pub fn undelegated(staker: &Address, op: &Address, block: u64, tx_index: u64) -> RawLog {
    raw_log(EventKind::StakerUndelegated, vec![topic_a(staker), topic_a(op)], vec![], block, tx_index, 0)
}

/// `WithdrawalQueued(bytes32, Withdrawal)` with a single strategy entry.
pub fn withdrawal_queued(root: u64, staker: &Address, op: &Address, strategy: &Address, shares: &BigInt, block: u64) -> RawLog {
    // tuple head: staker, delegatedTo, withdrawer, nonce, startBlock, strategies*, shares*
    let head_bytes = 7 * 32;
    let data = vec![
        word_n(root),
        word_n(64),
        word_a(staker),
        word_a(op),
        word_a(staker),
        word_n(0),
        word_n(block),
        word_n(head_bytes),
        word_n(head_bytes + 64),
        word_n(1),
        word_a(strategy),
        word_n(1),
        word_big(shares),
    ];
    raw_log(EventKind::WithdrawalQueued, vec![], data, block, 0, 0)
}

pub fn allocation_updated(
    op: &Address,
    avs: &Address,
    set_id: u32,
    strategy: &Address,
    magnitude: u64,
    effect_block: u64,
    block: u64,
) -> RawLog {
    raw_log(
        EventKind::AllocationUpdated,
        vec![],
        vec![
            word_a(op),
            word_a(avs),
            word_n(u64::from(set_id)),
            word_a(strategy),
            word_n(magnitude),
            word_n(effect_block),
        ],
        block,
        0,
        0,
    )
}

/// In-memory chain: logs are filtered like `eth_getLogs`, block `n` is
/// stamped `T0 + n * BLOCK_SECONDS`.
pub struct FakeLogSource {
    logs: Mutex<Vec<RawLog>>,
    head: AtomicU64,
    omit_block_time: AtomicBool,
    fail_from_block: Mutex<Option<u64>>,
    pub get_logs_calls: AtomicUsize,
    pub block_lookups: AtomicUsize,
}

impl FakeLogSource {
    pub fn new(head: u64) -> Self {
        Self {
            logs: Mutex::new(Vec::new()),
            head: AtomicU64::new(head),
            omit_block_time: AtomicBool::new(false),
            fail_from_block: Mutex::new(None),
            get_logs_calls: AtomicUsize::new(0),
            block_lookups: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, log: RawLog) {
        self.logs.lock().unwrap().push(log);
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// Deliver logs without `block_time`, as most providers do.
    pub fn omit_block_times(&self, omit: bool) {
        self.omit_block_time.store(omit, Ordering::SeqCst);
    }

    /// Fail every `getLogs` whose range reaches `block` or beyond.
    pub fn fail_from(&self, block: Option<u64>) {
        *self.fail_from_block.lock().unwrap() = block;
    }

    pub fn time_of(block: u64) -> i64 {
        T0 + block as i64 * BLOCK_SECONDS
    }
}

#[async_trait]
impl LogSource for FakeLogSource {
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>> {
        self.get_logs_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(block) = *self.fail_from_block.lock().unwrap() {
            if filter.to_block >= block {
                return Err(SyncError::Source(format!("injected failure at {}", block)));
            }
        }

        let omit = self.omit_block_time.load(Ordering::SeqCst);
        let logs = self.logs.lock().unwrap();
        Ok(logs
            .iter()
            .filter(|log| {
                let block = log.block_number.unwrap_or(u64::MAX);
                let address = log.address.clone().unwrap_or_default();
                block >= filter.from_block
                    && block <= filter.to_block
                    && filter.addresses.iter().any(|a| a.as_str().eq_ignore_ascii_case(&address))
                    && log
                        .topics
                        .first()
                        .is_some_and(|t| filter.topic0s.iter().any(|f| f.eq_ignore_ascii_case(t)))
            })
            .cloned()
            .map(|mut log| {
                log.block_time = match (omit, log.block_number) {
                    (false, Some(block)) => Some(Self::time_of(block)),
                    _ => None,
                };
                log
            })
            .collect())
    }

    async fn get_block_number(&self) -> Result<u64> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn get_block_timestamp(&self, number: u64) -> Result<i64> {
        self.block_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(Self::time_of(number))
    }
}

/// Metadata documents served from memory.
#[derive(Default)]
pub struct FakeMetadata {
    pub docs: HashMap<String, EntityMetadata>,
}

#[async_trait]
impl MetadataSource for FakeMetadata {
    async fn fetch_metadata(&self, uri: &str) -> Option<EntityMetadata> {
        self.docs.get(uri).cloned()
    }
}

pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        schema_dir: SCHEMA_DIR.to_string(),
        block_batch_size: 100,
        retry_max_attempts: 0,
        retry_initial_delay_secs: 0,
        retry_max_delay_secs: 0,
        ..PipelineConfig::default()
    }
}

pub struct Harness {
    pub _file: NamedTempFile,
    pub store: Store,
    pub source: Arc<FakeLogSource>,
    pub runner: Arc<SyncRunner>,
}

pub fn harness(head: u64) -> Harness {
    harness_with(head, test_config(), None)
}

pub fn harness_with(head: u64, config: PipelineConfig, metadata: Option<Arc<dyn MetadataSource>>) -> Harness {
    let file = NamedTempFile::new().unwrap();
    let store = Store::open_and_migrate(file.path().to_str().unwrap(), SCHEMA_DIR).unwrap();
    let source = Arc::new(FakeLogSource::new(head));
    let mut runner = SyncRunner::new(store.clone(), source.clone(), config);
    if let Some(metadata) = metadata {
        runner = runner.with_metadata(metadata);
    }
    Harness {
        _file: file,
        store,
        source,
        runner: Arc::new(runner),
    }
}

/// Every row of `tables`, rendered and sorted, for whole-state comparison.
pub fn snapshot(store: &Store, tables: &[&str]) -> Vec<String> {
    store
        .with_conn(|conn| {
            let mut out = Vec::new();
            for table in tables {
                let mut stmt = conn.prepare(&format!("SELECT * FROM {}", table))?;
                let columns = stmt.column_count();
                let mut rows: Vec<String> = stmt
                    .query_map([], |row| {
                        let values = (0..columns)
                            .map(|i| row.get::<_, Value>(i).map(|v| format!("{:?}", v)))
                            .collect::<rusqlite::Result<Vec<_>>>()?;
                        Ok(format!("{}: {}", table, values.join(", ")))
                    })?
                    .collect::<rusqlite::Result<_>>()?;
                rows.sort();
                out.extend(rows);
            }
            Ok(out)
        })
        .unwrap()
}

pub fn checkpoint(store: &Store, key: &str) -> Option<i64> {
    store
        .with_conn(|conn| restakeflow::pipeline::checkpoint::get_checkpoint(conn, key))
        .unwrap()
}
