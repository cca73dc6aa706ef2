//! # Restaking event-log sync pipeline
//!
//! Keeps a SQLite view of restaking protocol state and its hourly/daily
//! metric series in step with the chain's event logs.
//!
//! ## Architecture
//!
//! ```text
//! LogSource (getLogs)
//!     ↓
//! normalizer      raw log → CanonicalEvent (malformed logs skipped)
//!     ↓
//! merge           per-kind streams → one (block, tx, log) order
//!     ↓
//! materializer    event_log dedupe + per-stream sinks
//!     ↓                         ↘
//! deferred        pending → effective allocation magnitudes
//!     ↓
//! aggregation     closed buckets of running series
//!     ↓
//! valuation       shares → underlying → ETH
//!     ↓
//! yields          reward APY per strategy
//! ```
//!
//! `engine::SyncRunner` drives all of it, one checkpointed stream at a
//! time.
//!
//! ## Streams
//!
//! Creator streams (`operators`, `strategies`, `pods`) must run before the
//! streams that reference what they create; events that reference an
//! unknown entity are dropped. Metric families only ever aggregate buckets
//! their source streams have fully committed.

pub mod abi;
pub mod aggregation;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod deferred;
pub mod engine;
pub mod materializer;
pub mod merge;
pub mod normalizer;
pub mod sinks;
pub mod types;
pub mod valuation;
pub mod windows;
pub mod yields;

pub use checkpoint::CheckpointStore;
pub use config::PipelineConfig;
pub use db::Store;
pub use engine::{SyncReport, SyncRequest, SyncRunner};
pub use materializer::MaterializeMode;
pub use types::{CanonicalEvent, EventKind, EventPayload, MetricFamily, RawLog, StreamId, StreamKind};
pub use windows::Granularity;
