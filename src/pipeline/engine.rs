//! Sync engine - the one operation exposed to schedulers
//!
//! `SyncRunner::run(stream, request)` runs one logical stream to completion
//! (or failure) and reports what it did. Three kinds of stream share it:
//!
//! ```text
//! Ingest(kind)      checkpoint = last committed block
//!     BlockWindows ─► getLogs per event kind (JoinSet, retried)
//!                  ─► block_time fill ─► normalize ─► sort ─► merge
//!                  ─► metadata prefetch
//!                  ─► one transaction: materialize + checkpoint
//!
//! Reconcile         checkpoint = head block of the last pass
//!     one transaction: mature pending allocation deltas + checkpoint
//!
//! Metrics(family)   checkpoint = end of the last closed bucket
//!     until capped by the slowest source stream's checkpoint
//!     one transaction: aggregate closed buckets + checkpoint
//! ```
//!
//! Sub-ranges of one stream are strictly sequential. A failed sub-range
//! leaves its checkpoint where it was; everything before it stays
//! committed. Re-running is always safe since every write is idempotent.

use super::aggregation::aggregate_family;
use super::checkpoint::{reset_checkpoint, set_checkpoint, CheckpointStore};
use super::config::PipelineConfig;
use super::db::Store;
use super::deferred::{apply_matured_in, ALLOCATIONS};
use super::materializer::{materialize, MaterializeMode, MaterializeStats};
use super::merge::merge_streams;
use super::normalizer::normalize_all;
use super::sinks::ApplyContext;
use super::types::{CanonicalEvent, EventKind, EventPayload, MetricFamily, RawLog, StreamId, StreamKind};
use super::valuation::Valuation;
use super::windows::BlockWindows;
use crate::error::{Result, SyncError};
use crate::streamer_core::error_handler::{retry_with_backoff, ExponentialBackoff};
use crate::streamer_core::log_source::{LogFilter, LogSource};
use crate::streamer_core::metadata::MetadataSource;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::task::JoinSet;

/// What to run. The unit of `to` and `range` follows the stream: blocks for
/// ingestion and reconciliation, unix seconds for metric families.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncRequest {
    /// Upper bound; defaults to the chain head (ingest, reconcile) or to
    /// what the source streams have committed (metrics)
    pub to: Option<i64>,
    /// Explicit `[from, to]` backfill override, ignoring the checkpoint
    pub range: Option<(i64, i64)>,
    /// `FullRebuild` clears owned state and replays from genesis, so an
    /// ingest stream rejects it together with `range`; for metrics it backfills
    pub mode: MaterializeMode,
}

impl SyncRequest {
    pub fn up_to(to: i64) -> Self {
        Self {
            to: Some(to),
            ..Self::default()
        }
    }
}

/// Summary of one `run`, printed as JSON by the runtime.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub stream: String,
    pub checkpoint_key: String,
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub sub_ranges: usize,
    pub events_applied: usize,
    pub duplicates: usize,
    pub buckets_written: usize,
    pub matured: usize,
    /// Cursor stored after the run
    pub checkpoint: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    fn start(id: &StreamId) -> Self {
        let now = Utc::now();
        Self {
            stream: id.to_string(),
            checkpoint_key: id.checkpoint_key(),
            from: None,
            to: None,
            sub_ranges: 0,
            events_applied: 0,
            duplicates: 0,
            buckets_written: 0,
            matured: 0,
            checkpoint: None,
            started_at: now,
            finished_at: now,
        }
    }

    fn add_stats(&mut self, stats: MaterializeStats) {
        self.sub_ranges += 1;
        self.events_applied += stats.applied;
        self.duplicates += stats.duplicates;
    }
}

/// Drives every stream against one store and one log source.
pub struct SyncRunner {
    store: Store,
    source: Arc<dyn LogSource>,
    metadata: Option<Arc<dyn MetadataSource>>,
    checkpoints: CheckpointStore,
    config: PipelineConfig,
}

impl SyncRunner {
    pub fn new(store: Store, source: Arc<dyn LogSource>, config: PipelineConfig) -> Self {
        let checkpoints = CheckpointStore::new(store.clone(), config.genesis_block, config.genesis_timestamp);
        Self {
            store,
            source,
            metadata: None,
            checkpoints,
            config,
        }
    }

    /// Resolve metadata URIs for operator and AVS rows.
    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataSource>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Run `id` to completion or to its first failing sub-range.
    pub async fn run(&self, id: StreamId, request: SyncRequest) -> Result<SyncReport> {
        let mut report = SyncReport::start(&id);
        log::info!("🚀 Sync {} ({:?})", id, request.mode);

        let outcome = match id {
            StreamId::Ingest(stream) => self.run_ingest(stream, request, &mut report).await,
            StreamId::Metrics(family) => self.run_metrics(family, request, &mut report).await,
            StreamId::Reconcile => self.run_reconcile(request, &mut report).await,
        };

        report.checkpoint = self.checkpoints.get_stored(&id)?;
        report.finished_at = Utc::now();

        match outcome {
            Ok(()) => {
                log::info!(
                    "✅ {} done: {} sub-ranges, {} applied, {} buckets, checkpoint {:?}",
                    id,
                    report.sub_ranges,
                    report.events_applied,
                    report.buckets_written,
                    report.checkpoint
                );
                Ok(report)
            }
            Err(e) => {
                log::error!("❌ {} failed at checkpoint {:?}: {}", id, report.checkpoint, e);
                Err(e)
            }
        }
    }

    /// One pass over every stream up to a single head: creator streams,
    /// then dependent streams, then reconciliation, then metric families.
    /// A failing phase stops the pass before later phases run.
    pub async fn run_all(self: Arc<Self>, to: Option<u64>) -> Result<Vec<SyncReport>> {
        let head = match to {
            Some(block) => block,
            None => self.head().await?,
        };
        log::info!("🔄 Full pass up to block {}", head);

        let request = SyncRequest::up_to(head as i64);
        let creators: Vec<StreamId> = StreamKind::ALL
            .iter()
            .filter(|s| s.is_creator())
            .map(|s| StreamId::Ingest(*s))
            .collect();
        let dependents: Vec<StreamId> = StreamKind::ALL
            .iter()
            .filter(|s| !s.is_creator())
            .map(|s| StreamId::Ingest(*s))
            .collect();
        let families: Vec<StreamId> = MetricFamily::ALL.iter().map(|f| StreamId::Metrics(*f)).collect();

        let mut reports = Vec::new();
        reports.extend(Arc::clone(&self).run_phase(creators, request).await?);
        reports.extend(Arc::clone(&self).run_phase(dependents, request).await?);
        reports.push(self.run(StreamId::Reconcile, request).await?);
        reports.extend(Arc::clone(&self).run_phase(families, SyncRequest::default()).await?);
        Ok(reports)
    }

    /// Run independent streams concurrently, one task each.
    async fn run_phase(self: Arc<Self>, ids: Vec<StreamId>, request: SyncRequest) -> Result<Vec<SyncReport>> {
        let mut set = JoinSet::new();
        for id in ids {
            let runner = Arc::clone(&self);
            set.spawn(async move { runner.run(id, request).await });
        }

        let mut reports = Vec::new();
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined.map_err(SyncError::from).and_then(|r| r) {
                Ok(report) => reports.push(report),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                reports.sort_by(|a, b| a.stream.cmp(&b.stream));
                Ok(reports)
            }
        }
    }

    async fn run_ingest(&self, stream: StreamKind, request: SyncRequest, report: &mut SyncReport) -> Result<()> {
        let rebuild = request.mode == MaterializeMode::FullRebuild;
        // A rebuild clears every owned row, so it must replay from genesis.
        if let (true, Some((from, to))) = (rebuild, request.range) {
            return Err(SyncError::Config(format!(
                "{}: full rebuild cannot be limited to blocks [{}, {}]",
                stream.as_str(),
                from,
                to
            )));
        }
        let id = StreamId::Ingest(stream);
        let stored = self.checkpoints.get_stored(&id)?;

        let (from, to) = match request.range {
            Some((from, to)) => (from.max(0) as u64, to.max(0) as u64),
            None => {
                let to = match request.to {
                    Some(to) => to.max(0) as u64,
                    None => self.head().await?,
                };
                let from = match stored {
                    Some(cursor) if !rebuild => (cursor + 1).max(0) as u64,
                    _ => self.config.genesis_block,
                };
                (from, to)
            }
        };
        report.from = Some(from as i64);
        report.to = Some(to as i64);

        if from > to {
            log::info!("   {} up to date at block {}", stream.as_str(), to);
            return Ok(());
        }

        for (i, (lo, hi)) in BlockWindows::new(from, to, self.config.block_batch_size).enumerate() {
            let mode = if rebuild && i == 0 {
                MaterializeMode::FullRebuild
            } else {
                MaterializeMode::Incremental
            };
            let advance = request.range.is_none() || stored.map_or(true, |c| hi as i64 > c);
            let stats = self.sync_range(stream, lo, hi, mode, advance).await?;
            report.add_stats(stats);
        }
        Ok(())
    }

    /// Fetch, order and materialize one sub-range, committing its events
    /// and (when `advance`) its checkpoint together.
    pub async fn sync_range(
        &self,
        stream: StreamKind,
        from: u64,
        to: u64,
        mode: MaterializeMode,
        advance: bool,
    ) -> Result<MaterializeStats> {
        if mode == MaterializeMode::FullRebuild && from != self.config.genesis_block {
            return Err(SyncError::Config(format!(
                "{}: full rebuild must start at genesis block {}, not {}",
                stream.as_str(),
                self.config.genesis_block,
                from
            )));
        }
        let fetched = self.fetch_stream_logs(stream, from, to).await?;

        let mut per_kind = Vec::with_capacity(fetched.len());
        for (kind, mut raws) in fetched {
            self.fill_block_times(&mut raws).await?;
            let mut events = normalize_all(&raws, kind);
            events.sort_by(|a, b| a.cmp_position(b));
            per_kind.push(events);
        }
        let events = merge_streams(per_kind);
        let ctx = self.prefetch_metadata(&events).await;

        let key = StreamId::Ingest(stream).checkpoint_key();
        let stats = self.store.with_tx(|tx| {
            if mode == MaterializeMode::FullRebuild {
                reset_checkpoint(tx, &key)?;
            }
            let stats = materialize(tx, stream, &events, mode, &ctx)?;
            if advance {
                set_checkpoint(tx, &key, to as i64)?;
            }
            Ok(stats)
        })?;

        log::info!(
            "📊 {} [{}, {}]: {} applied, {} duplicates",
            stream.as_str(),
            from,
            to,
            stats.applied,
            stats.duplicates
        );
        Ok(stats)
    }

    /// `getLogs` for every kind feeding `stream`, issued concurrently.
    async fn fetch_stream_logs(&self, stream: StreamKind, from: u64, to: u64) -> Result<Vec<(EventKind, Vec<RawLog>)>> {
        let mut set = JoinSet::new();
        for kind in stream.kinds() {
            let kind = *kind;
            let source = Arc::clone(&self.source);
            let backoff = ExponentialBackoff::from_config(&self.config);
            let filter = LogFilter {
                addresses: vec![self.config.contracts.address_for(kind.contract()).clone()],
                topic0s: vec![kind.topic0().to_string()],
                from_block: from,
                to_block: to,
            };
            set.spawn(async move {
                let what = format!("getLogs {} [{}, {}]", kind.as_str(), from, to);
                let raws = retry_with_backoff(backoff, &what, || source.get_logs(&filter)).await?;
                Ok::<_, SyncError>((kind, raws))
            });
        }

        let mut fetched = Vec::new();
        while let Some(joined) = set.join_next().await {
            fetched.push(joined??);
        }
        fetched.sort_by_key(|(kind, _)| *kind);
        Ok(fetched)
    }

    /// Resolve `block_time` for logs that arrived without it. A block whose
    /// timestamp cannot be fetched fails the sub-range.
    async fn fill_block_times(&self, raws: &mut [RawLog]) -> Result<()> {
        let missing: BTreeSet<u64> = raws
            .iter()
            .filter(|r| r.block_time.is_none() && !r.removed)
            .filter_map(|r| r.block_number)
            .collect();

        let mut times = HashMap::with_capacity(missing.len());
        for block in missing {
            times.insert(block, self.block_time(block).await?);
        }

        for raw in raws.iter_mut().filter(|r| r.block_time.is_none()) {
            if let Some(block) = raw.block_number {
                raw.block_time = times.get(&block).copied();
            }
        }
        Ok(())
    }

    async fn prefetch_metadata(&self, events: &[CanonicalEvent]) -> ApplyContext {
        let mut ctx = ApplyContext::default();
        let Some(metadata) = &self.metadata else {
            return ctx;
        };

        let uris: BTreeSet<String> = events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::OperatorMetadataUriUpdated { metadata_uri, .. }
                | EventPayload::AvsMetadataUriUpdated { metadata_uri, .. } => Some(metadata_uri.clone()),
                _ => None,
            })
            .collect();
        if uris.is_empty() {
            return ctx;
        }

        let mut set = JoinSet::new();
        for uri in uris {
            let metadata = Arc::clone(metadata);
            set.spawn(async move {
                let doc = metadata.fetch_metadata(&uri).await;
                (uri, doc)
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((uri, Some(doc))) => {
                    ctx.metadata.insert(uri, doc);
                }
                Ok((uri, None)) => log::debug!("No metadata for {}", uri),
                Err(e) => log::warn!("⚠️  Metadata task failed: {}", e),
            }
        }
        ctx
    }

    async fn run_reconcile(&self, request: SyncRequest, report: &mut SyncReport) -> Result<()> {
        let head = match request.range.map(|(_, to)| to).or(request.to) {
            Some(to) => to.max(0) as u64,
            None => self.head().await?,
        };
        report.to = Some(head as i64);

        let key = StreamId::Reconcile.checkpoint_key();
        let matured = self.store.with_immediate_tx(|tx| {
            let matured = apply_matured_in(tx, &ALLOCATIONS, head)?;
            set_checkpoint(tx, &key, head as i64)?;
            Ok(matured)
        })?;
        report.sub_ranges = 1;
        report.matured = matured;
        Ok(())
    }

    async fn run_metrics(&self, family: MetricFamily, request: SyncRequest, report: &mut SyncReport) -> Result<()> {
        let id = StreamId::Metrics(family);
        let Some(committed) = self.committed_source_time(family).await? else {
            log::info!("⏳ {}: source streams have no checkpoint yet", family.as_str());
            return Ok(());
        };

        let requested = request.range.map(|(_, to)| to).or(request.to);
        let until = requested.map_or(committed, |t| t.min(committed));
        let start = match request.range {
            Some((from, _)) => Some(from),
            None => self
                .checkpoints
                .get_stored(&id)?
                .or_else(|| (self.config.genesis_timestamp > 0).then_some(self.config.genesis_timestamp)),
        };
        let backfill = request.mode == MaterializeMode::FullRebuild;
        let granularity = self.config.granularity;

        let key = id.checkpoint_key();
        let aggregated = self.store.with_tx(|tx| {
            if backfill {
                reset_checkpoint(tx, &key)?;
            }
            let valuation = Valuation::load(tx)?;
            let aggregated = aggregate_family(tx, family, granularity, start, until, backfill, &valuation)?;
            if let Some(agg) = &aggregated {
                set_checkpoint(tx, &key, agg.to)?;
            }
            Ok(aggregated)
        })?;

        match aggregated {
            Some(agg) => {
                report.from = Some(agg.from);
                report.to = Some(agg.to);
                report.sub_ranges = agg.windows;
                report.events_applied = agg.events;
                report.buckets_written = agg.buckets_written;
            }
            None => log::info!("   {} has no closed bucket to aggregate", family.as_str()),
        }
        Ok(())
    }

    /// Block time of the least advanced source stream's checkpoint. Metric
    /// buckets never close past what every source has committed.
    async fn committed_source_time(&self, family: MetricFamily) -> Result<Option<i64>> {
        let mut slowest: Option<i64> = None;
        for stream in family.source_streams() {
            match self.checkpoints.get_stored(&StreamId::Ingest(*stream))? {
                Some(block) => slowest = Some(slowest.map_or(block, |s| s.min(block))),
                None => return Ok(None),
            }
        }
        match slowest {
            Some(block) => Ok(Some(self.block_time(block.max(0) as u64).await?)),
            None => Ok(None),
        }
    }

    async fn head(&self) -> Result<u64> {
        let backoff = ExponentialBackoff::from_config(&self.config);
        retry_with_backoff(backoff, "getBlockNumber", || self.source.get_block_number()).await
    }

    async fn block_time(&self, block: u64) -> Result<i64> {
        let backoff = ExponentialBackoff::from_config(&self.config);
        let what = format!("getBlock {}", block);
        retry_with_backoff(backoff, &what, || self.source.get_block_timestamp(block)).await
    }
}
