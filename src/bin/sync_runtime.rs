//! Sync Runtime - run one stream (or every stream) to completion
//!
//! Usage:
//!   cargo run --release --bin sync_runtime -- <stream> [--to N] [--from N] [--rebuild]
//!
//! `<stream>` is an ingestion stream (`operators`, `deposits`, ...), a
//! checkpoint key (`sync:deposits`, `metrics:tvl`), `reconcile`, or `all`.
//! `--from` requires `--to` and bypasses the stored checkpoint. Units are
//! blocks, except for metric families which take unix seconds.
//!
//! The report is printed to stdout as JSON; logs go to stderr.
//!
//! Environment variables: see `PipelineConfig::from_env`.

use dotenv::dotenv;
use log::info;
use restakeflow::pipeline::{MaterializeMode, PipelineConfig, Store, StreamId, SyncRequest, SyncRunner};
use restakeflow::streamer_core::{HttpMetadataFetcher, JsonRpcLogSource};
use std::sync::Arc;

const USAGE: &str = "Usage: sync_runtime <stream|all> [--to N] [--from N] [--rebuild]";

enum Target {
    All,
    One(StreamId),
}

struct RunArgs {
    target: Target,
    request: SyncRequest,
}

impl RunArgs {
    fn from_args() -> Result<Self, Box<dyn std::error::Error>> {
        let args: Vec<String> = std::env::args().skip(1).collect();

        let name = args
            .first()
            .filter(|a| !a.starts_with("--"))
            .ok_or(USAGE)?;
        let target = if name == "all" {
            Target::All
        } else {
            Target::One(name.parse::<StreamId>()?)
        };

        let flag = |flag: &str| -> Result<Option<i64>, Box<dyn std::error::Error>> {
            match args.windows(2).find(|w| w[0] == flag) {
                Some(w) => Ok(Some(
                    w[1].parse::<i64>()
                        .map_err(|_| format!("Invalid {} value: {}", flag, w[1]))?,
                )),
                None => Ok(None),
            }
        };
        let to = flag("--to")?;
        let from = flag("--from")?;

        let range = match (from, to) {
            (Some(from), Some(to)) => Some((from, to)),
            (Some(_), None) => return Err(format!("--from requires --to. {}", USAGE).into()),
            _ => None,
        };

        let mode = if args.iter().any(|a| a == "--rebuild") {
            MaterializeMode::FullRebuild
        } else {
            MaterializeMode::Incremental
        };
        if mode == MaterializeMode::FullRebuild && range.is_some() {
            return Err(format!("--rebuild replays from genesis and cannot take --from. {}", USAGE).into());
        }

        Ok(Self {
            target,
            request: SyncRequest { to, range, mode },
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args = RunArgs::from_args()?;
    let config = PipelineConfig::from_env();

    info!("🚀 Sync Runtime");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ RPC: {}", config.rpc_url);
    info!("   ├─ Batch size: {} blocks", config.block_batch_size);
    info!("   └─ Granularity: {}", config.granularity.as_str());

    info!("🔧 Initializing database...");
    let store = Store::open_and_migrate(&config.db_path, &config.schema_dir)?;
    info!("✅ Database initialized");

    let source = Arc::new(JsonRpcLogSource::new(&config.rpc_url, config.log_source_timeout_ms)?);
    let metadata = Arc::new(HttpMetadataFetcher::new(config.metadata_timeout_ms)?);
    let runner = Arc::new(SyncRunner::new(store, source, config).with_metadata(metadata));

    let reports = match args.target {
        Target::All => {
            let to = args.request.to.map(|b| b.max(0) as u64);
            runner.run_all(to).await?
        }
        Target::One(id) => vec![runner.run(id, args.request).await?],
    };

    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}
