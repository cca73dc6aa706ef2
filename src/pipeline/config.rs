//! Pipeline configuration from environment variables

use super::types::{Address, ContractRole};
use super::windows::Granularity;
use std::env;
use std::str::FromStr;

/// Contract addresses the log source is filtered by.
#[derive(Debug, Clone)]
pub struct ContractAddresses {
    pub delegation_manager: Address,
    pub strategy_manager: Address,
    pub avs_directory: Address,
    pub eigen_pod_manager: Address,
    pub allocation_manager: Address,
    pub rewards_coordinator: Address,
}

impl ContractAddresses {
    pub fn address_for(&self, role: ContractRole) -> &Address {
        match role {
            ContractRole::DelegationManager => &self.delegation_manager,
            ContractRole::StrategyManager => &self.strategy_manager,
            ContractRole::AvsDirectory => &self.avs_directory,
            ContractRole::EigenPodManager => &self.eigen_pod_manager,
            ContractRole::AllocationManager => &self.allocation_manager,
            ContractRole::RewardsCoordinator => &self.rewards_coordinator,
        }
    }
}

impl Default for ContractAddresses {
    /// Ethereum mainnet deployments
    fn default() -> Self {
        let addr = |s: &str| Address::parse(s).unwrap_or_else(Address::zero);
        Self {
            delegation_manager: addr("0x39053D51B77DC0d36036Fc1fCc8Cb819df8Ef37A"),
            strategy_manager: addr("0x858646372CC42E1A627fcE94aa7A7033e7CF075A"),
            avs_directory: addr("0x135DDa560e946695d6f155dACaFC6f1F25C1F5AF"),
            eigen_pod_manager: addr("0x91E677b07F7AF907ec9a428aafA9fc14a0d3A338"),
            allocation_manager: addr("0x948a420b8CC1d6BFd0B6087C2E7c344a2CD0bc39"),
            rewards_coordinator: addr("0x7750d328b314EfFa365A0402CcfD489B80B0adda"),
        }
    }
}

/// Configuration for the sync runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Directory holding the numbered `*.sql` schema files
    pub schema_dir: String,

    /// JSON-RPC endpoint of the chain-log source
    pub rpc_url: String,

    /// First block scanned by an ingestion stream with no checkpoint
    pub genesis_block: u64,

    /// First timestamp aggregated by a metric family with no checkpoint
    pub genesis_timestamp: i64,

    /// Blocks per sub-range
    pub block_batch_size: u64,

    /// Per-request timeout for the log source
    pub log_source_timeout_ms: u64,

    /// Per-request timeout for metadata URI fetches
    pub metadata_timeout_ms: u64,

    /// Backoff applied to each `getLogs` call before the sub-range fails
    pub retry_max_attempts: u32,
    pub retry_initial_delay_secs: u64,
    pub retry_max_delay_secs: u64,

    /// Bucket size for metric families
    pub granularity: Granularity,

    pub contracts: ContractAddresses,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: "restakeflow.db".to_string(),
            schema_dir: "sql".to_string(),
            rpc_url: "http://localhost:8545".to_string(),
            genesis_block: 0,
            genesis_timestamp: 0,
            block_batch_size: 2_000,
            log_source_timeout_ms: 30_000,
            metadata_timeout_ms: 5_000,
            retry_max_attempts: 3,
            retry_initial_delay_secs: 1,
            retry_max_delay_secs: 30,
            granularity: Granularity::Hourly,
            contracts: ContractAddresses::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `RESTAKEFLOW_DB_PATH` (default: restakeflow.db)
    /// - `RESTAKEFLOW_SCHEMA_DIR` (default: sql)
    /// - `RPC_URL` (default: http://localhost:8545)
    /// - `GENESIS_BLOCK` (default: 0)
    /// - `GENESIS_TIMESTAMP` (default: 0)
    /// - `BLOCK_BATCH_SIZE` (default: 2000)
    /// - `LOG_SOURCE_TIMEOUT_MS` (default: 30000)
    /// - `METADATA_TIMEOUT_MS` (default: 5000)
    /// - `RETRY_MAX_ATTEMPTS` (default: 3)
    /// - `RETRY_INITIAL_DELAY_SECS` (default: 1)
    /// - `RETRY_MAX_DELAY_SECS` (default: 30)
    /// - `METRIC_GRANULARITY` (default: hourly)
    /// - `DELEGATION_MANAGER`, `STRATEGY_MANAGER`, `AVS_DIRECTORY`,
    ///   `EIGEN_POD_MANAGER`, `ALLOCATION_MANAGER`, `REWARDS_COORDINATOR`
    ///   (default: mainnet deployments)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let contracts = defaults.contracts.clone();

        Self {
            db_path: env::var("RESTAKEFLOW_DB_PATH").unwrap_or(defaults.db_path),
            schema_dir: env::var("RESTAKEFLOW_SCHEMA_DIR").unwrap_or(defaults.schema_dir),
            rpc_url: env::var("RPC_URL").unwrap_or(defaults.rpc_url),
            genesis_block: env_or("GENESIS_BLOCK", defaults.genesis_block),
            genesis_timestamp: env_or("GENESIS_TIMESTAMP", defaults.genesis_timestamp),
            block_batch_size: env_or("BLOCK_BATCH_SIZE", defaults.block_batch_size),
            log_source_timeout_ms: env_or("LOG_SOURCE_TIMEOUT_MS", defaults.log_source_timeout_ms),
            metadata_timeout_ms: env_or("METADATA_TIMEOUT_MS", defaults.metadata_timeout_ms),
            retry_max_attempts: env_or("RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts),
            retry_initial_delay_secs: env_or(
                "RETRY_INITIAL_DELAY_SECS",
                defaults.retry_initial_delay_secs,
            ),
            retry_max_delay_secs: env_or("RETRY_MAX_DELAY_SECS", defaults.retry_max_delay_secs),
            granularity: env_or("METRIC_GRANULARITY", defaults.granularity),
            contracts: ContractAddresses {
                delegation_manager: env_address("DELEGATION_MANAGER", contracts.delegation_manager),
                strategy_manager: env_address("STRATEGY_MANAGER", contracts.strategy_manager),
                avs_directory: env_address("AVS_DIRECTORY", contracts.avs_directory),
                eigen_pod_manager: env_address("EIGEN_POD_MANAGER", contracts.eigen_pod_manager),
                allocation_manager: env_address("ALLOCATION_MANAGER", contracts.allocation_manager),
                rewards_coordinator: env_address(
                    "REWARDS_COORDINATOR",
                    contracts.rewards_coordinator,
                ),
            },
        }
    }
}

/// Parse `name` if set; unset keeps the default silently, unparsable warns.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => parse_or(name, &raw, default),
        Err(_) => default,
    }
}

fn parse_or<T: FromStr>(name: &str, raw: &str, default: T) -> T {
    match raw.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            log::warn!("⚠️  Invalid value for {}: {:?}, using default", name, raw);
            default
        }
    }
}

fn env_address(name: &str, default: Address) -> Address {
    match env::var(name) {
        Ok(raw) => Address::parse(&raw).unwrap_or_else(|| {
            log::warn!("⚠️  Invalid address for {}: {:?}, using default", name, raw);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_or_falls_back() {
        assert_eq!(parse_or("X", "250", 10u64), 250);
        assert_eq!(parse_or("X", " 7 ", 10u64), 7);
        assert_eq!(parse_or("X", "-5", 10u64), 10);
        assert_eq!(parse_or("X", "soon", Granularity::Hourly), Granularity::Hourly);
        assert_eq!(parse_or("X", "daily", Granularity::Hourly), Granularity::Daily);
    }

    #[test]
    fn test_env_config() {
        // Single test touches the process environment; tests run in parallel.
        env::remove_var("RESTAKEFLOW_DB_PATH");
        env::remove_var("BLOCK_BATCH_SIZE");
        env::remove_var("METRIC_GRANULARITY");
        env::remove_var("DELEGATION_MANAGER");

        let config = PipelineConfig::from_env();
        assert_eq!(config.db_path, "restakeflow.db");
        assert_eq!(config.block_batch_size, 2_000);
        assert_eq!(config.granularity, Granularity::Hourly);
        assert_eq!(
            config.contracts.delegation_manager.as_str(),
            "0x39053d51b77dc0d36036fc1fcc8cb819df8ef37a"
        );

        env::set_var("RESTAKEFLOW_DB_PATH", "/tmp/restake-test.db");
        env::set_var("BLOCK_BATCH_SIZE", "500");
        env::set_var("METRIC_GRANULARITY", "daily");
        env::set_var("DELEGATION_MANAGER", "not-an-address");

        let config = PipelineConfig::from_env();
        assert_eq!(config.db_path, "/tmp/restake-test.db");
        assert_eq!(config.block_batch_size, 500);
        assert_eq!(config.granularity, Granularity::Daily);
        assert_eq!(
            config.contracts.delegation_manager.as_str(),
            "0x39053d51b77dc0d36036fc1fcc8cb819df8ef37a"
        );

        env::remove_var("RESTAKEFLOW_DB_PATH");
        env::remove_var("BLOCK_BATCH_SIZE");
        env::remove_var("METRIC_GRANULARITY");
        env::remove_var("DELEGATION_MANAGER");
    }
}
