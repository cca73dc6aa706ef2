//! Core data structures for the sync engine
//!
//! - `Address`: canonical lowercase 0x-prefixed address
//! - `EventKind` / `StreamKind` / `MetricFamily` / `StreamId`: dispatch tags
//! - `CanonicalEvent` / `EventPayload`: normalized, immutable event records
//! - `RawLog`: a log as delivered by the chain-log source

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Lowercase `0x`-prefixed, 40 hex character address.
///
/// Identity is case-insensitive: every constructor lowercases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Parse an address-like string. Returns `None` on anything that is not
    /// exactly 20 bytes of hex (with or without `0x`).
    pub fn parse(s: &str) -> Option<Self> {
        let hex_part = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
        if hex_part.len() != 40 || !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(format!("0x{}", hex_part.to_ascii_lowercase())))
    }

    pub fn from_bytes(bytes: &[u8; 20]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }

    pub fn zero() -> Self {
        Self::from_bytes(&[0u8; 20])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Address {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Address::parse(&value).ok_or_else(|| format!("invalid address: {}", value))
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

/// Contract that emits a given event kind. Actual addresses come from config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContractRole {
    DelegationManager,
    StrategyManager,
    AvsDirectory,
    EigenPodManager,
    AllocationManager,
    RewardsCoordinator,
}

/// Explicit event tag. One normalizer function exists per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    OperatorRegistered,
    OperatorMetadataUriUpdated,
    AvsMetadataUriUpdated,
    OperatorAvsRegistrationStatusUpdated,
    StrategyAddedToDepositWhitelist,
    PodDeployed,
    Deposit,
    StakerDelegated,
    StakerUndelegated,
    OperatorSharesIncreased,
    OperatorSharesDecreased,
    WithdrawalQueued,
    WithdrawalCompleted,
    AllocationUpdated,
    EncumberedMagnitudeUpdated,
    AvsRewardsSubmissionCreated,
}

impl EventKind {
    pub const ALL: [EventKind; 16] = [
        EventKind::OperatorRegistered,
        EventKind::OperatorMetadataUriUpdated,
        EventKind::AvsMetadataUriUpdated,
        EventKind::OperatorAvsRegistrationStatusUpdated,
        EventKind::StrategyAddedToDepositWhitelist,
        EventKind::PodDeployed,
        EventKind::Deposit,
        EventKind::StakerDelegated,
        EventKind::StakerUndelegated,
        EventKind::OperatorSharesIncreased,
        EventKind::OperatorSharesDecreased,
        EventKind::WithdrawalQueued,
        EventKind::WithdrawalCompleted,
        EventKind::AllocationUpdated,
        EventKind::EncumberedMagnitudeUpdated,
        EventKind::AvsRewardsSubmissionCreated,
    ];

    /// Solidity event signature
    pub fn signature(&self) -> &'static str {
        match self {
            EventKind::OperatorRegistered => "OperatorRegistered(address,address)",
            EventKind::OperatorMetadataUriUpdated => "OperatorMetadataURIUpdated(address,string)",
            EventKind::AvsMetadataUriUpdated => "AVSMetadataURIUpdated(address,string)",
            EventKind::OperatorAvsRegistrationStatusUpdated => {
                "OperatorAVSRegistrationStatusUpdated(address,address,uint8)"
            }
            EventKind::StrategyAddedToDepositWhitelist => "StrategyAddedToDepositWhitelist(address)",
            EventKind::PodDeployed => "PodDeployed(address,address)",
            EventKind::Deposit => "Deposit(address,address,address,uint256)",
            EventKind::StakerDelegated => "StakerDelegated(address,address)",
            EventKind::StakerUndelegated => "StakerUndelegated(address,address)",
            EventKind::OperatorSharesIncreased => {
                "OperatorSharesIncreased(address,address,address,uint256)"
            }
            EventKind::OperatorSharesDecreased => {
                "OperatorSharesDecreased(address,address,address,uint256)"
            }
            EventKind::WithdrawalQueued => {
                "WithdrawalQueued(bytes32,(address,address,address,uint256,uint32,address[],uint256[]))"
            }
            EventKind::WithdrawalCompleted => "WithdrawalCompleted(bytes32)",
            EventKind::AllocationUpdated => {
                "AllocationUpdated(address,(address,uint32),address,uint64,uint32)"
            }
            EventKind::EncumberedMagnitudeUpdated => {
                "EncumberedMagnitudeUpdated(address,address,uint64)"
            }
            EventKind::AvsRewardsSubmissionCreated => {
                "AVSRewardsSubmissionCreated(address,uint256,bytes32,((address,uint96)[],address,uint256,uint32,uint32))"
            }
        }
    }

    /// keccak256 of `signature()`, i.e. the log's topic0
    pub fn topic0(&self) -> &'static str {
        match self {
            EventKind::OperatorRegistered => {
                "0xa453db612af59e5521d6ab9284dc3e2d06af286eb1b1b7b771fce4716c19f2c1"
            }
            EventKind::OperatorMetadataUriUpdated => {
                "0x02a919ed0e2acad1dd90f17ef2fa4ae5462ee1339170034a8531cca4b6708090"
            }
            EventKind::AvsMetadataUriUpdated => {
                "0xa89c1dc243d8908a96dd84944bcc97d6bc6ac00dd78e20621576be6a3c943713"
            }
            EventKind::OperatorAvsRegistrationStatusUpdated => {
                "0xf0952b1c65271d819d39983d2abb044b9cace59bcc4d4dd389f586ebdcb15b41"
            }
            EventKind::StrategyAddedToDepositWhitelist => {
                "0x0c35b17d91c96eb2751cd456e1252f42a386e524ef9ff26ecc9950859fdc04fe"
            }
            EventKind::PodDeployed => {
                "0x21c99d0db02213c32fff5b05cf0a718ab5f858802b91498f80d82270289d856a"
            }
            EventKind::Deposit => {
                "0x7cfff908a4b583f36430b25d75964c458d8ede8a99bd61be750e97ee1b2f3a96"
            }
            EventKind::StakerDelegated => {
                "0xc3ee9f2e5fda98e8066a1f745b2df9285f416fe98cf2559cd21484b3d8743304"
            }
            EventKind::StakerUndelegated => {
                "0xfee30966a256b71e14bc0ebfc94315e28ef4a97a7131a9e2b7a310a73af44676"
            }
            EventKind::OperatorSharesIncreased => {
                "0x1ec042c965e2edd7107b51188ee0f383e22e76179041ab3a9d18ff151405166c"
            }
            EventKind::OperatorSharesDecreased => {
                "0x6909600037b75d7b4733aedd815442b5ec018a827751c832aaff64eba5d6d2dd"
            }
            EventKind::WithdrawalQueued => {
                "0x9009ab153e8014fbfb02f2217f5cde7aa7f9ad734ae85ca3ee3f4ca2fdd499f9"
            }
            EventKind::WithdrawalCompleted => {
                "0xc97098c2f658800b4df29001527f7324bcdffcf6e8751a699ab920a1eced5b1d"
            }
            EventKind::AllocationUpdated => {
                "0x1487af5418c47ee5ea45ef4a93398668120890774a9e13487e61e9dc3baf76dd"
            }
            EventKind::EncumberedMagnitudeUpdated => {
                "0xacf9095feb3a370c9cf692421c69ef320d4db5c66e6a7d29c7694eb02364fc55"
            }
            EventKind::AvsRewardsSubmissionCreated => {
                "0x450a367a380c4e339e5ae7340c8464ef27af7781ad9945cfe8abd828f89e6281"
            }
        }
    }

    pub fn contract(&self) -> ContractRole {
        match self {
            EventKind::OperatorRegistered
            | EventKind::OperatorMetadataUriUpdated
            | EventKind::StakerDelegated
            | EventKind::StakerUndelegated
            | EventKind::OperatorSharesIncreased
            | EventKind::OperatorSharesDecreased
            | EventKind::WithdrawalQueued
            | EventKind::WithdrawalCompleted => ContractRole::DelegationManager,
            EventKind::StrategyAddedToDepositWhitelist | EventKind::Deposit => {
                ContractRole::StrategyManager
            }
            EventKind::AvsMetadataUriUpdated | EventKind::OperatorAvsRegistrationStatusUpdated => {
                ContractRole::AvsDirectory
            }
            EventKind::PodDeployed => ContractRole::EigenPodManager,
            EventKind::AllocationUpdated | EventKind::EncumberedMagnitudeUpdated => {
                ContractRole::AllocationManager
            }
            EventKind::AvsRewardsSubmissionCreated => ContractRole::RewardsCoordinator,
        }
    }

    pub fn stream(&self) -> StreamKind {
        match self {
            EventKind::OperatorRegistered | EventKind::OperatorMetadataUriUpdated => {
                StreamKind::Operators
            }
            EventKind::AvsMetadataUriUpdated | EventKind::OperatorAvsRegistrationStatusUpdated => {
                StreamKind::Avs
            }
            EventKind::StrategyAddedToDepositWhitelist => StreamKind::Strategies,
            EventKind::PodDeployed => StreamKind::Pods,
            EventKind::Deposit => StreamKind::Deposits,
            EventKind::StakerDelegated | EventKind::StakerUndelegated => StreamKind::Delegations,
            EventKind::OperatorSharesIncreased | EventKind::OperatorSharesDecreased => {
                StreamKind::OperatorShares
            }
            EventKind::WithdrawalQueued | EventKind::WithdrawalCompleted => StreamKind::Withdrawals,
            EventKind::AllocationUpdated | EventKind::EncumberedMagnitudeUpdated => {
                StreamKind::Allocations
            }
            EventKind::AvsRewardsSubmissionCreated => StreamKind::Rewards,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OperatorRegistered => "operator_registered",
            EventKind::OperatorMetadataUriUpdated => "operator_metadata_uri_updated",
            EventKind::AvsMetadataUriUpdated => "avs_metadata_uri_updated",
            EventKind::OperatorAvsRegistrationStatusUpdated => {
                "operator_avs_registration_status_updated"
            }
            EventKind::StrategyAddedToDepositWhitelist => "strategy_added_to_deposit_whitelist",
            EventKind::PodDeployed => "pod_deployed",
            EventKind::Deposit => "deposit",
            EventKind::StakerDelegated => "staker_delegated",
            EventKind::StakerUndelegated => "staker_undelegated",
            EventKind::OperatorSharesIncreased => "operator_shares_increased",
            EventKind::OperatorSharesDecreased => "operator_shares_decreased",
            EventKind::WithdrawalQueued => "withdrawal_queued",
            EventKind::WithdrawalCompleted => "withdrawal_completed",
            EventKind::AllocationUpdated => "allocation_updated",
            EventKind::EncumberedMagnitudeUpdated => "encumbered_magnitude_updated",
            EventKind::AvsRewardsSubmissionCreated => "avs_rewards_submission_created",
        }
    }
}

/// Canonical ingestion stream. Each owns one sink and one checkpoint key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Operators,
    Avs,
    Strategies,
    Pods,
    Deposits,
    Delegations,
    OperatorShares,
    Withdrawals,
    Allocations,
    Rewards,
}

impl StreamKind {
    pub const ALL: [StreamKind; 10] = [
        StreamKind::Operators,
        StreamKind::Avs,
        StreamKind::Strategies,
        StreamKind::Pods,
        StreamKind::Deposits,
        StreamKind::Delegations,
        StreamKind::OperatorShares,
        StreamKind::Withdrawals,
        StreamKind::Allocations,
        StreamKind::Rewards,
    ];

    /// Event kinds merged into this stream, in tiebreak order.
    pub fn kinds(&self) -> &'static [EventKind] {
        match self {
            StreamKind::Operators => &[
                EventKind::OperatorRegistered,
                EventKind::OperatorMetadataUriUpdated,
            ],
            StreamKind::Avs => &[
                EventKind::AvsMetadataUriUpdated,
                EventKind::OperatorAvsRegistrationStatusUpdated,
            ],
            StreamKind::Strategies => &[EventKind::StrategyAddedToDepositWhitelist],
            StreamKind::Pods => &[EventKind::PodDeployed],
            StreamKind::Deposits => &[EventKind::Deposit],
            StreamKind::Delegations => &[EventKind::StakerDelegated, EventKind::StakerUndelegated],
            StreamKind::OperatorShares => &[
                EventKind::OperatorSharesIncreased,
                EventKind::OperatorSharesDecreased,
            ],
            StreamKind::Withdrawals => &[EventKind::WithdrawalQueued, EventKind::WithdrawalCompleted],
            StreamKind::Allocations => &[
                EventKind::AllocationUpdated,
                EventKind::EncumberedMagnitudeUpdated,
            ],
            StreamKind::Rewards => &[EventKind::AvsRewardsSubmissionCreated],
        }
    }

    /// Streams that create entities other streams reference. They run
    /// before the dependents in `SyncRunner::run_all`.
    pub fn is_creator(&self) -> bool {
        matches!(
            self,
            StreamKind::Operators | StreamKind::Strategies | StreamKind::Pods
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Operators => "operators",
            StreamKind::Avs => "avs",
            StreamKind::Strategies => "strategies",
            StreamKind::Pods => "pods",
            StreamKind::Deposits => "deposits",
            StreamKind::Delegations => "delegations",
            StreamKind::OperatorShares => "operator_shares",
            StreamKind::Withdrawals => "withdrawals",
            StreamKind::Allocations => "allocations",
            StreamKind::Rewards => "rewards",
        }
    }
}

/// Time-series family computed from already-materialized events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricFamily {
    Tvl,
    OperatorShares,
    Stakers,
}

impl MetricFamily {
    pub const ALL: [MetricFamily; 3] = [
        MetricFamily::Tvl,
        MetricFamily::OperatorShares,
        MetricFamily::Stakers,
    ];

    /// Materialized streams whose events feed this family.
    pub fn source_streams(&self) -> &'static [StreamKind] {
        match self {
            MetricFamily::Tvl => &[StreamKind::Deposits, StreamKind::Withdrawals],
            MetricFamily::OperatorShares => &[StreamKind::OperatorShares],
            MetricFamily::Stakers => &[StreamKind::Delegations],
        }
    }

    /// Metric names this family writes to `metric_buckets`.
    pub fn metrics(&self) -> &'static [&'static str] {
        match self {
            MetricFamily::Tvl => &[
                "strategy_shares",
                "strategy_deposit_shares",
                "strategy_withdrawal_shares",
                "strategy_tvl_eth",
            ],
            MetricFamily::OperatorShares => {
                &["operator_strategy_shares", "strategy_delegated_shares"]
            }
            MetricFamily::Stakers => &["operator_stakers"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricFamily::Tvl => "tvl",
            MetricFamily::OperatorShares => "operator_shares",
            MetricFamily::Stakers => "stakers",
        }
    }
}

/// Logical stream addressed by the exposed sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum StreamId {
    Ingest(StreamKind),
    Metrics(MetricFamily),
    /// Phase 2 of the deferred-effect applier (allocations)
    Reconcile,
}

impl StreamId {
    /// Every stream the runtime knows about.
    pub fn all() -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = StreamKind::ALL.iter().map(|k| StreamId::Ingest(*k)).collect();
        ids.push(StreamId::Reconcile);
        ids.extend(MetricFamily::ALL.iter().map(|m| StreamId::Metrics(*m)));
        ids
    }

    pub fn checkpoint_key(&self) -> String {
        match self {
            StreamId::Ingest(kind) => format!("sync:{}", kind.as_str()),
            StreamId::Metrics(family) => format!("metrics:{}", family.as_str()),
            StreamId::Reconcile => "reconcile:allocations".to_string(),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.checkpoint_key())
    }
}

impl FromStr for StreamId {
    type Err = String;

    /// Accepts `operators`, `sync:operators`, `metrics:tvl`, `reconcile`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "reconcile" || s == "reconcile:allocations" {
            return Ok(StreamId::Reconcile);
        }
        if let Some(name) = s.strip_prefix("metrics:") {
            return MetricFamily::ALL
                .iter()
                .find(|m| m.as_str() == name)
                .map(|m| StreamId::Metrics(*m))
                .ok_or_else(|| format!("unknown metric family: {}", name));
        }
        let name = s.strip_prefix("sync:").unwrap_or(&s);
        StreamKind::ALL
            .iter()
            .find(|k| k.as_str() == name)
            .map(|k| StreamId::Ingest(*k))
            .ok_or_else(|| format!("unknown stream: {}", name))
    }
}

/// Position of a log in the chain. Derived `Ord` compares fields in
/// declaration order, which is canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogPosition {
    pub block_number: u64,
    pub tx_index: u64,
    pub log_index: u64,
}

/// Arbitrary-precision amounts serialize as decimal strings.
pub mod amount_serde {
    use num_bigint::BigInt;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigInt, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigInt, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<BigInt>().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyShares {
    pub strategy: Address,
    #[serde(with = "amount_serde")]
    pub shares: BigInt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyMultiplier {
    pub strategy: Address,
    /// 1e18 fixed point
    #[serde(with = "amount_serde")]
    pub multiplier: BigInt,
}

/// Kind-specific body of a canonical event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    OperatorRegistered {
        operator: Address,
        delegation_approver: Address,
    },
    OperatorMetadataUriUpdated {
        operator: Address,
        metadata_uri: String,
    },
    AvsMetadataUriUpdated {
        avs: Address,
        metadata_uri: String,
    },
    OperatorAvsRegistrationStatusUpdated {
        operator: Address,
        avs: Address,
        registered: bool,
    },
    StrategyAddedToDepositWhitelist {
        strategy: Address,
    },
    PodDeployed {
        pod: Address,
        owner: Address,
    },
    Deposit {
        staker: Address,
        token: Address,
        strategy: Address,
        #[serde(with = "amount_serde")]
        shares: BigInt,
    },
    StakerDelegated {
        staker: Address,
        operator: Address,
    },
    StakerUndelegated {
        staker: Address,
        operator: Address,
    },
    OperatorSharesIncreased {
        operator: Address,
        staker: Address,
        strategy: Address,
        #[serde(with = "amount_serde")]
        shares: BigInt,
    },
    OperatorSharesDecreased {
        operator: Address,
        staker: Address,
        strategy: Address,
        #[serde(with = "amount_serde")]
        shares: BigInt,
    },
    WithdrawalQueued {
        withdrawal_root: String,
        staker: Address,
        delegated_to: Address,
        withdrawer: Address,
        #[serde(with = "amount_serde")]
        nonce: BigInt,
        start_block: u64,
        strategies: Vec<StrategyShares>,
    },
    WithdrawalCompleted {
        withdrawal_root: String,
    },
    AllocationUpdated {
        operator: Address,
        avs: Address,
        operator_set_id: u32,
        strategy: Address,
        magnitude: u64,
        effect_block: u64,
    },
    EncumberedMagnitudeUpdated {
        operator: Address,
        strategy: Address,
        encumbered_magnitude: u64,
    },
    AvsRewardsSubmissionCreated {
        avs: Address,
        #[serde(with = "amount_serde")]
        submission_nonce: BigInt,
        submission_hash: String,
        strategies: Vec<StrategyMultiplier>,
        token: Address,
        #[serde(with = "amount_serde")]
        amount: BigInt,
        start_timestamp: u64,
        duration: u32,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::OperatorRegistered { .. } => EventKind::OperatorRegistered,
            EventPayload::OperatorMetadataUriUpdated { .. } => EventKind::OperatorMetadataUriUpdated,
            EventPayload::AvsMetadataUriUpdated { .. } => EventKind::AvsMetadataUriUpdated,
            EventPayload::OperatorAvsRegistrationStatusUpdated { .. } => {
                EventKind::OperatorAvsRegistrationStatusUpdated
            }
            EventPayload::StrategyAddedToDepositWhitelist { .. } => {
                EventKind::StrategyAddedToDepositWhitelist
            }
            EventPayload::PodDeployed { .. } => EventKind::PodDeployed,
            EventPayload::Deposit { .. } => EventKind::Deposit,
            EventPayload::StakerDelegated { .. } => EventKind::StakerDelegated,
            EventPayload::StakerUndelegated { .. } => EventKind::StakerUndelegated,
            EventPayload::OperatorSharesIncreased { .. } => EventKind::OperatorSharesIncreased,
            EventPayload::OperatorSharesDecreased { .. } => EventKind::OperatorSharesDecreased,
            EventPayload::WithdrawalQueued { .. } => EventKind::WithdrawalQueued,
            EventPayload::WithdrawalCompleted { .. } => EventKind::WithdrawalCompleted,
            EventPayload::AllocationUpdated { .. } => EventKind::AllocationUpdated,
            EventPayload::EncumberedMagnitudeUpdated { .. } => EventKind::EncumberedMagnitudeUpdated,
            EventPayload::AvsRewardsSubmissionCreated { .. } => {
                EventKind::AvsRewardsSubmissionCreated
            }
        }
    }
}

/// Normalized event record. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    /// Emitting contract
    pub address: Address,
    pub tx_hash: String,
    pub tx_index: u64,
    pub log_index: u64,
    pub block_number: u64,
    /// Unix seconds
    pub block_time: i64,
    pub payload: EventPayload,
}

impl CanonicalEvent {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn stream(&self) -> StreamKind {
        self.kind().stream()
    }

    /// Merge ordering key
    pub fn ordering_key(&self) -> (u64, u64) {
        (self.block_number, self.tx_index)
    }

    pub fn position(&self) -> LogPosition {
        LogPosition {
            block_number: self.block_number,
            tx_index: self.tx_index,
            log_index: self.log_index,
        }
    }

    /// Total order used when reading back from the store.
    pub fn cmp_position(&self, other: &CanonicalEvent) -> Ordering {
        self.position().cmp(&other.position())
    }
}

/// Log as delivered by a `LogSource`. Every field is optional because
/// providers omit fields for pending or malformed logs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: Option<String>,
    pub topics: Vec<String>,
    pub data: Option<String>,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<String>,
    pub transaction_index: Option<u64>,
    pub log_index: Option<u64>,
    pub block_time: Option<i64>,
    /// Set by the provider when the log was dropped by a reorg
    pub removed: bool,
}
