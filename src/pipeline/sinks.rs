//! Per-stream sinks
//!
//! Each sink owns a disjoint set of tables. Projections are guarded by the
//! `(block, tx_index, log_index)` position of the last writing event so an
//! older event never overwrites a newer value; counters are re-derived
//! from their source rows after every change.
//!
//! Events that reference an entity no earlier stage has materialized
//! (unknown operator, unknown withdrawal) are dropped with a debug log.

use super::db::{amount_from_sql, amount_to_sql};
use super::deferred::{self, ALLOCATIONS};
use super::materializer::Sink;
use super::types::{Address, CanonicalEvent, EventPayload, StreamKind};
use crate::error::Result;
use crate::streamer_core::metadata::EntityMetadata;
use num_bigint::BigInt;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;

/// Data a sink needs that had to be fetched before the transaction opened.
#[derive(Debug, Clone, Default)]
pub struct ApplyContext {
    /// Parsed metadata documents keyed by URI
    pub metadata: HashMap<String, EntityMetadata>,
}

impl ApplyContext {
    pub fn metadata_for(&self, uri: &str) -> Option<&EntityMetadata> {
        self.metadata.get(uri)
    }
}

pub fn sink_for(stream: StreamKind) -> Box<dyn Sink> {
    match stream {
        StreamKind::Operators => Box::new(OperatorsSink),
        StreamKind::Avs => Box::new(AvsSink),
        StreamKind::Strategies => Box::new(StrategiesSink),
        StreamKind::Pods => Box::new(PodsSink),
        StreamKind::Deposits => Box::new(DepositsSink),
        StreamKind::Delegations => Box::new(DelegationsSink),
        StreamKind::OperatorShares => Box::new(OperatorSharesSink),
        StreamKind::Withdrawals => Box::new(WithdrawalsSink),
        StreamKind::Allocations => Box::new(AllocationsSink),
        StreamKind::Rewards => Box::new(RewardsSink),
    }
}

fn pos(event: &CanonicalEvent) -> (i64, i64, i64) {
    (
        event.block_number as i64,
        event.tx_index as i64,
        event.log_index as i64,
    )
}

fn exists(conn: &Connection, table: &str, address: &Address) -> Result<bool> {
    let sql = format!("SELECT 1 FROM {} WHERE address = ?1", table);
    Ok(conn
        .query_row(&sql, [address.as_str()], |_| Ok(()))
        .optional()?
        .is_some())
}

fn referential_gap(event: &CanonicalEvent, what: &str, key: &str) {
    log::debug!(
        "Dropping {} at block {}: unknown {} {}",
        event.kind().as_str(),
        event.block_number,
        what,
        key
    );
}

/// `table.col += delta` for a TEXT amount keyed by two columns.
fn add_amount(
    conn: &Connection,
    table: &str,
    keys: [(&str, &str); 2],
    col: &str,
    delta: &BigInt,
) -> Result<BigInt> {
    let [(k1, v1), (k2, v2)] = keys;
    let select = format!("SELECT {col} FROM {table} WHERE {k1} = ?1 AND {k2} = ?2");
    let current: Option<String> = conn
        .query_row(&select, params![v1, v2], |row| row.get(0))
        .optional()?;
    let next = match current {
        Some(text) => amount_from_sql(&text)? + delta,
        None => delta.clone(),
    };

    let upsert = format!(
        "INSERT INTO {table} ({k1}, {k2}, {col}) VALUES (?1, ?2, ?3)
         ON CONFLICT({k1}, {k2}) DO UPDATE SET {col} = excluded.{col}"
    );
    conn.execute(&upsert, params![v1, v2, amount_to_sql(&next)])?;
    Ok(next)
}

fn metadata_columns(ctx: &ApplyContext, uri: &str) -> [Option<String>; 5] {
    match ctx.metadata_for(uri) {
        Some(m) => [
            m.name.clone(),
            m.website.clone(),
            m.description.clone(),
            m.logo.clone(),
            m.twitter.clone(),
        ],
        None => [None, None, None, None, None],
    }
}

pub struct OperatorsSink;

impl Sink for OperatorsSink {
    fn stream(&self) -> StreamKind {
        StreamKind::Operators
    }

    fn owned_tables(&self) -> &'static [&'static str] {
        &["operators"]
    }

    fn apply(&self, conn: &Connection, event: &CanonicalEvent, ctx: &ApplyContext) -> Result<()> {
        let (b, t, l) = pos(event);
        match &event.payload {
            EventPayload::OperatorRegistered { operator, delegation_approver } => {
                conn.execute(
                    "INSERT INTO operators
                        (address, delegation_approver, created_block, last_block, last_tx_index, last_log_index)
                     VALUES (?1, ?2, ?3, ?3, ?4, ?5)
                     ON CONFLICT(address) DO UPDATE SET
                        delegation_approver = excluded.delegation_approver,
                        created_block = MIN(operators.created_block, excluded.created_block),
                        last_block = excluded.last_block,
                        last_tx_index = excluded.last_tx_index,
                        last_log_index = excluded.last_log_index
                     WHERE (excluded.last_block, excluded.last_tx_index, excluded.last_log_index)
                         > (operators.last_block, operators.last_tx_index, operators.last_log_index)",
                    params![operator.as_str(), delegation_approver.as_str(), b, t, l],
                )?;
            }
            EventPayload::OperatorMetadataUriUpdated { operator, metadata_uri } => {
                if !exists(conn, "operators", operator)? {
                    referential_gap(event, "operator", operator.as_str());
                    return Ok(());
                }
                let [name, website, description, logo, twitter] = metadata_columns(ctx, metadata_uri);
                conn.execute(
                    "UPDATE operators SET
                        metadata_uri = ?2, metadata_name = ?3, metadata_website = ?4,
                        metadata_description = ?5, metadata_logo = ?6, metadata_twitter = ?7,
                        last_block = ?8, last_tx_index = ?9, last_log_index = ?10
                     WHERE address = ?1
                       AND (?8, ?9, ?10) > (last_block, last_tx_index, last_log_index)",
                    params![
                        operator.as_str(),
                        metadata_uri,
                        name,
                        website,
                        description,
                        logo,
                        twitter,
                        b,
                        t,
                        l
                    ],
                )?;
            }
            _ => {}
        }
        Ok(())
    }
}

pub struct AvsSink;

impl AvsSink {
    fn ensure_avs(conn: &Connection, avs: &Address, event: &CanonicalEvent) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO avs (address, created_block, last_block, last_tx_index, last_log_index)
             VALUES (?1, ?2, -1, -1, -1)",
            params![avs.as_str(), event.block_number as i64],
        )?;
        Ok(())
    }
}

impl Sink for AvsSink {
    fn stream(&self) -> StreamKind {
        StreamKind::Avs
    }

    fn owned_tables(&self) -> &'static [&'static str] {
        &["avs", "avs_operators"]
    }

    fn apply(&self, conn: &Connection, event: &CanonicalEvent, ctx: &ApplyContext) -> Result<()> {
        let (b, t, l) = pos(event);
        match &event.payload {
            EventPayload::AvsMetadataUriUpdated { avs, metadata_uri } => {
                Self::ensure_avs(conn, avs, event)?;
                let [name, website, description, logo, twitter] = metadata_columns(ctx, metadata_uri);
                conn.execute(
                    "UPDATE avs SET
                        metadata_uri = ?2, metadata_name = ?3, metadata_website = ?4,
                        metadata_description = ?5, metadata_logo = ?6, metadata_twitter = ?7,
                        last_block = ?8, last_tx_index = ?9, last_log_index = ?10
                     WHERE address = ?1
                       AND (?8, ?9, ?10) > (last_block, last_tx_index, last_log_index)",
                    params![
                        avs.as_str(),
                        metadata_uri,
                        name,
                        website,
                        description,
                        logo,
                        twitter,
                        b,
                        t,
                        l
                    ],
                )?;
            }
            EventPayload::OperatorAvsRegistrationStatusUpdated { operator, avs, registered } => {
                if !exists(conn, "operators", operator)? {
                    referential_gap(event, "operator", operator.as_str());
                    return Ok(());
                }
                Self::ensure_avs(conn, avs, event)?;
                conn.execute(
                    "INSERT INTO avs_operators (avs, operator, is_active, last_block, last_tx_index, last_log_index)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(avs, operator) DO UPDATE SET
                        is_active = excluded.is_active,
                        last_block = excluded.last_block,
                        last_tx_index = excluded.last_tx_index,
                        last_log_index = excluded.last_log_index
                     WHERE (excluded.last_block, excluded.last_tx_index, excluded.last_log_index)
                         > (avs_operators.last_block, avs_operators.last_tx_index, avs_operators.last_log_index)",
                    params![avs.as_str(), operator.as_str(), *registered, b, t, l],
                )?;
                conn.execute(
                    "UPDATE avs SET total_operators =
                        (SELECT COUNT(*) FROM avs_operators WHERE avs = ?1 AND is_active = 1)
                     WHERE address = ?1",
                    [avs.as_str()],
                )?;
            }
            _ => {}
        }
        Ok(())
    }
}

pub struct StrategiesSink;

impl Sink for StrategiesSink {
    fn stream(&self) -> StreamKind {
        StreamKind::Strategies
    }

    fn owned_tables(&self) -> &'static [&'static str] {
        &["strategies"]
    }

    fn apply(&self, conn: &Connection, event: &CanonicalEvent, _ctx: &ApplyContext) -> Result<()> {
        if let EventPayload::StrategyAddedToDepositWhitelist { strategy } = &event.payload {
            conn.execute(
                "INSERT OR IGNORE INTO strategies (address, whitelisted_block) VALUES (?1, ?2)",
                params![strategy.as_str(), event.block_number as i64],
            )?;
        }
        Ok(())
    }
}

pub struct PodsSink;

impl Sink for PodsSink {
    fn stream(&self) -> StreamKind {
        StreamKind::Pods
    }

    fn owned_tables(&self) -> &'static [&'static str] {
        &["pods"]
    }

    fn apply(&self, conn: &Connection, event: &CanonicalEvent, _ctx: &ApplyContext) -> Result<()> {
        if let EventPayload::PodDeployed { pod, owner } = &event.payload {
            conn.execute(
                "INSERT OR IGNORE INTO pods (address, owner, created_block, created_time)
                 VALUES (?1, ?2, ?3, ?4)",
                params![pod.as_str(), owner.as_str(), event.block_number as i64, event.block_time],
            )?;
        }
        Ok(())
    }
}

pub struct DepositsSink;

impl Sink for DepositsSink {
    fn stream(&self) -> StreamKind {
        StreamKind::Deposits
    }

    fn owned_tables(&self) -> &'static [&'static str] {
        &["staker_deposits"]
    }

    fn apply(&self, conn: &Connection, event: &CanonicalEvent, _ctx: &ApplyContext) -> Result<()> {
        if let EventPayload::Deposit { staker, strategy, shares, .. } = &event.payload {
            add_amount(
                conn,
                "staker_deposits",
                [("staker", staker.as_str()), ("strategy", strategy.as_str())],
                "shares",
                shares,
            )?;
        }
        Ok(())
    }
}

pub struct DelegationsSink;

impl DelegationsSink {
    fn recount(conn: &Connection, operator: &Address) -> Result<()> {
        conn.execute(
            "INSERT INTO operator_stakers (operator, total_stakers)
             VALUES (?1, (SELECT COUNT(*) FROM stakers WHERE operator = ?1))
             ON CONFLICT(operator) DO UPDATE SET total_stakers = excluded.total_stakers",
            [operator.as_str()],
        )?;
        Ok(())
    }
}

impl Sink for DelegationsSink {
    fn stream(&self) -> StreamKind {
        StreamKind::Delegations
    }

    fn owned_tables(&self) -> &'static [&'static str] {
        &["stakers", "operator_stakers"]
    }

    fn apply(&self, conn: &Connection, event: &CanonicalEvent, _ctx: &ApplyContext) -> Result<()> {
        let (b, t, l) = pos(event);
        let (staker, operator, delegated) = match &event.payload {
            EventPayload::StakerDelegated { staker, operator } => (staker, operator, true),
            EventPayload::StakerUndelegated { staker, operator } => (staker, operator, false),
            _ => return Ok(()),
        };

        if !exists(conn, "operators", operator)? {
            referential_gap(event, "operator", operator.as_str());
            return Ok(());
        }

        let previous: Option<Option<String>> = conn
            .query_row(
                "SELECT operator FROM stakers WHERE address = ?1",
                [staker.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        let new_operator = if delegated { Some(operator.as_str()) } else { None };
        conn.execute(
            "INSERT INTO stakers (address, operator, last_block, last_tx_index, last_log_index)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(address) DO UPDATE SET
                operator = excluded.operator,
                last_block = excluded.last_block,
                last_tx_index = excluded.last_tx_index,
                last_log_index = excluded.last_log_index
             WHERE (excluded.last_block, excluded.last_tx_index, excluded.last_log_index)
                 > (stakers.last_block, stakers.last_tx_index, stakers.last_log_index)",
            params![staker.as_str(), new_operator, b, t, l],
        )?;

        Self::recount(conn, operator)?;
        if let Some(Some(prev)) = previous {
            if prev != operator.as_str() {
                if let Some(prev) = Address::parse(&prev) {
                    Self::recount(conn, &prev)?;
                }
            }
        }
        Ok(())
    }
}

pub struct OperatorSharesSink;

impl Sink for OperatorSharesSink {
    fn stream(&self) -> StreamKind {
        StreamKind::OperatorShares
    }

    fn owned_tables(&self) -> &'static [&'static str] {
        &["operator_strategy_shares", "strategy_delegated_shares"]
    }

    fn apply(&self, conn: &Connection, event: &CanonicalEvent, _ctx: &ApplyContext) -> Result<()> {
        let (operator, strategy, delta) = match &event.payload {
            EventPayload::OperatorSharesIncreased { operator, strategy, shares, .. } => {
                (operator, strategy, shares.clone())
            }
            EventPayload::OperatorSharesDecreased { operator, strategy, shares, .. } => {
                (operator, strategy, -shares.clone())
            }
            _ => return Ok(()),
        };

        if !exists(conn, "operators", operator)? {
            referential_gap(event, "operator", operator.as_str());
            return Ok(());
        }

        add_amount(
            conn,
            "operator_strategy_shares",
            [("operator", operator.as_str()), ("strategy", strategy.as_str())],
            "shares",
            &delta,
        )?;

        let current: Option<String> = conn
            .query_row(
                "SELECT shares FROM strategy_delegated_shares WHERE strategy = ?1",
                [strategy.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let total = match current {
            Some(text) => amount_from_sql(&text)? + &delta,
            None => delta,
        };
        conn.execute(
            "INSERT INTO strategy_delegated_shares (strategy, shares) VALUES (?1, ?2)
             ON CONFLICT(strategy) DO UPDATE SET shares = excluded.shares",
            params![strategy.as_str(), amount_to_sql(&total)],
        )?;
        Ok(())
    }
}

pub struct WithdrawalsSink;

impl Sink for WithdrawalsSink {
    fn stream(&self) -> StreamKind {
        StreamKind::Withdrawals
    }

    fn owned_tables(&self) -> &'static [&'static str] {
        &["withdrawals"]
    }

    fn apply(&self, conn: &Connection, event: &CanonicalEvent, _ctx: &ApplyContext) -> Result<()> {
        match &event.payload {
            EventPayload::WithdrawalQueued {
                withdrawal_root,
                staker,
                delegated_to,
                withdrawer,
                nonce,
                start_block,
                strategies,
            } => {
                conn.execute(
                    "INSERT OR IGNORE INTO withdrawals
                        (withdrawal_root, staker, delegated_to, withdrawer, nonce, start_block,
                         strategy_shares, queued_block, queued_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        withdrawal_root,
                        staker.as_str(),
                        delegated_to.as_str(),
                        withdrawer.as_str(),
                        amount_to_sql(nonce),
                        *start_block as i64,
                        serde_json::to_string(strategies)?,
                        event.block_number as i64,
                        event.block_time
                    ],
                )?;
            }
            EventPayload::WithdrawalCompleted { withdrawal_root } => {
                let updated = conn.execute(
                    "UPDATE withdrawals
                     SET is_completed = 1, completed_block = ?2, completed_time = ?3
                     WHERE withdrawal_root = ?1 AND is_completed = 0",
                    params![withdrawal_root, event.block_number as i64, event.block_time],
                )?;
                if updated == 0 {
                    let known: bool = conn
                        .query_row(
                            "SELECT 1 FROM withdrawals WHERE withdrawal_root = ?1",
                            [withdrawal_root],
                            |_| Ok(()),
                        )
                        .optional()?
                        .is_some();
                    if !known {
                        referential_gap(event, "withdrawal", withdrawal_root);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

pub struct AllocationsSink;

impl Sink for AllocationsSink {
    fn stream(&self) -> StreamKind {
        StreamKind::Allocations
    }

    fn owned_tables(&self) -> &'static [&'static str] {
        &["allocations", "encumbered_magnitudes"]
    }

    fn apply(&self, conn: &Connection, event: &CanonicalEvent, _ctx: &ApplyContext) -> Result<()> {
        match &event.payload {
            EventPayload::AllocationUpdated {
                operator,
                avs,
                operator_set_id,
                strategy,
                magnitude,
                effect_block,
            } => {
                if !exists(conn, "operators", operator)? {
                    referential_gap(event, "operator", operator.as_str());
                    return Ok(());
                }
                let subject = [
                    Value::Text(operator.to_string()),
                    Value::Text(avs.to_string()),
                    Value::Integer(i64::from(*operator_set_id)),
                    Value::Text(strategy.to_string()),
                ];
                let target = i64::try_from(*magnitude).unwrap_or(i64::MAX);
                deferred::record_pending_target(
                    conn,
                    &ALLOCATIONS,
                    &subject,
                    target,
                    *effect_block,
                    event.block_number,
                )?;
            }
            EventPayload::EncumberedMagnitudeUpdated {
                operator,
                strategy,
                encumbered_magnitude,
            } => {
                let (b, t, l) = pos(event);
                conn.execute(
                    "INSERT INTO encumbered_magnitudes
                        (operator, strategy, encumbered_magnitude, last_block, last_tx_index, last_log_index)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(operator, strategy) DO UPDATE SET
                        encumbered_magnitude = excluded.encumbered_magnitude,
                        last_block = excluded.last_block,
                        last_tx_index = excluded.last_tx_index,
                        last_log_index = excluded.last_log_index
                     WHERE (excluded.last_block, excluded.last_tx_index, excluded.last_log_index)
                         > (encumbered_magnitudes.last_block, encumbered_magnitudes.last_tx_index,
                            encumbered_magnitudes.last_log_index)",
                    params![
                        operator.as_str(),
                        strategy.as_str(),
                        i64::try_from(*encumbered_magnitude).unwrap_or(i64::MAX),
                        b,
                        t,
                        l
                    ],
                )?;
            }
            _ => {}
        }
        Ok(())
    }
}

pub struct RewardsSink;

impl Sink for RewardsSink {
    fn stream(&self) -> StreamKind {
        StreamKind::Rewards
    }

    fn owned_tables(&self) -> &'static [&'static str] {
        &["rewards_submissions", "reward_submission_strategies"]
    }

    fn apply(&self, conn: &Connection, event: &CanonicalEvent, _ctx: &ApplyContext) -> Result<()> {
        if let EventPayload::AvsRewardsSubmissionCreated {
            avs,
            submission_nonce,
            submission_hash,
            strategies,
            token,
            amount,
            start_timestamp,
            duration,
        } = &event.payload
        {
            conn.execute(
                "INSERT OR IGNORE INTO rewards_submissions
                    (submission_hash, avs, submission_nonce, token, amount, start_timestamp,
                     duration, block_number, block_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    submission_hash,
                    avs.as_str(),
                    amount_to_sql(submission_nonce),
                    token.as_str(),
                    amount_to_sql(amount),
                    *start_timestamp as i64,
                    *duration,
                    event.block_number as i64,
                    event.block_time
                ],
            )?;
            for entry in strategies {
                conn.execute(
                    "INSERT OR IGNORE INTO reward_submission_strategies (submission_hash, strategy, multiplier)
                     VALUES (?1, ?2, ?3)",
                    params![
                        submission_hash,
                        entry.strategy.as_str(),
                        amount_to_sql(&entry.multiplier)
                    ],
                )?;
            }
        }
        Ok(())
    }
}
