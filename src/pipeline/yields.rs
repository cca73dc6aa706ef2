//! Yield calculator
//!
//! Annualized reward rate per strategy from reward submissions and strategy
//! TVL, both in ETH.

use super::aggregation::latest_values;
use super::db::amount_from_sql;
use super::types::{Address, StrategyMultiplier};
use super::valuation::{fixed_point_one, Valuation};
use super::windows::Granularity;
use crate::error::{Result, SyncError};
use num_bigint::BigInt;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};

pub const SECONDS_PER_YEAR: u64 = 31_536_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardSubmission {
    pub submission_hash: String,
    pub avs: Address,
    pub token: Address,
    pub amount: BigInt,
    pub start_timestamp: i64,
    pub duration: u64,
    pub strategies: Vec<StrategyMultiplier>,
}

/// How per-strategy rates combine into one figure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum YieldAggregation {
    /// Entity-wide: rates add up
    #[default]
    Sum,
    /// Opt-in: best single strategy
    Max,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyYield {
    pub strategy: Address,
    pub reward_eth: Decimal,
    pub tvl_eth: Decimal,
    pub total_duration: u64,
    /// Percent per year
    pub apy: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YieldReport {
    pub strategies: Vec<StrategyYield>,
    pub apy: Decimal,
}

#[derive(Default)]
struct Accrual {
    reward_eth: Decimal,
    total_duration: u64,
}

/// Compute per-strategy APY and combine per `mode`.
///
/// Strategies with zero TVL or zero total duration contribute zero.
pub fn compute_apy(
    submissions: &[RewardSubmission],
    tvl_eth: &HashMap<Address, Decimal>,
    valuation: &Valuation,
    mode: YieldAggregation,
) -> YieldReport {
    let one = fixed_point_one();
    let mut accruals: BTreeMap<Address, Accrual> = BTreeMap::new();

    for sub in submissions {
        for target in &sub.strategies {
            let weighted = &sub.amount * &target.multiplier / &one;
            let eth = valuation.token_to_eth(&sub.token, &weighted, sub.start_timestamp);
            let accrual = accruals.entry(target.strategy.clone()).or_default();
            accrual.reward_eth = accrual.reward_eth.checked_add(eth).unwrap_or(accrual.reward_eth);
            accrual.total_duration += sub.duration;
        }
    }

    let strategies: Vec<StrategyYield> = accruals
        .into_iter()
        .map(|(strategy, accrual)| {
            let tvl = tvl_eth.get(&strategy).copied().unwrap_or(Decimal::ZERO);
            let apy = annualize(accrual.reward_eth, tvl, accrual.total_duration);
            StrategyYield {
                strategy,
                reward_eth: accrual.reward_eth,
                tvl_eth: tvl,
                total_duration: accrual.total_duration,
                apy,
            }
        })
        .collect();

    let apy = match mode {
        YieldAggregation::Sum => strategies
            .iter()
            .fold(Decimal::ZERO, |acc, s| acc.checked_add(s.apy).unwrap_or(acc)),
        YieldAggregation::Max => strategies
            .iter()
            .map(|s| s.apy)
            .max()
            .unwrap_or(Decimal::ZERO),
    };

    YieldReport { strategies, apy }
}

fn annualize(reward_eth: Decimal, tvl_eth: Decimal, duration: u64) -> Decimal {
    if tvl_eth <= Decimal::ZERO || duration == 0 {
        return Decimal::ZERO;
    }
    let rate = reward_eth.checked_div(tvl_eth);
    let factor = Decimal::from(SECONDS_PER_YEAR).checked_div(Decimal::from(duration));
    match (rate, factor) {
        (Some(rate), Some(factor)) => rate
            .checked_mul(factor)
            .and_then(|r| r.checked_mul(Decimal::ONE_HUNDRED))
            .map(|r| r.round_dp(8).normalize())
            .unwrap_or_else(|| {
                log::warn!("⚠️  APY overflow: reward {} / tvl {}", reward_eth, tvl_eth);
                Decimal::ZERO
            }),
        _ => Decimal::ZERO,
    }
}

/// Stored reward submissions, optionally for one AVS.
pub fn load_reward_submissions(conn: &Connection, avs: Option<&Address>) -> Result<Vec<RewardSubmission>> {
    let mut stmt = conn.prepare(
        "SELECT submission_hash, avs, token, amount, start_timestamp, duration
         FROM rewards_submissions
         WHERE ?1 IS NULL OR avs = ?1
         ORDER BY block_number, submission_hash",
    )?;
    let rows = stmt.query_map(params![avs.map(|a| a.as_str())], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, i64>(5)?,
        ))
    })?;

    let mut strategy_stmt = conn.prepare(
        "SELECT strategy, multiplier FROM reward_submission_strategies
         WHERE submission_hash = ?1 ORDER BY strategy",
    )?;

    let mut submissions = Vec::new();
    for row in rows {
        let (hash, avs, token, amount, start_timestamp, duration) = row?;
        let strategies = strategy_stmt
            .query_map([&hash], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(strategy, multiplier)| {
                Ok(StrategyMultiplier {
                    strategy: parse_stored_address(&strategy)?,
                    multiplier: amount_from_sql(&multiplier)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        submissions.push(RewardSubmission {
            avs: parse_stored_address(&avs)?,
            token: parse_stored_address(&token)?,
            amount: amount_from_sql(&amount)?,
            start_timestamp,
            duration: duration.max(0) as u64,
            strategies,
            submission_hash: hash,
        });
    }
    Ok(submissions)
}

/// Latest aggregated ETH TVL per strategy.
pub fn load_strategy_tvl(conn: &Connection, granularity: Granularity) -> Result<HashMap<Address, Decimal>> {
    let latest = latest_values::<Decimal>(conn, "strategy_tvl_eth", granularity)?;
    Ok(latest
        .into_iter()
        .filter_map(|(key, value)| Address::parse(&key).map(|a| (a, value)))
        .collect())
}

/// Yield of one AVS (or every AVS) from stored submissions and TVL.
pub fn avs_yield(
    conn: &Connection,
    avs: Option<&Address>,
    granularity: Granularity,
    mode: YieldAggregation,
) -> Result<YieldReport> {
    let submissions = load_reward_submissions(conn, avs)?;
    let tvl = load_strategy_tvl(conn, granularity)?;
    let valuation = Valuation::load(conn)?;
    Ok(compute_apy(&submissions, &tvl, &valuation, mode))
}

fn parse_stored_address(text: &str) -> Result<Address> {
    Address::parse(text).ok_or_else(|| SyncError::Corrupt(format!("address {:?}", text)))
}
