//! Valuation layer
//!
//! The only place integer base units become decimals. Shares convert to
//! underlying tokens through a per-strategy 1e18 fixed-point rate, then to
//! ETH through the most recent price at or before the requested time.
//! Missing rates or prices degrade the term to zero.

use super::db::{amount_from_sql, amount_to_sql};
use super::types::Address;
use crate::error::{Result, SyncError};
use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

/// Pseudo-strategy for native consensus-layer stake
pub const BEACON_STRATEGY: &str = "0xbeac0eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeebeac0";

/// Decimals of fixed-point rates and multipliers
pub const FIXED_POINT_DECIMALS: u32 = 18;

const MAX_DECIMAL_DIGITS: usize = 28;

pub fn beacon_strategy() -> Address {
    Address::parse(BEACON_STRATEGY).unwrap_or_else(Address::zero)
}

pub fn fixed_point_one() -> BigInt {
    BigInt::from(10u64).pow(FIXED_POINT_DECIMALS)
}

/// Conversion data for one strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyRate {
    pub strategy: Address,
    /// Price-feed symbol of the underlying token
    pub symbol: String,
    pub decimals: u32,
    /// Underlying base units per share base unit, 1e18 fixed point
    pub shares_to_underlying: BigInt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub symbol: String,
    pub decimals: u32,
}

/// `priceAt(symbol, timestamp)`
pub trait PriceFeed {
    /// Most recent ETH price at or before `timestamp`, never a later one.
    fn price_at(&self, symbol: &str, timestamp: i64) -> Option<Decimal>;
}

/// In-memory price history keyed by symbol.
#[derive(Debug, Clone, Default)]
pub struct PriceHistory {
    series: HashMap<String, BTreeMap<i64, Decimal>>,
}

impl PriceHistory {
    pub fn insert(&mut self, symbol: &str, timestamp: i64, eth_price: Decimal) {
        self.series
            .entry(symbol.to_ascii_uppercase())
            .or_default()
            .insert(timestamp, eth_price);
    }

    pub fn load(conn: &Connection) -> Result<Self> {
        let mut history = Self::default();
        let mut stmt = conn.prepare("SELECT symbol, timestamp, eth_price FROM prices")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (symbol, ts, price) = row?;
            let price = Decimal::from_str(&price)
                .map_err(|e| SyncError::Corrupt(format!("price {:?}: {}", price, e)))?;
            history.insert(&symbol, ts, price);
        }
        Ok(history)
    }
}

impl PriceFeed for PriceHistory {
    fn price_at(&self, symbol: &str, timestamp: i64) -> Option<Decimal> {
        self.series
            .get(&symbol.to_ascii_uppercase())?
            .range(..=timestamp)
            .next_back()
            .map(|(_, price)| *price)
    }
}

/// Rates, token info and prices loaded once per batch.
#[derive(Debug, Clone, Default)]
pub struct Valuation {
    rates: HashMap<Address, StrategyRate>,
    tokens: HashMap<Address, TokenInfo>,
    prices: PriceHistory,
}

impl Valuation {
    pub fn new(rates: Vec<StrategyRate>, tokens: HashMap<Address, TokenInfo>, prices: PriceHistory) -> Self {
        Self {
            rates: rates.into_iter().map(|r| (r.strategy.clone(), r)).collect(),
            tokens,
            prices,
        }
    }

    pub fn load(conn: &Connection) -> Result<Self> {
        let mut stmt = conn.prepare(
            "SELECT strategy, symbol, decimals, shares_to_underlying FROM strategy_rates",
        )?;
        let raw: Vec<(String, String, u32, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
            .collect::<std::result::Result<_, _>>()?;

        let mut rates = Vec::with_capacity(raw.len());
        for (strategy, symbol, decimals, rate) in raw {
            let strategy = Address::parse(&strategy)
                .ok_or_else(|| SyncError::Corrupt(format!("strategy address {:?}", strategy)))?;
            rates.push(StrategyRate {
                strategy,
                symbol,
                decimals,
                shares_to_underlying: amount_from_sql(&rate)?,
            });
        }

        let mut stmt = conn.prepare("SELECT address, symbol, decimals FROM tokens")?;
        let tokens = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    TokenInfo {
                        symbol: row.get(1)?,
                        decimals: row.get(2)?,
                    },
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(|(addr, info)| Address::parse(&addr).map(|a| (a, info)))
            .collect();

        Ok(Self::new(rates, tokens, PriceHistory::load(conn)?))
    }

    pub fn prices(&self) -> &PriceHistory {
        &self.prices
    }

    /// `sharesToUnderlying`: base units of the underlying token.
    pub fn shares_to_underlying(&self, strategy: &Address, shares: &BigInt) -> BigInt {
        if strategy.as_str() == BEACON_STRATEGY {
            return shares.clone();
        }
        match self.rates.get(strategy) {
            Some(rate) => shares * &rate.shares_to_underlying / fixed_point_one(),
            None => {
                log::debug!("No conversion rate for strategy {}", strategy);
                BigInt::zero()
            }
        }
    }

    /// ETH value of `shares` of `strategy` at `timestamp`.
    pub fn shares_to_eth(&self, strategy: &Address, shares: &BigInt, timestamp: i64) -> Decimal {
        if strategy.as_str() == BEACON_STRATEGY {
            return units_to_decimal(shares, FIXED_POINT_DECIMALS);
        }
        let Some(rate) = self.rates.get(strategy) else {
            log::debug!("No conversion rate for strategy {}", strategy);
            return Decimal::ZERO;
        };
        let underlying = units_to_decimal(&self.shares_to_underlying(strategy, shares), rate.decimals);
        self.priced(&rate.symbol, underlying, timestamp)
    }

    /// ETH value of a raw token amount (reward tokens).
    pub fn token_to_eth(&self, token: &Address, amount: &BigInt, timestamp: i64) -> Decimal {
        let Some(info) = self.tokens.get(token) else {
            log::debug!("Unknown reward token {}", token);
            return Decimal::ZERO;
        };
        self.priced(&info.symbol, units_to_decimal(amount, info.decimals), timestamp)
    }

    fn priced(&self, symbol: &str, amount: Decimal, timestamp: i64) -> Decimal {
        match self.prices.price_at(symbol, timestamp) {
            Some(price) => amount.checked_mul(price).unwrap_or_else(|| {
                log::warn!("⚠️  ETH value overflow for {} {}", amount, symbol);
                Decimal::ZERO
            }),
            None => {
                log::debug!("No {} price at or before {}", symbol, timestamp);
                Decimal::ZERO
            }
        }
    }
}

/// `value / 10^decimals` as a `Decimal`, truncating fractional digits that
/// do not fit. Integer parts beyond `Decimal` range saturate.
pub fn units_to_decimal(value: &BigInt, decimals: u32) -> Decimal {
    let negative = value.is_negative();
    let digits = value.abs().to_string();
    let decimals = decimals as usize;

    let (int_part, frac_part) = if digits.len() > decimals {
        let split = digits.len() - decimals;
        (digits[..split].to_string(), digits[split..].to_string())
    } else {
        ("0".to_string(), format!("{:0>width$}", digits, width = decimals))
    };

    if int_part.len() > MAX_DECIMAL_DIGITS {
        log::warn!("⚠️  Amount {} exceeds decimal range, saturating", value);
        return if negative { Decimal::MIN } else { Decimal::MAX };
    }

    let frac_room = MAX_DECIMAL_DIGITS.saturating_sub(int_part.len());
    let frac: &str = &frac_part[..frac_part.len().min(frac_room)];
    let text = if frac.is_empty() {
        int_part
    } else {
        format!("{}.{}", int_part, frac)
    };

    let parsed = Decimal::from_str(&text).unwrap_or(Decimal::ZERO).normalize();
    if negative {
        -parsed
    } else {
        parsed
    }
}

pub fn record_price(conn: &Connection, symbol: &str, timestamp: i64, eth_price: Decimal) -> Result<()> {
    conn.execute(
        "INSERT INTO prices (symbol, timestamp, eth_price) VALUES (?1, ?2, ?3)
         ON CONFLICT(symbol, timestamp) DO UPDATE SET eth_price = excluded.eth_price",
        params![symbol.to_ascii_uppercase(), timestamp, eth_price.to_string()],
    )?;
    Ok(())
}

pub fn upsert_strategy_rate(conn: &Connection, rate: &StrategyRate) -> Result<()> {
    conn.execute(
        "INSERT INTO strategy_rates (strategy, symbol, decimals, shares_to_underlying, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(strategy) DO UPDATE SET
            symbol = excluded.symbol,
            decimals = excluded.decimals,
            shares_to_underlying = excluded.shares_to_underlying,
            updated_at = excluded.updated_at",
        params![
            rate.strategy.as_str(),
            rate.symbol,
            rate.decimals,
            amount_to_sql(&rate.shares_to_underlying),
            chrono::Utc::now().timestamp()
        ],
    )?;
    Ok(())
}

pub fn upsert_token(conn: &Connection, token: &Address, info: &TokenInfo) -> Result<()> {
    conn.execute(
        "INSERT INTO tokens (address, symbol, decimals) VALUES (?1, ?2, ?3)
         ON CONFLICT(address) DO UPDATE SET symbol = excluded.symbol, decimals = excluded.decimals",
        params![token.as_str(), info.symbol, info.decimals],
    )?;
    Ok(())
}
