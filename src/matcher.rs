//! Matcher - instrument-scoped pairing of resting orders
//!
//! Two pairing passes, both run under the instrument row lock and both
//! settling through [`crate::settlement::settle`]:
//!
//! 1. market-against-best: each resting buy, oldest first, against the
//!    single best resting sell (price-time priority, market sells
//!    first)
//! 2. limit-against-limit: each resting limit buy, best price first,
//!    absorbing crossed limit sells cheapest-first until it fills
//!
//! The same priority queries drive the synchronous attempt at order
//! admission, so there is exactly one definition of "best counter
//! order" in the system.

use crate::config::MatchConfig;
use crate::core_types::{InstrumentId, OrderId, TradeId};
use crate::db::begin_matching_tx;
use crate::error::ExchangeError;
use crate::models::{Order, OrderType, Side};
use crate::settlement::{Settlement, lock_instrument, settle};
use rust_decimal::Decimal;
use sqlx::postgres::Postgres;
use sqlx::{PgPool, Transaction};

const RESTING: &str = "('OPEN', 'PARTIALLY_FILLED')";

/// Outcome of one full matching cycle across all instruments
#[derive(Debug, Default)]
pub struct CycleReport {
    pub instruments_swept: usize,
    pub trades_executed: u64,
    pub failed_instruments: usize,
}

/// Best resting SELL for an instrument: market sells first, then
/// ascending limit price, then placement time.
pub async fn best_resting_sell(
    tx: &mut Transaction<'_, Postgres>,
    instrument_id: InstrumentId,
) -> Result<Option<Order>, ExchangeError> {
    let order: Option<Order> = sqlx::query_as(&format!(
        r#"SELECT order_id, user_id, instrument_id, side, order_type, quantity,
                  limit_price, reserve_price, status, settled, placed_at
           FROM orders
           WHERE instrument_id = $1 AND side = 'SELL' AND status IN {RESTING}
           ORDER BY limit_price ASC NULLS FIRST, placed_at ASC, order_id ASC
           LIMIT 1"#
    ))
    .bind(instrument_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(order)
}

/// Best resting BUY for an instrument: market buys first, then
/// descending limit price, then placement time.
pub async fn best_resting_buy(
    tx: &mut Transaction<'_, Postgres>,
    instrument_id: InstrumentId,
) -> Result<Option<Order>, ExchangeError> {
    let order: Option<Order> = sqlx::query_as(&format!(
        r#"SELECT order_id, user_id, instrument_id, side, order_type, quantity,
                  limit_price, reserve_price, status, settled, placed_at
           FROM orders
           WHERE instrument_id = $1 AND side = 'BUY' AND status IN {RESTING}
           ORDER BY limit_price DESC NULLS FIRST, placed_at ASC, order_id ASC
           LIMIT 1"#
    ))
    .bind(instrument_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(order)
}

/// Best counter-order for a taker, using the shared priority queries
pub async fn best_counter_order(
    tx: &mut Transaction<'_, Postgres>,
    instrument_id: InstrumentId,
    taker_side: Side,
) -> Result<Option<Order>, ExchangeError> {
    match taker_side {
        Side::Buy => best_resting_sell(tx, instrument_id).await,
        Side::Sell => best_resting_buy(tx, instrument_id).await,
    }
}

/// Whether a taker's limit tolerates the counter-order's price.
/// Market orders on either side always cross.
pub fn is_compatible(
    taker_side: Side,
    taker_limit: Option<Decimal>,
    counter_limit: Option<Decimal>,
) -> bool {
    match (taker_limit, counter_limit) {
        (Some(taker), Some(counter)) => match taker_side {
            Side::Buy => counter <= taker,
            Side::Sell => counter >= taker,
        },
        _ => true,
    }
}

/// Execution price for a matched pair.
///
/// A market taker trades at the instrument's current price. A limit
/// taker trades at the passive order's limit price; against a market
/// counter it trades at the current price capped by its own limit, so
/// a limit order never executes beyond the price its owner consented
/// to.
pub fn execution_price(
    taker_type: OrderType,
    taker_side: Side,
    taker_limit: Option<Decimal>,
    counter_limit: Option<Decimal>,
    current_price: Decimal,
) -> Decimal {
    match taker_type {
        OrderType::Market => current_price,
        OrderType::Limit => counter_limit.unwrap_or_else(|| match (taker_limit, taker_side) {
            (Some(limit), Side::Buy) => current_price.min(limit),
            (Some(limit), Side::Sell) => current_price.max(limit),
            (None, _) => current_price,
        }),
    }
}

/// One matching cycle across every instrument with at least one
/// resting order. Instruments are swept concurrently; each holds its
/// own lock, so passes on different instruments never contend.
///
/// Idempotent: with nothing new to match, a second invocation produces
/// zero trades and changes nothing.
pub async fn run_matching_cycle(
    pool: &PgPool,
    cfg: &MatchConfig,
) -> Result<CycleReport, ExchangeError> {
    let instrument_ids: Vec<InstrumentId> = sqlx::query_scalar(&format!(
        "SELECT DISTINCT instrument_id FROM orders WHERE status IN {RESTING}"
    ))
    .fetch_all(pool)
    .await?;

    let mut report = CycleReport {
        instruments_swept: instrument_ids.len(),
        ..Default::default()
    };

    let sweeps = instrument_ids
        .iter()
        .map(|&id| match_instrument(pool, cfg, id));
    let results = futures::future::join_all(sweeps).await;

    // One instrument's failure never aborts the cycle; the next
    // interval retries it.
    for (instrument_id, result) in instrument_ids.iter().zip(results) {
        match result {
            Ok(trades) => report.trades_executed += trades,
            Err(e) => {
                report.failed_instruments += 1;
                tracing::error!(instrument_id, error = %e, "matching pass failed");
            }
        }
    }

    Ok(report)
}

/// Run both pairing passes for one instrument
pub async fn match_instrument(
    pool: &PgPool,
    cfg: &MatchConfig,
    instrument_id: InstrumentId,
) -> Result<u64, ExchangeError> {
    let mut trades = market_against_best(pool, cfg, instrument_id).await?;
    trades += limit_against_limit(pool, cfg, instrument_id).await?;
    Ok(trades)
}

/// Pass 1: each resting buy (oldest first) against the single best
/// resting sell. Each pair settles in its own transaction so a failed
/// settlement skips that pair only.
async fn market_against_best(
    pool: &PgPool,
    cfg: &MatchConfig,
    instrument_id: InstrumentId,
) -> Result<u64, ExchangeError> {
    let taker_ids: Vec<OrderId> = sqlx::query_scalar(&format!(
        r#"SELECT order_id FROM orders
           WHERE instrument_id = $1 AND side = 'BUY' AND status IN {RESTING}
           ORDER BY placed_at ASC, order_id ASC
           LIMIT $2"#
    ))
    .bind(instrument_id)
    .bind(cfg.batch_size)
    .fetch_all(pool)
    .await?;

    let mut trades = 0u64;
    for buy_order_id in taker_ids {
        match match_buy_against_best(pool, cfg, instrument_id, buy_order_id).await {
            Ok(Some(_)) => trades += 1,
            Ok(None) => {}
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                // Business rejection (funds/holdings): skip this pair,
                // the resting order stays for a later attempt.
                tracing::warn!(buy_order_id, error = %e, "skipping unmatchable pair");
            }
        }
    }
    Ok(trades)
}

async fn match_buy_against_best(
    pool: &PgPool,
    cfg: &MatchConfig,
    instrument_id: InstrumentId,
    buy_order_id: OrderId,
) -> Result<Option<TradeId>, ExchangeError> {
    let mut tx = begin_matching_tx(pool, cfg.lock_timeout_ms).await?;
    let instrument = lock_instrument(&mut tx, instrument_id).await?;

    // Re-read under the lock; the snapshot taken outside may be stale
    let Some(buy) = fetch_order(&mut tx, buy_order_id).await? else {
        return Ok(None);
    };
    if !buy.is_resting() {
        return Ok(None);
    }

    let Some(sell) = best_resting_sell(&mut tx, instrument_id).await? else {
        return Ok(None);
    };
    if !is_compatible(Side::Buy, buy.limit_price, sell.limit_price) {
        return Ok(None);
    }

    let price = execution_price(
        buy.order_type,
        Side::Buy,
        buy.limit_price,
        sell.limit_price,
        instrument.current_price,
    );
    let quantity = buy.quantity.min(sell.quantity);

    let trade_id = settle(
        &mut tx,
        &Settlement {
            buy_order_id: buy.order_id,
            sell_order_id: sell.order_id,
            instrument_id,
            quantity,
            price,
        },
    )
    .await?;

    tx.commit().await?;
    Ok(Some(trade_id))
}

/// Pass 2: each resting limit buy, by descending limit price then age,
/// absorbs crossed limit sells cheapest-first while it stays resting.
/// The passive sell always sets the price.
async fn limit_against_limit(
    pool: &PgPool,
    cfg: &MatchConfig,
    instrument_id: InstrumentId,
) -> Result<u64, ExchangeError> {
    let taker_ids: Vec<OrderId> = sqlx::query_scalar(&format!(
        r#"SELECT order_id FROM orders
           WHERE instrument_id = $1 AND side = 'BUY' AND order_type = 'LIMIT'
             AND status IN {RESTING}
           ORDER BY limit_price DESC, placed_at ASC, order_id ASC
           LIMIT $2"#
    ))
    .bind(instrument_id)
    .bind(cfg.batch_size)
    .fetch_all(pool)
    .await?;

    let mut trades = 0u64;
    for buy_order_id in taker_ids {
        // One buy may absorb several sells; bounded by the batch size
        for _ in 0..cfg.batch_size {
            match match_limit_buy_once(pool, cfg, instrument_id, buy_order_id).await {
                Ok(Some(_)) => trades += 1,
                Ok(None) => break,
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    tracing::warn!(buy_order_id, error = %e, "skipping unmatchable pair");
                    break;
                }
            }
        }
    }
    Ok(trades)
}

async fn match_limit_buy_once(
    pool: &PgPool,
    cfg: &MatchConfig,
    instrument_id: InstrumentId,
    buy_order_id: OrderId,
) -> Result<Option<TradeId>, ExchangeError> {
    let mut tx = begin_matching_tx(pool, cfg.lock_timeout_ms).await?;
    lock_instrument(&mut tx, instrument_id).await?;

    let Some(buy) = fetch_order(&mut tx, buy_order_id).await? else {
        return Ok(None);
    };
    if !buy.is_resting() {
        return Ok(None);
    }
    let Some(buy_limit) = buy.limit_price else {
        return Ok(None);
    };

    let candidate: Option<Order> = sqlx::query_as(&format!(
        r#"SELECT order_id, user_id, instrument_id, side, order_type, quantity,
                  limit_price, reserve_price, status, settled, placed_at
           FROM orders
           WHERE instrument_id = $1 AND side = 'SELL' AND order_type = 'LIMIT'
             AND status IN {RESTING} AND limit_price <= $2
           ORDER BY limit_price ASC, placed_at ASC, order_id ASC
           LIMIT 1"#
    ))
    .bind(instrument_id)
    .bind(buy_limit)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(sell) = candidate else {
        return Ok(None);
    };
    let sell_limit = sell
        .limit_price
        .ok_or_else(|| ExchangeError::Consistency("limit sell without price".into()))?;

    let trade_id = settle(
        &mut tx,
        &Settlement {
            buy_order_id: buy.order_id,
            sell_order_id: sell.order_id,
            instrument_id,
            quantity: buy.quantity.min(sell.quantity),
            price: sell_limit,
        },
    )
    .await?;

    tx.commit().await?;
    Ok(Some(trade_id))
}

async fn fetch_order(
    tx: &mut Transaction<'_, Postgres>,
    order_id: OrderId,
) -> Result<Option<Order>, ExchangeError> {
    let order: Option<Order> = sqlx::query_as(
        r#"SELECT order_id, user_id, instrument_id, side, order_type, quantity,
                  limit_price, reserve_price, status, settled, placed_at
           FROM orders WHERE order_id = $1"#,
    )
    .bind(order_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(v: i64) -> Decimal {
        Decimal::from(v)
    }

    #[test]
    fn test_market_taker_always_compatible() {
        assert!(is_compatible(Side::Buy, None, Some(d(101))));
        assert!(is_compatible(Side::Sell, None, Some(d(99))));
    }

    #[test]
    fn test_limit_buy_compatibility() {
        assert!(is_compatible(Side::Buy, Some(d(100)), Some(d(99))));
        assert!(is_compatible(Side::Buy, Some(d(100)), Some(d(100))));
        assert!(!is_compatible(Side::Buy, Some(d(100)), Some(d(101))));
        // Market counter always crosses
        assert!(is_compatible(Side::Buy, Some(d(100)), None));
    }

    #[test]
    fn test_limit_sell_compatibility() {
        assert!(is_compatible(Side::Sell, Some(d(100)), Some(d(101))));
        assert!(!is_compatible(Side::Sell, Some(d(100)), Some(d(99))));
    }

    #[test]
    fn test_market_taker_trades_at_current_price() {
        let p = execution_price(OrderType::Market, Side::Buy, None, Some(d(95)), d(100));
        assert_eq!(p, d(100));
    }

    #[test]
    fn test_limit_taker_trades_at_passive_price() {
        let p = execution_price(OrderType::Limit, Side::Buy, Some(d(105)), Some(d(95)), d(100));
        assert_eq!(p, d(95));
    }

    #[test]
    fn test_limit_buy_against_market_sell_capped_by_limit() {
        // Current price above the buyer's limit: execute at the limit
        let p = execution_price(OrderType::Limit, Side::Buy, Some(d(98)), None, d(100));
        assert_eq!(p, d(98));
        // Current price below the limit: execute at current
        let p = execution_price(OrderType::Limit, Side::Buy, Some(d(103)), None, d(100));
        assert_eq!(p, d(100));
    }

    #[test]
    fn test_limit_sell_against_market_buy_floored_by_limit() {
        let p = execution_price(OrderType::Limit, Side::Sell, Some(d(102)), None, d(100));
        assert_eq!(p, d(102));
    }
}
