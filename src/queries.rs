//! Read-only projections for the reporting layer
//!
//! Pure reads against the ledger store: no locks beyond standard read
//! consistency, no mutation. The HTTP/reporting services build their
//! responses from these.

use crate::core_types::{InstrumentId, UserId};
use crate::error::ExchangeError;
use crate::models::{Order, Trade, Wallet};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;

/// Resting orders for one instrument, each side in match priority
/// order (the same ordering the matcher uses)
#[derive(Debug, Serialize)]
pub struct OrderBookSnapshot {
    pub instrument_id: InstrumentId,
    pub buys: Vec<Order>,
    pub sells: Vec<Order>,
}

/// One position with the instrument's current price alongside
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct PortfolioEntry {
    pub instrument_id: InstrumentId,
    pub total_quantity: i64,
    pub avg_buy_price: Decimal,
    pub current_price: Decimal,
}

/// A fill from one user's perspective
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct UserTrade {
    pub trade_id: i64,
    pub instrument_id: InstrumentId,
    pub side: String,
    pub quantity: i64,
    pub price: Decimal,
    pub trade_timestamp: DateTime<Utc>,
}

/// Current order book for display
pub async fn order_book(
    pool: &PgPool,
    instrument_id: InstrumentId,
) -> Result<OrderBookSnapshot, ExchangeError> {
    let buys: Vec<Order> = sqlx::query_as(
        r#"SELECT order_id, user_id, instrument_id, side, order_type, quantity,
                  limit_price, reserve_price, status, settled, placed_at
           FROM orders
           WHERE instrument_id = $1 AND side = 'BUY'
             AND status IN ('OPEN', 'PARTIALLY_FILLED')
           ORDER BY limit_price DESC NULLS FIRST, placed_at ASC, order_id ASC"#,
    )
    .bind(instrument_id)
    .fetch_all(pool)
    .await?;

    let sells: Vec<Order> = sqlx::query_as(
        r#"SELECT order_id, user_id, instrument_id, side, order_type, quantity,
                  limit_price, reserve_price, status, settled, placed_at
           FROM orders
           WHERE instrument_id = $1 AND side = 'SELL'
             AND status IN ('OPEN', 'PARTIALLY_FILLED')
           ORDER BY limit_price ASC NULLS FIRST, placed_at ASC, order_id ASC"#,
    )
    .bind(instrument_id)
    .fetch_all(pool)
    .await?;

    Ok(OrderBookSnapshot {
        instrument_id,
        buys,
        sells,
    })
}

/// Most recent trades for an instrument, newest first
pub async fn trade_history(
    pool: &PgPool,
    instrument_id: InstrumentId,
    limit: i64,
) -> Result<Vec<Trade>, ExchangeError> {
    let trades: Vec<Trade> = sqlx::query_as(
        r#"SELECT trade_id, buy_order_id, sell_order_id, instrument_id,
                  quantity, price, trade_timestamp
           FROM trades
           WHERE instrument_id = $1
           ORDER BY trade_timestamp DESC, trade_id DESC
           LIMIT $2"#,
    )
    .bind(instrument_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(trades)
}

/// All of a user's positions joined with current prices
pub async fn portfolio(
    pool: &PgPool,
    user_id: UserId,
) -> Result<Vec<PortfolioEntry>, ExchangeError> {
    let entries: Vec<PortfolioEntry> = sqlx::query_as(
        r#"SELECT h.instrument_id, h.total_quantity, h.avg_buy_price, i.current_price
           FROM holdings h
           JOIN instruments i ON h.instrument_id = i.instrument_id
           WHERE h.user_id = $1 AND h.total_quantity > 0
           ORDER BY h.instrument_id"#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(entries)
}

/// A user's fills, newest first, with the side seen from their orders
pub async fn user_trade_history(
    pool: &PgPool,
    user_id: UserId,
    limit: i64,
) -> Result<Vec<UserTrade>, ExchangeError> {
    let trades: Vec<UserTrade> = sqlx::query_as(
        r#"SELECT t.trade_id, t.instrument_id, o.side, t.quantity, t.price, t.trade_timestamp
           FROM trades t
           JOIN orders o ON o.order_id IN (t.buy_order_id, t.sell_order_id)
           WHERE o.user_id = $1
           ORDER BY t.trade_timestamp DESC, t.trade_id DESC
           LIMIT $2"#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(trades)
}

/// Wallet snapshot for one user
pub async fn wallet(pool: &PgPool, user_id: UserId) -> Result<Wallet, ExchangeError> {
    let wallet: Option<Wallet> = sqlx::query_as(
        "SELECT user_id, available_balance, locked_balance FROM wallets WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    wallet.ok_or(ExchangeError::NotFound("wallet"))
}
