// models.rs - Ledger row types: orders, instruments, holdings, wallets, trades

use crate::core_types::{InstrumentId, OrderId, TradeId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::postgres::PgRow;

/// Order side: Buy or Sell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Canonical text stored in the `orders.side` column
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    fn from_db(s: &str) -> Result<Self, sqlx::Error> {
        match s {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(decode_err("side", other)),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,  // Limit order: must specify price
    Market, // Market order: execute at the instrument's current price
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
        }
    }

    fn from_db(s: &str) -> Result<Self, sqlx::Error> {
        match s {
            "LIMIT" => Ok(OrderType::Limit),
            "MARKET" => Ok(OrderType::Market),
            other => Err(decode_err("order_type", other)),
        }
    }
}

/// Order status - once an order is persisted it MUST reach one of the
/// terminal states (Filled or Cancelled), never disappear.
///
/// Orders in Open or PartiallyFilled status are "resting": eligible to
/// be matched. Settlement is the only writer of status transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Open,            // Just created, waiting to be matched
    PartiallyFilled, // Some quantity filled, rest still resting
    Filled,          // Fully filled (terminal)
    Cancelled,       // Cancelled by user (terminal)
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "OPEN",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    /// Resting orders are the only ones the matcher may pair
    pub fn is_resting(&self) -> bool {
        matches!(self, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }

    fn from_db(s: &str) -> Result<Self, sqlx::Error> {
        match s {
            "OPEN" => Ok(OrderStatus::Open),
            "PARTIALLY_FILLED" => Ok(OrderStatus::PartiallyFilled),
            "FILLED" => Ok(OrderStatus::Filled),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            other => Err(decode_err("status", other)),
        }
    }
}

fn decode_err(column: &str, value: &str) -> sqlx::Error {
    sqlx::Error::Decode(format!("unexpected {} value: {}", column, value).into())
}

// ============================================================
// ORDER
// ============================================================

/// A persisted order. `quantity` is the REMAINING quantity; settlement
/// decrements it on every fill.
///
/// `reserve_price` is the per-share price at which buyer funds were
/// moved to `locked_balance` at placement time (reserve-at-placement
/// policy). NULL for sell orders, which reserve nothing.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub instrument_id: InstrumentId,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: i64,
    pub limit_price: Option<Decimal>,
    pub reserve_price: Option<Decimal>,
    pub status: OrderStatus,
    pub settled: bool,
    pub placed_at: DateTime<Utc>,
}

impl Order {
    /// True while the order can still be paired by the matcher
    #[inline]
    pub fn is_resting(&self) -> bool {
        self.status.is_resting() && self.quantity > 0
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Order {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Order {
            order_id: row.try_get("order_id")?,
            user_id: row.try_get("user_id")?,
            instrument_id: row.try_get("instrument_id")?,
            side: Side::from_db(&row.try_get::<String, _>("side")?)?,
            order_type: OrderType::from_db(&row.try_get::<String, _>("order_type")?)?,
            quantity: row.try_get("quantity")?,
            limit_price: row.try_get("limit_price")?,
            reserve_price: row.try_get("reserve_price")?,
            status: OrderStatus::from_db(&row.try_get::<String, _>("status")?)?,
            settled: row.try_get("settled")?,
            placed_at: row.try_get("placed_at")?,
        })
    }
}

// ============================================================
// INSTRUMENT
// ============================================================

/// A listed instrument. `available_shares` counts shares still held by
/// the issuing entity (issuer liquidity); `current_price` follows the
/// last trade price.
///
/// Invariant: 0 <= available_shares <= total_shares, and
/// sum(holdings.total_quantity) + available_shares == total_shares.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Instrument {
    pub instrument_id: InstrumentId,
    pub issuer_id: UserId,
    pub current_price: Decimal,
    pub available_shares: i64,
    pub total_shares: i64,
    pub listed_at: DateTime<Utc>,
}

// ============================================================
// HOLDING
// ============================================================

/// One row per (user, instrument), created lazily on first acquisition.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Holding {
    pub user_id: UserId,
    pub instrument_id: InstrumentId,
    pub total_quantity: i64,
    pub avg_buy_price: Decimal,
}

/// Quantity-weighted running average after a buy fill:
/// `avg' = (avg*qty_old + price*qty_filled) / (qty_old + qty_filled)`
///
/// Sell fills never touch the average (realized P&L is not modeled).
pub fn weighted_avg_price(
    old_qty: i64,
    old_avg: Decimal,
    fill_qty: i64,
    fill_price: Decimal,
) -> Decimal {
    let total = old_qty + fill_qty;
    if total <= 0 {
        return Decimal::ZERO;
    }
    (old_avg * Decimal::from(old_qty) + fill_price * Decimal::from(fill_qty))
        / Decimal::from(total)
}

// ============================================================
// WALLET
// ============================================================

/// Per-user money balances. Buy placements move funds from available
/// to locked; settlement releases the reservation and debits the
/// executed amount. Both balances stay >= 0 at all times.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Wallet {
    pub user_id: UserId,
    pub available_balance: Decimal,
    pub locked_balance: Decimal,
}

// ============================================================
// TRADE
// ============================================================

/// An executed fill. Append-only, immutable once created; the
/// canonical audit record of the exchange.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Trade {
    pub trade_id: TradeId,
    pub buy_order_id: OrderId,
    pub sell_order_id: OrderId,
    pub instrument_id: InstrumentId,
    pub quantity: i64,
    pub price: Decimal,
    pub trade_timestamp: DateTime<Utc>,
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_avg_first_acquisition() {
        // No prior holding: average is simply the fill price
        let avg = weighted_avg_price(0, Decimal::ZERO, 30, Decimal::from(10));
        assert_eq!(avg, Decimal::from(10));
    }

    #[test]
    fn test_weighted_avg_two_fills() {
        // 30 @ 10, then 70 @ 20 -> (300 + 1400) / 100 = 17
        let avg = weighted_avg_price(0, Decimal::ZERO, 30, Decimal::from(10));
        let avg = weighted_avg_price(30, avg, 70, Decimal::from(20));
        assert_eq!(avg, Decimal::from(17));
    }

    #[test]
    fn test_weighted_avg_fractional_prices() {
        // 10 @ 99.50, then 10 @ 100.50 -> 100.00
        let avg = weighted_avg_price(10, Decimal::new(9950, 2), 10, Decimal::new(10050, 2));
        assert_eq!(avg, Decimal::from(100));
    }

    #[test]
    fn test_weighted_avg_zero_total_is_zero() {
        assert_eq!(
            weighted_avg_price(0, Decimal::ZERO, 0, Decimal::from(5)),
            Decimal::ZERO
        );
    }

    #[test]
    fn test_status_resting() {
        assert!(OrderStatus::Open.is_resting());
        assert!(OrderStatus::PartiallyFilled.is_resting());
        assert!(!OrderStatus::Filled.is_resting());
        assert!(!OrderStatus::Cancelled.is_resting());
    }

    #[test]
    fn test_side_column_text() {
        assert_eq!(Side::Buy.as_str(), "BUY");
        assert_eq!(Side::Sell.as_str(), "SELL");
    }
}
