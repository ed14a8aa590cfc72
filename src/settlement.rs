//! Settlement - the single atomic trade finalization primitive
//!
//! Both the synchronous admission path and the periodic sweep converge
//! here. One call moves money, moves shares, updates both orders, marks
//! the instrument's last price and appends the trade record, all inside
//! the caller's transaction. A failure at any step returns an error and
//! the caller rolls the whole transaction (or savepoint) back; there is
//! NO other code path that mutates wallets or holdings.

use crate::core_types::{InstrumentId, OrderId, TradeId};
use crate::error::ExchangeError;
use crate::models::{Instrument, Order, Side, Wallet, weighted_avg_price};
use rust_decimal::Decimal;
use sqlx::postgres::Postgres;
use sqlx::{Row, Transaction};

/// A matched pair ready to be finalized
#[derive(Debug, Clone)]
pub struct Settlement {
    pub buy_order_id: OrderId,
    pub sell_order_id: OrderId,
    pub instrument_id: InstrumentId,
    pub quantity: i64,
    pub price: Decimal,
}

/// Acquire the instrument-scoped exclusive lock.
///
/// Every matching or settlement transaction calls this FIRST. The row
/// lock on `instruments` serializes all matching activity for one
/// instrument across the synchronous and periodic paths, which is what
/// rules out double-fills. Locks on different instruments are
/// independent.
pub async fn lock_instrument(
    tx: &mut Transaction<'_, Postgres>,
    instrument_id: InstrumentId,
) -> Result<Instrument, ExchangeError> {
    let instrument: Option<Instrument> = sqlx::query_as(
        r#"SELECT instrument_id, issuer_id, current_price, available_shares, total_shares, listed_at
           FROM instruments WHERE instrument_id = $1 FOR UPDATE"#,
    )
    .bind(instrument_id)
    .fetch_optional(&mut **tx)
    .await?;

    instrument.ok_or(ExchangeError::NotFound("instrument"))
}

/// Finalize a matched pair. Caller must already hold the instrument
/// lock (see [`lock_instrument`]) and commits or rolls back the
/// surrounding transaction.
///
/// Effects, all-or-nothing:
/// 1. decrement both orders' remaining quantity, transition status
/// 2. debit buyer / credit seller wallets (reservation released first)
/// 3. move shares: buyer holding up, seller holding down - or, for an
///    issuer-originated sell, instrument `available_shares` down
/// 4. update the instrument's `current_price` to the trade price
/// 5. append the immutable trade record
/// 6. re-verify share conservation before returning
pub async fn settle(
    tx: &mut Transaction<'_, Postgres>,
    s: &Settlement,
) -> Result<TradeId, ExchangeError> {
    // Instrument first (callers already hold it; re-entrant within the
    // same transaction), then order rows in ascending order_id to keep
    // lock acquisition deterministic across concurrent settlements.
    let instrument = lock_instrument(tx, s.instrument_id).await?;

    let rows: Vec<Order> = sqlx::query_as(
        r#"SELECT order_id, user_id, instrument_id, side, order_type, quantity,
                  limit_price, reserve_price, status, settled, placed_at
           FROM orders WHERE order_id IN ($1, $2)
           ORDER BY order_id FOR UPDATE"#,
    )
    .bind(s.buy_order_id)
    .bind(s.sell_order_id)
    .fetch_all(&mut **tx)
    .await?;

    let buy = rows
        .iter()
        .find(|o| o.order_id == s.buy_order_id)
        .ok_or(ExchangeError::NotFound("buy order"))?
        .clone();
    let sell = rows
        .iter()
        .find(|o| o.order_id == s.sell_order_id)
        .ok_or(ExchangeError::NotFound("sell order"))?
        .clone();

    validate_pair(&buy, &sell, s)?;

    let gross = s.price * Decimal::from(s.quantity);

    // --- money leg ---------------------------------------------------
    // Seller wallet is locked for the credit below; only the buyer
    // side carries a sufficiency check.
    let (buyer_wallet, _seller_wallet) =
        lock_wallets(tx, buy.user_id, sell.user_id).await?;

    // Release what was reserved for this slice, then debit at the
    // executed price. Reservation covers remaining quantity exactly,
    // so a FILLED order leaves nothing locked behind.
    let reserve_per_share = buy.reserve_price.unwrap_or(Decimal::ZERO);
    let release = reserve_per_share * Decimal::from(s.quantity);

    if buyer_wallet.locked_balance < release {
        return Err(ExchangeError::Consistency(format!(
            "buyer {} locked balance {} below reservation release {}",
            buy.user_id, buyer_wallet.locked_balance, release
        )));
    }
    if buyer_wallet.available_balance + release < gross {
        return Err(ExchangeError::InsufficientFunds);
    }

    sqlx::query(
        r#"UPDATE wallets
           SET locked_balance = locked_balance - $1,
               available_balance = available_balance + $1 - $2
           WHERE user_id = $3"#,
    )
    .bind(release)
    .bind(gross)
    .bind(buy.user_id)
    .execute(&mut **tx)
    .await?;

    sqlx::query("UPDATE wallets SET available_balance = available_balance + $1 WHERE user_id = $2")
        .bind(gross)
        .bind(sell.user_id)
        .execute(&mut **tx)
        .await?;

    // --- share leg: seller side --------------------------------------
    // An issuer sell distributes newly issued stock out of
    // available_shares; a resale comes out of the seller's holding.
    let issuer_sale =
        sell.user_id == instrument.issuer_id && instrument.available_shares >= s.quantity;
    if issuer_sale {
        sqlx::query(
            "UPDATE instruments SET available_shares = available_shares - $1 WHERE instrument_id = $2",
        )
        .bind(s.quantity)
        .bind(s.instrument_id)
        .execute(&mut **tx)
        .await?;
    } else {
        let held: Option<i64> = sqlx::query_scalar(
            r#"SELECT total_quantity FROM holdings
               WHERE user_id = $1 AND instrument_id = $2 FOR UPDATE"#,
        )
        .bind(sell.user_id)
        .bind(s.instrument_id)
        .fetch_optional(&mut **tx)
        .await?;

        if held.unwrap_or(0) < s.quantity {
            return Err(ExchangeError::InsufficientHoldings);
        }

        sqlx::query(
            r#"UPDATE holdings SET total_quantity = total_quantity - $1
               WHERE user_id = $2 AND instrument_id = $3"#,
        )
        .bind(s.quantity)
        .bind(sell.user_id)
        .bind(s.instrument_id)
        .execute(&mut **tx)
        .await?;
    }

    // --- share leg: buyer side ---------------------------------------
    // Read after the seller decrement so a self-trade sees its own
    // update. The weighted average moves only on buys.
    let buyer_holding: Option<(i64, Decimal)> = sqlx::query(
        r#"SELECT total_quantity, avg_buy_price FROM holdings
           WHERE user_id = $1 AND instrument_id = $2 FOR UPDATE"#,
    )
    .bind(buy.user_id)
    .bind(s.instrument_id)
    .fetch_optional(&mut **tx)
    .await?
    .map(|r| {
        Ok::<_, sqlx::Error>((
            r.try_get::<i64, _>("total_quantity")?,
            r.try_get::<Decimal, _>("avg_buy_price")?,
        ))
    })
    .transpose()?;

    let (old_qty, old_avg) = buyer_holding.unwrap_or((0, Decimal::ZERO));
    let new_avg = weighted_avg_price(old_qty, old_avg, s.quantity, s.price);

    sqlx::query(
        r#"INSERT INTO holdings (user_id, instrument_id, total_quantity, avg_buy_price)
           VALUES ($1, $2, $3, $4)
           ON CONFLICT (user_id, instrument_id)
           DO UPDATE SET total_quantity = $3, avg_buy_price = $4"#,
    )
    .bind(buy.user_id)
    .bind(s.instrument_id)
    .bind(old_qty + s.quantity)
    .bind(new_avg)
    .execute(&mut **tx)
    .await?;

    // --- order transitions -------------------------------------------
    apply_fill(tx, &buy, s.quantity).await?;
    apply_fill(tx, &sell, s.quantity).await?;

    // --- last trade price --------------------------------------------
    sqlx::query("UPDATE instruments SET current_price = $1 WHERE instrument_id = $2")
        .bind(s.price)
        .bind(s.instrument_id)
        .execute(&mut **tx)
        .await?;

    // --- audit record ------------------------------------------------
    let trade_id: TradeId = sqlx::query_scalar(
        r#"INSERT INTO trades (buy_order_id, sell_order_id, instrument_id, quantity, price)
           VALUES ($1, $2, $3, $4, $5)
           RETURNING trade_id"#,
    )
    .bind(s.buy_order_id)
    .bind(s.sell_order_id)
    .bind(s.instrument_id)
    .bind(s.quantity)
    .bind(s.price)
    .fetch_one(&mut **tx)
    .await?;

    verify_conservation(tx, s.instrument_id).await?;

    tracing::debug!(
        trade_id,
        buy_order_id = s.buy_order_id,
        sell_order_id = s.sell_order_id,
        instrument_id = s.instrument_id,
        quantity = s.quantity,
        price = %s.price,
        "trade settled"
    );

    Ok(trade_id)
}

/// Settlement preconditions. A violation here means a caller handed us
/// a pair the matcher should never have produced.
fn validate_pair(buy: &Order, sell: &Order, s: &Settlement) -> Result<(), ExchangeError> {
    if buy.side != Side::Buy || sell.side != Side::Sell {
        return Err(ExchangeError::Consistency(format!(
            "order pair ({}, {}) has wrong sides",
            buy.order_id, sell.order_id
        )));
    }
    if buy.instrument_id != s.instrument_id || sell.instrument_id != s.instrument_id {
        return Err(ExchangeError::Consistency(format!(
            "orders ({}, {}) do not both reference instrument {}",
            buy.order_id, sell.order_id, s.instrument_id
        )));
    }
    if !buy.is_resting() || !sell.is_resting() {
        return Err(ExchangeError::Consistency(format!(
            "order pair ({}, {}) is not resting",
            buy.order_id, sell.order_id
        )));
    }
    if s.quantity <= 0 || s.quantity > buy.quantity || s.quantity > sell.quantity {
        return Err(ExchangeError::Consistency(format!(
            "fill quantity {} out of range for pair ({}, {})",
            s.quantity, buy.order_id, sell.order_id
        )));
    }
    if s.price <= Decimal::ZERO {
        return Err(ExchangeError::Consistency(format!(
            "non-positive trade price {}",
            s.price
        )));
    }
    Ok(())
}

/// Lock both participants' wallet rows, always in ascending user_id
/// order so two settlements touching the same two users in opposite
/// roles cannot deadlock.
async fn lock_wallets(
    tx: &mut Transaction<'_, Postgres>,
    buyer_id: i64,
    seller_id: i64,
) -> Result<(Wallet, Wallet), ExchangeError> {
    let first = buyer_id.min(seller_id);
    let second = buyer_id.max(seller_id);

    let lock_one = |id: i64| {
        sqlx::query_as::<_, Wallet>(
            r#"SELECT user_id, available_balance, locked_balance
               FROM wallets WHERE user_id = $1 FOR UPDATE"#,
        )
        .bind(id)
    };

    let first_wallet: Wallet = lock_one(first)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(ExchangeError::NotFound("wallet"))?;

    let second_wallet = if second == first {
        first_wallet.clone()
    } else {
        lock_one(second)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(ExchangeError::NotFound("wallet"))?
    };

    if buyer_id <= seller_id {
        Ok((first_wallet, second_wallet))
    } else {
        Ok((second_wallet, first_wallet))
    }
}

/// Decrement remaining quantity and transition status
async fn apply_fill(
    tx: &mut Transaction<'_, Postgres>,
    order: &Order,
    quantity: i64,
) -> Result<(), ExchangeError> {
    let remaining = order.quantity - quantity;
    let status = if remaining == 0 {
        crate::models::OrderStatus::Filled
    } else {
        crate::models::OrderStatus::PartiallyFilled
    };

    sqlx::query(
        r#"UPDATE orders SET quantity = $1, status = $2, settled = $3
           WHERE order_id = $4"#,
    )
    .bind(remaining)
    .bind(status.as_str())
    .bind(remaining == 0)
    .bind(order.order_id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Share conservation: sum of holdings plus undistributed issuer
/// shares must equal total shares. Runs inside every settlement; a
/// mismatch aborts the transaction and is escalated, never ignored.
async fn verify_conservation(
    tx: &mut Transaction<'_, Postgres>,
    instrument_id: InstrumentId,
) -> Result<(), ExchangeError> {
    let row = sqlx::query(
        r#"SELECT i.available_shares, i.total_shares,
                  COALESCE((SELECT SUM(h.total_quantity) FROM holdings h
                            WHERE h.instrument_id = i.instrument_id), 0)::BIGINT AS held
           FROM instruments i WHERE i.instrument_id = $1"#,
    )
    .bind(instrument_id)
    .fetch_one(&mut **tx)
    .await?;

    let available: i64 = row.try_get("available_shares")?;
    let total: i64 = row.try_get("total_shares")?;
    let held: i64 = row.try_get("held")?;

    if held + available != total {
        return Err(ExchangeError::Consistency(format!(
            "instrument {}: held {} + available {} != total {}",
            instrument_id, held, available, total
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderStatus, OrderType};
    use chrono::Utc;

    fn order(order_id: i64, side: Side, quantity: i64) -> Order {
        Order {
            order_id,
            user_id: order_id * 10,
            instrument_id: 1,
            side,
            order_type: OrderType::Limit,
            quantity,
            limit_price: Some(Decimal::from(100)),
            reserve_price: (side == Side::Buy).then(|| Decimal::from(100)),
            status: OrderStatus::Open,
            settled: false,
            placed_at: Utc::now(),
        }
    }

    fn settlement(quantity: i64, price: i64) -> Settlement {
        Settlement {
            buy_order_id: 1,
            sell_order_id: 2,
            instrument_id: 1,
            quantity,
            price: Decimal::from(price),
        }
    }

    #[test]
    fn test_validate_pair_accepts_valid() {
        let buy = order(1, Side::Buy, 10);
        let sell = order(2, Side::Sell, 5);
        assert!(validate_pair(&buy, &sell, &settlement(5, 100)).is_ok());
    }

    #[test]
    fn test_validate_pair_rejects_swapped_sides() {
        let buy = order(1, Side::Sell, 10);
        let sell = order(2, Side::Buy, 10);
        let err = validate_pair(&buy, &sell, &settlement(5, 100)).unwrap_err();
        assert!(matches!(err, ExchangeError::Consistency(_)));
    }

    #[test]
    fn test_validate_pair_rejects_overfill() {
        let buy = order(1, Side::Buy, 10);
        let sell = order(2, Side::Sell, 3);
        let err = validate_pair(&buy, &sell, &settlement(5, 100)).unwrap_err();
        assert!(matches!(err, ExchangeError::Consistency(_)));
    }

    #[test]
    fn test_validate_pair_rejects_wrong_instrument() {
        let buy = order(1, Side::Buy, 10);
        let mut sell = order(2, Side::Sell, 10);
        sell.instrument_id = 2;
        let err = validate_pair(&buy, &sell, &settlement(5, 100)).unwrap_err();
        assert!(matches!(err, ExchangeError::Consistency(_)));
    }

    #[test]
    fn test_validate_pair_rejects_terminal_order() {
        let buy = order(1, Side::Buy, 10);
        let mut sell = order(2, Side::Sell, 10);
        sell.status = OrderStatus::Cancelled;
        let err = validate_pair(&buy, &sell, &settlement(5, 100)).unwrap_err();
        assert!(matches!(err, ExchangeError::Consistency(_)));
    }

    #[test]
    fn test_validate_pair_rejects_zero_quantity() {
        let buy = order(1, Side::Buy, 10);
        let sell = order(2, Side::Sell, 10);
        let err = validate_pair(&buy, &sell, &settlement(0, 100)).unwrap_err();
        assert!(matches!(err, ExchangeError::Consistency(_)));
    }
}
