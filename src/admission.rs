//! Order Admission - validate, reserve, persist, then try one match
//!
//! A new order is validated, its funds reserved (buy side), and
//! persisted in OPEN status. Within the same transaction exactly one
//! synchronous match attempt runs against the best resting counter
//! order; for a buy on an instrument with no natural seller, issuer
//! liquidity is synthesized so first buyers of a fresh listing can
//! fill without waiting for the sweep.

use crate::config::MatchConfig;
use crate::core_types::{InstrumentId, OrderId, TradeId, UserId};
use crate::db::begin_matching_tx;
use crate::error::ExchangeError;
use crate::matcher::{best_counter_order, execution_price, is_compatible};
use crate::models::{Instrument, Order, OrderType, Side};
use crate::settlement::{Settlement, lock_instrument, settle};
use rust_decimal::Decimal;
use sqlx::postgres::Postgres;
use sqlx::{Acquire, PgPool, Transaction};

#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub user_id: UserId,
    pub instrument_id: InstrumentId,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: i64,
    pub limit_price: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct PlacementOutcome {
    pub order_id: OrderId,
    pub matched: bool,
    pub trade_id: Option<TradeId>,
}

/// Place a new order and attempt one synchronous match.
///
/// Fails with `Validation` on malformed input (nothing persisted) or
/// `InsufficientFunds` when a buy cannot be reserved (order not
/// created). A failed match attempt never fails the placement: the
/// order simply rests for the sweep.
pub async fn place_order(
    pool: &PgPool,
    cfg: &MatchConfig,
    req: &PlaceOrderRequest,
) -> Result<PlacementOutcome, ExchangeError> {
    validate_request(req)?;

    let mut tx = begin_matching_tx(pool, cfg.lock_timeout_ms).await?;
    let instrument = lock_instrument(&mut tx, req.instrument_id).await?;

    // Reserve-at-placement: buy orders move the full worst-case cost
    // from available to locked before the order exists, so a user can
    // never stack orders beyond their real balance.
    let reserve_price = match req.side {
        Side::Buy => {
            let price = req.limit_price.unwrap_or(instrument.current_price);
            reserve_funds(&mut tx, req.user_id, price * Decimal::from(req.quantity)).await?;
            Some(price)
        }
        Side::Sell => None,
    };

    let order = insert_order(&mut tx, req, reserve_price).await?;

    let trade_id = try_match_new_order(&mut tx, &instrument, &order).await?;

    tx.commit().await?;

    if let Some(trade_id) = trade_id {
        tracing::info!(
            order_id = order.order_id,
            trade_id,
            "order admitted and matched synchronously"
        );
    } else {
        tracing::debug!(order_id = order.order_id, "order admitted, resting");
    }

    Ok(PlacementOutcome {
        order_id: order.order_id,
        matched: trade_id.is_some(),
        trade_id,
    })
}

/// Cancel a resting order owned by `user_id`, releasing any remaining
/// fund reservation. Orders currently locked for matching block until
/// that pass finishes; terminal orders cannot be cancelled.
pub async fn cancel_order(
    pool: &PgPool,
    cfg: &MatchConfig,
    order_id: OrderId,
    user_id: UserId,
) -> Result<(), ExchangeError> {
    let instrument_id: Option<InstrumentId> =
        sqlx::query_scalar("SELECT instrument_id FROM orders WHERE order_id = $1")
            .bind(order_id)
            .fetch_optional(pool)
            .await?;
    let instrument_id = instrument_id.ok_or(ExchangeError::NotFound("order"))?;

    let mut tx = begin_matching_tx(pool, cfg.lock_timeout_ms).await?;
    lock_instrument(&mut tx, instrument_id).await?;

    let order: Order = sqlx::query_as(
        r#"SELECT order_id, user_id, instrument_id, side, order_type, quantity,
                  limit_price, reserve_price, status, settled, placed_at
           FROM orders WHERE order_id = $1 FOR UPDATE"#,
    )
    .bind(order_id)
    .fetch_one(&mut *tx)
    .await?;

    if order.user_id != user_id {
        return Err(ExchangeError::Validation("order not owned by caller".into()));
    }
    if !order.is_resting() {
        return Err(ExchangeError::Validation(
            "only resting orders can be cancelled".into(),
        ));
    }

    sqlx::query("UPDATE orders SET status = 'CANCELLED' WHERE order_id = $1")
        .bind(order_id)
        .execute(&mut *tx)
        .await?;

    // The reservation always covers exactly the remaining quantity
    if let Some(reserve_price) = order.reserve_price {
        let release = reserve_price * Decimal::from(order.quantity);
        sqlx::query(
            r#"UPDATE wallets
               SET locked_balance = locked_balance - $1,
                   available_balance = available_balance + $1
               WHERE user_id = $2"#,
        )
        .bind(release)
        .bind(order.user_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    tracing::info!(order_id, "order cancelled");
    Ok(())
}

/// Request validation, applied before any state change
pub fn validate_request(req: &PlaceOrderRequest) -> Result<(), ExchangeError> {
    if req.quantity <= 0 {
        return Err(ExchangeError::Validation(
            "quantity must be positive".into(),
        ));
    }
    match (req.order_type, req.limit_price) {
        (OrderType::Limit, None) => Err(ExchangeError::Validation(
            "limit order requires a limit price".into(),
        )),
        (OrderType::Limit, Some(p)) if p <= Decimal::ZERO => Err(ExchangeError::Validation(
            "limit price must be positive".into(),
        )),
        (OrderType::Market, Some(_)) => Err(ExchangeError::Validation(
            "market order must not carry a limit price".into(),
        )),
        _ => Ok(()),
    }
}

async fn reserve_funds(
    tx: &mut Transaction<'_, Postgres>,
    user_id: UserId,
    amount: Decimal,
) -> Result<(), ExchangeError> {
    let available: Option<Decimal> = sqlx::query_scalar(
        "SELECT available_balance FROM wallets WHERE user_id = $1 FOR UPDATE",
    )
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await?;

    let available = available.ok_or(ExchangeError::NotFound("wallet"))?;
    if available < amount {
        return Err(ExchangeError::InsufficientFunds);
    }

    sqlx::query(
        r#"UPDATE wallets
           SET available_balance = available_balance - $1,
               locked_balance = locked_balance + $1
           WHERE user_id = $2"#,
    )
    .bind(amount)
    .bind(user_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_order(
    tx: &mut Transaction<'_, Postgres>,
    req: &PlaceOrderRequest,
    reserve_price: Option<Decimal>,
) -> Result<Order, ExchangeError> {
    let order: Order = sqlx::query_as(
        r#"INSERT INTO orders (user_id, instrument_id, side, order_type, quantity,
                               limit_price, reserve_price)
           VALUES ($1, $2, $3, $4, $5, $6, $7)
           RETURNING order_id, user_id, instrument_id, side, order_type, quantity,
                     limit_price, reserve_price, status, settled, placed_at"#,
    )
    .bind(req.user_id)
    .bind(req.instrument_id)
    .bind(req.side.as_str())
    .bind(req.order_type.as_str())
    .bind(req.quantity)
    .bind(req.limit_price)
    .bind(reserve_price)
    .fetch_one(&mut **tx)
    .await?;
    Ok(order)
}

/// Exactly one match attempt for a freshly admitted order, inside a
/// savepoint: a business rejection (seller short of holdings, say)
/// rolls back only the attempt and the order stays admitted.
async fn try_match_new_order(
    tx: &mut Transaction<'_, Postgres>,
    instrument: &Instrument,
    order: &Order,
) -> Result<Option<TradeId>, ExchangeError> {
    let mut sp = tx.begin().await?;

    let attempt = match_attempt(&mut sp, instrument, order).await;
    match attempt {
        Ok(Some(trade_id)) => {
            sp.commit().await?;
            Ok(Some(trade_id))
        }
        Ok(None) => {
            sp.rollback().await?;
            Ok(None)
        }
        Err(e) if !e.is_transient() => {
            sp.rollback().await?;
            tracing::warn!(
                order_id = order.order_id,
                error = %e,
                "synchronous match attempt rejected; order rests"
            );
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

async fn match_attempt(
    sp: &mut Transaction<'_, Postgres>,
    instrument: &Instrument,
    order: &Order,
) -> Result<Option<TradeId>, ExchangeError> {
    if let Some(counter) = best_counter_order(sp, order.instrument_id, order.side).await? {
        if !is_compatible(order.side, order.limit_price, counter.limit_price) {
            return Ok(None);
        }
        let price = execution_price(
            order.order_type,
            order.side,
            order.limit_price,
            counter.limit_price,
            instrument.current_price,
        );
        let quantity = order.quantity.min(counter.quantity);
        let (buy_order_id, sell_order_id) = match order.side {
            Side::Buy => (order.order_id, counter.order_id),
            Side::Sell => (counter.order_id, order.order_id),
        };
        let trade_id = settle(
            sp,
            &Settlement {
                buy_order_id,
                sell_order_id,
                instrument_id: order.instrument_id,
                quantity,
                price,
            },
        )
        .await?;
        return Ok(Some(trade_id));
    }

    // Issuer liquidity: a fresh listing has no natural seller yet, so
    // a buy with no counter-order draws on undistributed shares.
    if order.side == Side::Buy && instrument.available_shares > 0 {
        let price = match order.limit_price {
            // The buyer's limit applies only when stricter
            Some(limit) => instrument.current_price.min(limit),
            None => instrument.current_price,
        };
        let quantity = order.quantity.min(instrument.available_shares);

        let issuer_order_id: OrderId = sqlx::query_scalar(
            r#"INSERT INTO orders (user_id, instrument_id, side, order_type, quantity, limit_price)
               VALUES ($1, $2, 'SELL', 'LIMIT', $3, $4)
               RETURNING order_id"#,
        )
        .bind(instrument.issuer_id)
        .bind(order.instrument_id)
        .bind(quantity)
        .bind(price)
        .fetch_one(&mut **sp)
        .await?;

        let trade_id = settle(
            sp,
            &Settlement {
                buy_order_id: order.order_id,
                sell_order_id: issuer_order_id,
                instrument_id: order.instrument_id,
                quantity,
                price,
            },
        )
        .await?;
        return Ok(Some(trade_id));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(
        side: Side,
        order_type: OrderType,
        quantity: i64,
        limit_price: Option<Decimal>,
    ) -> PlaceOrderRequest {
        PlaceOrderRequest {
            user_id: 1,
            instrument_id: 1,
            side,
            order_type,
            quantity,
            limit_price,
        }
    }

    #[test]
    fn test_valid_market_order() {
        let req = request(Side::Buy, OrderType::Market, 10, None);
        assert!(validate_request(&req).is_ok());
    }

    #[test]
    fn test_valid_limit_order() {
        let req = request(Side::Sell, OrderType::Limit, 10, Some(Decimal::from(100)));
        assert!(validate_request(&req).is_ok());
    }

    #[test]
    fn test_rejects_zero_quantity() {
        let req = request(Side::Buy, OrderType::Market, 0, None);
        assert!(matches!(
            validate_request(&req),
            Err(ExchangeError::Validation(_))
        ));
    }

    #[test]
    fn test_rejects_negative_quantity() {
        let req = request(Side::Buy, OrderType::Market, -5, None);
        assert!(matches!(
            validate_request(&req),
            Err(ExchangeError::Validation(_))
        ));
    }

    #[test]
    fn test_rejects_limit_without_price() {
        let req = request(Side::Buy, OrderType::Limit, 10, None);
        assert!(matches!(
            validate_request(&req),
            Err(ExchangeError::Validation(_))
        ));
    }

    #[test]
    fn test_rejects_non_positive_limit_price() {
        let req = request(Side::Buy, OrderType::Limit, 10, Some(Decimal::ZERO));
        assert!(matches!(
            validate_request(&req),
            Err(ExchangeError::Validation(_))
        ));
    }

    #[test]
    fn test_rejects_market_with_price() {
        let req = request(Side::Sell, OrderType::Market, 10, Some(Decimal::from(5)));
        assert!(matches!(
            validate_request(&req),
            Err(ExchangeError::Validation(_))
        ));
    }
}
