//! Ledger store schema bootstrap
//!
//! Idempotent DDL applied at daemon startup. Provisioning is otherwise
//! an external concern; the core only guarantees the tables it reads
//! and writes exist with the shapes it expects.

use sqlx::PgPool;

/// Apply the full schema. Safe to run on every startup.
pub async fn init_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    tracing::info!("Initializing ledger schema...");

    for ddl in [
        CREATE_INSTRUMENTS_TABLE,
        CREATE_ORDERS_TABLE,
        CREATE_HOLDINGS_TABLE,
        CREATE_WALLETS_TABLE,
        CREATE_TRADES_TABLE,
        CREATE_ORDERS_RESTING_INDEX,
        CREATE_TRADES_INSTRUMENT_INDEX,
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }

    tracing::info!("Ledger schema initialized");
    Ok(())
}

const CREATE_INSTRUMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS instruments (
    instrument_id    BIGSERIAL PRIMARY KEY,
    issuer_id        BIGINT NOT NULL,
    current_price    NUMERIC(20, 6) NOT NULL CHECK (current_price > 0),
    available_shares BIGINT NOT NULL CHECK (available_shares >= 0),
    total_shares     BIGINT NOT NULL CHECK (total_shares >= available_shares),
    listed_at        TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const CREATE_ORDERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    order_id      BIGSERIAL PRIMARY KEY,
    user_id       BIGINT NOT NULL,
    instrument_id BIGINT NOT NULL REFERENCES instruments (instrument_id),
    side          TEXT NOT NULL CHECK (side IN ('BUY', 'SELL')),
    order_type    TEXT NOT NULL CHECK (order_type IN ('MARKET', 'LIMIT')),
    quantity      BIGINT NOT NULL CHECK (quantity >= 0),
    limit_price   NUMERIC(20, 6) CHECK (limit_price > 0),
    reserve_price NUMERIC(20, 6) CHECK (reserve_price > 0),
    status        TEXT NOT NULL DEFAULT 'OPEN'
                  CHECK (status IN ('OPEN', 'PARTIALLY_FILLED', 'FILLED', 'CANCELLED')),
    settled       BOOLEAN NOT NULL DEFAULT FALSE,
    placed_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
    CHECK ((order_type = 'LIMIT') = (limit_price IS NOT NULL))
)
"#;

const CREATE_HOLDINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS holdings (
    user_id        BIGINT NOT NULL,
    instrument_id  BIGINT NOT NULL REFERENCES instruments (instrument_id),
    total_quantity BIGINT NOT NULL DEFAULT 0 CHECK (total_quantity >= 0),
    avg_buy_price  NUMERIC(20, 6) NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, instrument_id)
)
"#;

const CREATE_WALLETS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS wallets (
    user_id           BIGINT PRIMARY KEY,
    available_balance NUMERIC(20, 6) NOT NULL DEFAULT 0 CHECK (available_balance >= 0),
    locked_balance    NUMERIC(20, 6) NOT NULL DEFAULT 0 CHECK (locked_balance >= 0)
)
"#;

const CREATE_TRADES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS trades (
    trade_id        BIGSERIAL PRIMARY KEY,
    buy_order_id    BIGINT NOT NULL REFERENCES orders (order_id),
    sell_order_id   BIGINT NOT NULL REFERENCES orders (order_id),
    instrument_id   BIGINT NOT NULL REFERENCES instruments (instrument_id),
    quantity        BIGINT NOT NULL CHECK (quantity > 0),
    price           NUMERIC(20, 6) NOT NULL CHECK (price > 0),
    trade_timestamp TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

// Resting-order scans are the hot path for both match passes
const CREATE_ORDERS_RESTING_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_orders_resting
    ON orders (instrument_id, side, status, placed_at)
    WHERE status IN ('OPEN', 'PARTIALLY_FILLED')
"#;

const CREATE_TRADES_INSTRUMENT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_trades_instrument
    ON trades (instrument_id, trade_timestamp DESC)
"#;
