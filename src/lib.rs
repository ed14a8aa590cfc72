//! bourse - Simulated securities exchange core
//!
//! Order matching and atomic trade settlement on a PostgreSQL ledger
//! store. Participants submit buy/sell orders against listed
//! instruments; the core pairs compatible orders, prices the fill and
//! finalizes it as one indivisible transition (wallet debit/credit,
//! share transfer, order transitions, trade record).
//!
//! # Modules
//!
//! - [`core_types`] - Id type aliases (UserId, OrderId, ...)
//! - [`models`] - Ledger row types and enums
//! - [`error`] - Error taxonomy
//! - [`config`] - YAML application config
//! - [`logging`] - tracing setup
//! - [`db`] - PostgreSQL pool and bounded-lock transactions
//! - [`schema`] - Idempotent ledger DDL
//! - [`admission`] - Place/cancel orders, synchronous match attempt
//! - [`matcher`] - Pairing passes and the matching cycle
//! - [`settlement`] - The atomic settle primitive
//! - [`sweep`] - Recurring sweep scheduler
//! - [`issuance`] - Instrument listing and wallet provisioning
//! - [`queries`] - Read-only reporting projections

// Core types - must be first!
pub mod core_types;

// Ambient stack
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod schema;

// Exchange core
pub mod admission;
pub mod issuance;
pub mod matcher;
pub mod queries;
pub mod settlement;
pub mod sweep;

// Convenient re-exports at crate root
pub use admission::{PlaceOrderRequest, PlacementOutcome, cancel_order, place_order};
pub use config::{AppConfig, MatchConfig};
pub use core_types::{InstrumentId, OrderId, TradeId, UserId};
pub use db::Database;
pub use error::ExchangeError;
pub use issuance::{ListingOutcome, list_instrument, open_wallet};
pub use matcher::{CycleReport, run_matching_cycle};
pub use models::{Holding, Instrument, Order, OrderStatus, OrderType, Side, Trade, Wallet};
pub use settlement::{Settlement, settle};
pub use sweep::SweepScheduler;
