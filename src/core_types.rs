//! Core types used throughout the system
//!
//! These are fundamental type aliases used by all modules.
//! They provide semantic meaning and enable future type evolution.

/// User ID - globally unique, immutable after assignment.
///
/// Participants (and issuing entities) are identified by this id. The
/// surrounding auth service owns the user lifecycle; the core only
/// references it through wallets, holdings and orders.
pub type UserId = i64;

/// Instrument ID - identifies one listed instrument.
///
/// All matching and settlement activity is scoped to a single
/// instrument; locks never span two instruments.
pub type InstrumentId = i64;

/// Order ID - unique within the system (BIGSERIAL in the ledger store)
pub type OrderId = i64;

/// Trade ID - unique within the system
pub type TradeId = i64;
