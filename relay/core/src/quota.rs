//! Quota Ledger
//!
//! Reservation-then-settle accounting against a caller's balance:
//!
//! ```text
//! reserve(estimate) ──► Reservation ──┬──► consume(usage)   charge actual, refund/charge delta
//!                                     ├──► undo()           refund the full estimate
//!                                     └──► drop (no call)   refund, logged as a leak
//! ```
//!
//! A [`Reservation`] is an owned guard: `consume` and `undo` take it by value,
//! so a reservation can be settled at most once. Dropping an unsettled guard
//! (early return, cancelled future, panic unwind) releases it, which means no
//! reservation outlives its request.
//!
//! The balance itself lives behind [`QuotaStore`]. The check-and-debit in
//! [`QuotaStore::try_debit`] is one atomic step per caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Usage
// ============================================================================

/// Measured cost of one forwarded call
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Input-side units
    pub prompt_units: i64,
    /// Output-side units
    pub completion_units: i64,
    /// `prompt_units + completion_units`
    pub total_units: i64,
}

impl Usage {
    /// Build a usage record, deriving the total
    #[must_use]
    pub fn new(prompt_units: i64, completion_units: i64) -> Self {
        Self {
            prompt_units,
            completion_units,
            total_units: prompt_units + completion_units,
        }
    }

    /// Estimate usage from payload sizes, one unit per `bytes_per_unit` bytes
    #[must_use]
    pub fn from_byte_counts(request_bytes: u64, response_bytes: u64, bytes_per_unit: u64) -> Self {
        let divisor = bytes_per_unit.max(1);
        let to_units = |bytes: u64| i64::try_from(bytes / divisor).unwrap_or(i64::MAX);
        Self::new(to_units(request_bytes), to_units(response_bytes))
    }
}

// ============================================================================
// Pricing
// ============================================================================

/// Cost of one model
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPrice {
    /// Flat cost per successful call
    pub request: i64,
    /// Cost per usage unit
    pub unit: i64,
}

impl Default for ModelPrice {
    fn default() -> Self {
        Self {
            request: 1,
            unit: 1,
        }
    }
}

impl ModelPrice {
    /// Cost of `usage` at this price
    #[must_use]
    pub fn cost(&self, usage: &Usage) -> i64 {
        self.request
            .saturating_add(usage.total_units.saturating_mul(self.unit))
    }
}

/// Per-model prices with a default
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceTable {
    /// Price for models without an entry
    pub default: ModelPrice,
    /// Model specific prices
    pub models: HashMap<String, ModelPrice>,
}

impl PriceTable {
    /// Price for a model
    #[must_use]
    pub fn price(&self, model: &str) -> ModelPrice {
        self.models.get(model).copied().unwrap_or(self.default)
    }

    /// Cost of `usage` for `model`
    #[must_use]
    pub fn cost(&self, model: &str, usage: &Usage) -> i64 {
        self.price(model).cost(usage)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Quota errors
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QuotaError {
    /// Balance below the requested amount (nothing was debited)
    #[error("quota exhausted for caller {caller}: balance {balance}, requested {requested}")]
    Exhausted {
        /// Caller id
        caller: String,
        /// Balance at check time
        balance: i64,
        /// Amount requested
        requested: i64,
    },

    /// Caller has no balance record
    #[error("unknown caller: {0}")]
    UnknownCaller(String),
}

// ============================================================================
// Balance Store
// ============================================================================

/// Caller balance store (persistence is external)
///
/// Implementations must make `try_debit` a single atomic check-and-debit per
/// caller. Methods are synchronous so that reservations can be released from
/// `Drop`.
pub trait QuotaStore: Send + Sync {
    /// Debit `amount` if the balance covers it, returning the new balance
    fn try_debit(&self, caller: &str, amount: i64) -> Result<i64, QuotaError>;

    /// Unconditionally add `delta` (negative charges, positive refunds)
    fn adjust(&self, caller: &str, delta: i64);

    /// Current balance
    fn balance(&self, caller: &str) -> Option<i64>;
}

/// In-memory balance store
#[derive(Debug, Default)]
pub struct InMemoryQuotaStore {
    balances: DashMap<String, i64>,
}

impl InMemoryQuotaStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a caller's balance
    pub fn set_balance(&self, caller: impl Into<String>, balance: i64) {
        self.balances.insert(caller.into(), balance);
    }

    /// Builder-style [`set_balance`](Self::set_balance)
    #[must_use]
    pub fn with_balance(self, caller: impl Into<String>, balance: i64) -> Self {
        self.set_balance(caller, balance);
        self
    }
}

impl QuotaStore for InMemoryQuotaStore {
    fn try_debit(&self, caller: &str, amount: i64) -> Result<i64, QuotaError> {
        // The shard write lock held by `get_mut` makes check-and-debit atomic
        let mut balance = self
            .balances
            .get_mut(caller)
            .ok_or_else(|| QuotaError::UnknownCaller(caller.to_string()))?;

        if *balance < amount {
            return Err(QuotaError::Exhausted {
                caller: caller.to_string(),
                balance: *balance,
                requested: amount,
            });
        }
        *balance -= amount;
        Ok(*balance)
    }

    fn adjust(&self, caller: &str, delta: i64) {
        *self.balances.entry(caller.to_string()).or_insert(0) += delta;
    }

    fn balance(&self, caller: &str) -> Option<i64> {
        self.balances.get(caller).map(|b| *b)
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// Lifecycle counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LedgerStats {
    /// Reservations created
    pub reserved: u64,
    /// Reservations settled with actual usage
    pub consumed: u64,
    /// Reservations refunded (explicitly or on drop)
    pub released: u64,
    /// Of `released`, how many were released by `Drop`
    pub released_on_drop: u64,
}

impl LedgerStats {
    /// Reservations neither consumed nor released yet
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.reserved
            .saturating_sub(self.consumed)
            .saturating_sub(self.released)
    }
}

/// Quota ledger
pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    prices: PriceTable,
    reserved: AtomicU64,
    consumed: AtomicU64,
    released: AtomicU64,
    released_on_drop: AtomicU64,
}

impl QuotaLedger {
    /// Create a ledger over a balance store
    pub fn new(store: Arc<dyn QuotaStore>, prices: PriceTable) -> Self {
        Self {
            store,
            prices,
            reserved: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            released: AtomicU64::new(0),
            released_on_drop: AtomicU64::new(0),
        }
    }

    /// Price table in use
    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    /// Current balance of a caller
    pub fn balance(&self, caller: &str) -> Option<i64> {
        self.store.balance(caller)
    }

    /// Reserve `estimate` against the caller's balance
    ///
    /// Fails without side effects when the balance is insufficient.
    pub fn reserve(
        self: &Arc<Self>,
        caller: &str,
        model: &str,
        estimate: i64,
    ) -> Result<Reservation, QuotaError> {
        let estimate = estimate.max(0);
        let remaining = self.store.try_debit(caller, estimate)?;
        self.reserved.fetch_add(1, Ordering::Relaxed);

        let reservation = Reservation {
            id: Uuid::new_v4(),
            ledger: Arc::clone(self),
            caller: caller.to_string(),
            model: model.to_string(),
            reserved: estimate,
            settled: false,
        };

        tracing::debug!(
            reservation = %reservation.id,
            caller,
            model,
            estimate,
            remaining,
            "Quota reserved"
        );
        Ok(reservation)
    }

    /// Snapshot of lifecycle counters
    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            reserved: self.reserved.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            released_on_drop: self.released_on_drop.load(Ordering::Relaxed),
        }
    }

    fn refund(&self, caller: &str, amount: i64) {
        if amount != 0 {
            self.store.adjust(caller, amount);
        }
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for QuotaLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLedger")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Reservation
// ============================================================================

/// Result of consuming a reservation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Settlement {
    /// Amount held by the reservation
    pub reserved: i64,
    /// Actual cost charged in total
    pub charged: i64,
}

impl Settlement {
    /// `charged - reserved`: positive was charged on top, negative refunded
    #[must_use]
    pub fn delta(&self) -> i64 {
        self.charged - self.reserved
    }
}

/// An in-flight cost hold, settled exactly once
#[must_use = "an unsettled reservation is released when dropped"]
pub struct Reservation {
    id: Uuid,
    ledger: Arc<QuotaLedger>,
    caller: String,
    model: String,
    reserved: i64,
    settled: bool,
}

impl Reservation {
    /// Reservation id (logging)
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Caller the hold is against
    pub fn caller(&self) -> &str {
        &self.caller
    }

    /// Model used for pricing at settlement
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Amount held
    pub fn reserved(&self) -> i64 {
        self.reserved
    }

    /// Price the settlement under a different (resolved) model name
    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    /// Replace the hold with the measured cost of `usage`
    pub fn consume(mut self, usage: &Usage) -> Settlement {
        let charged = self.ledger.prices.cost(&self.model, usage);
        let settlement = Settlement {
            reserved: self.reserved,
            charged,
        };

        let delta = settlement.delta();
        if delta != 0 {
            self.ledger.store.adjust(&self.caller, -delta);
        }
        self.ledger.consumed.fetch_add(1, Ordering::Relaxed);
        self.settled = true;

        tracing::debug!(
            reservation = %self.id,
            caller = %self.caller,
            model = %self.model,
            reserved = self.reserved,
            charged,
            prompt_units = usage.prompt_units,
            completion_units = usage.completion_units,
            "Quota consumed"
        );
        settlement
    }

    /// Refund the full hold
    pub fn undo(mut self) {
        self.ledger.refund(&self.caller, self.reserved);
        self.settled = true;

        tracing::debug!(
            reservation = %self.id,
            caller = %self.caller,
            refunded = self.reserved,
            "Quota released"
        );
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.ledger.refund(&self.caller, self.reserved);
        self.ledger.released_on_drop.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            reservation = %self.id,
            caller = %self.caller,
            refunded = self.reserved,
            "Reservation dropped without settlement, released"
        );
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("id", &self.id)
            .field("caller", &self.caller)
            .field("model", &self.model)
            .field("reserved", &self.reserved)
            .field("settled", &self.settled)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
