//! Budget module - credit tracking and model pricing.
//!
//! # Key Concepts
//! - Registry: static per-model credit cost, limits and declared fallback
//! - Status: derived view of the ledger counters, recomputed on every query
//! - Store: durable backing store with an atomic float increment
//! - Ledger: the shared counter of credits used in the current billing period
//! - Fallback: picks an affordable substitute when a model is over budget

mod fallback;
mod ledger;
mod registry;
mod status;
mod store;

pub use fallback::select_fallback;
pub use ledger::{BudgetError, BudgetLedger};
pub use registry::{ModelCost, ModelRegistry, RegistryError};
pub use status::{BudgetHealth, BudgetStatus, DEFAULT_ALERT_THRESHOLD};
pub use store::{LedgerStore, MemoryLedgerStore, SqliteLedgerStore, StoreError, UsageRecord};
