//! Admission gates consulted between claim and execution.
//!
//! Governors never fail a job. A negative decision releases the claim back
//! to PENDING with a later `run_after`.

pub mod budget;
pub mod semaphore;

pub use budget::{BudgetDecision, BudgetSnapshot, BudgetThrottle, BudgetTier, billing_period, tier_for_ratio};
pub use semaphore::{ConcurrencySemaphore, SlotPermit};
