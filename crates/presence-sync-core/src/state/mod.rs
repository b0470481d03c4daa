//! Shared state mutation: deltas and the local actions that produce them.

pub mod action;
pub mod delta;

pub use action::{DetailAction, LocalAction, LEGACY_DETAIL_ACTIONS};
pub use delta::{dedup_ordered, SelectionDelta, StateDelta, DETAIL_KEY, PAYMENT_STEP_KEY};
