//! # Module: self_tune
//!
//! The measuring half of the loop: what the model is doing now and what to
//! try next.
//!
//! ## Sub-modules
//! - [`metric_store`] : per-task observations, rolling snapshots, snapshot history
//! - [`feedback`]     : trigger policy and the one-cycle-per-task rule
//! - [`strategy`]     : escalation ladder choosing tune / adjust / no-op
//! - [`shadow`]       : paired candidate-vs-active evaluation on mirrored traffic
//! - [`version`]      : version history and the single active pointer per task

pub mod metric_store;
pub mod feedback;
pub mod strategy;
pub mod shadow;
pub mod version;
