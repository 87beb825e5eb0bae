//! # Module: self_modify
//!
//! The changing half of the loop: what a modification is, how candidates are
//! produced, what makes one safe, and where accepted ones are kept.
//!
//! ## Sub-modules
//! - [`transform`] : closed set of reversible transformations and `Modification`
//! - [`generator`] : seeded perturbations and the architecture menu
//! - [`safety`]    : constraint sets and the pure validator
//! - [`store`]     : `VersionStore` trait, in-memory and SQLite backends

pub mod transform;
pub mod generator;
pub mod safety;
pub mod store;
