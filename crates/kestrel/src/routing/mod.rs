//! Model routing: which model serves a turn, and which model a user means.
//!
//! - [`selector`]: task classification, routing tables with fallback chains,
//!   and per-model failure cooldowns.
//! - [`fuzzy`]: resolution of free-form model names ("opus", "the local
//!   one") against an alias table built from configuration.

pub mod fuzzy;
pub mod selector;

pub use fuzzy::{AliasSource, FuzzyMatch, FuzzyMatcher};
pub use selector::{CooldownState, ModelSelector, TaskType, cooldown_for};
