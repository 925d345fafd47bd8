//! # NeverSQL Configuration Module
//!
//! This module centralizes all configuration constants for the storage engine.
//! Constants are grouped by their functional area and interdependencies are
//! documented next to the values they constrain.
//!
//! ## Why Centralization?
//!
//! The page layout constants, the B-tree cell layout constants, and the
//! overflow-chain constants all depend on each other. Scattering them across
//! modules makes it easy for a change in one place to silently violate an
//! assumption elsewhere (for example, shrinking the overflow header without
//! updating the minimum-chunk arithmetic in the entry creator). Co-locating
//! them keeps the dependencies visible.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency notes

pub mod constants;
pub use constants::*;
