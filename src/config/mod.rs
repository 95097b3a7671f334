//! # Harrow Configuration Module
//!
//! This module centralizes all configuration constants for harrow. Constants
//! are grouped by their functional area and interdependencies are documented
//! and enforced through compile-time assertions.
//!
//! ## Why Centralization?
//!
//! Scattered constants across multiple files lead to bugs where
//! interdependent values become mismatched. For example,
//! `DISPATCH_BATCH_SIZE` must never exceed `COMMAND_QUEUE_CAPACITY` or the
//! dispatcher's drain loop stalls producers. By co-locating these constants
//! and adding compile-time checks, we prevent such issues.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency
//!   documentation

pub mod constants;
pub use constants::*;
