//! Shared types for the swap-bot item exchange engine.
//!
//! This crate contains the domain vocabulary used across the workspace:
//! item identity and records, offer/exchange state enums, and the trade
//! phase labels emitted on the outward event stream.

pub mod types;

pub use types::*;
