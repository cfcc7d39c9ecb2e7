//! Lotkeeper Core - Shared types library.
//!
//! This crate provides common types used across all Lotkeeper components:
//! - `warehouse` - Lot store, allocation, picking, production and genealogy engine
//! - `cli` - Command-line tools for migrations and warehouse operations
//!
//! # Architecture
//!
//! The core crate contains only types and traits - no I/O, no database access.
//! This keeps it lightweight and allows it to be used anywhere.
//!
//! # Modules
//!
//! - [`types`] - Newtype wrappers for type-safe IDs and lifecycle statuses

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
