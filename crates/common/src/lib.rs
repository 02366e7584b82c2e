//! Common utilities and types shared across the room relay crates.

#![warn(clippy::pedantic)]

/// Module for common data types
pub mod types;
