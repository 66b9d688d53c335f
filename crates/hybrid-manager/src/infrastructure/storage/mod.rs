//! Persistence for node settings.

pub mod config;
