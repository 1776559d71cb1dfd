//! Types, configuration and connection helpers shared by every Herald crate.

pub mod config;
pub mod connect;
pub mod error;
pub mod types;
