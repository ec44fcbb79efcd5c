//! hawser-core: Core abstractions and configuration for Hawser
//!
//! This crate provides shared types, credential handling, configuration
//! structures, and the driver traits the agent executes commands through.

pub mod auth;
pub mod config;
pub mod error;
pub mod time;
pub mod traits;

pub use error::HawserError;
