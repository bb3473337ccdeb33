//! Subcommand implementations.

pub mod attend;
pub mod export;
pub mod register;
pub mod start;
