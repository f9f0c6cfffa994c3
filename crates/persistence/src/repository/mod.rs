//! Repository implementations for database operations

pub mod config;
pub mod iteration;
pub mod strategy;

pub use config::*;
pub use iteration::*;
pub use strategy::*;
