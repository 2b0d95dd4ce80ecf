//! Ferry CI Core
//!
//! Domain types, wire contract, port traits and error handling for the Ferry
//! CI control plane. This crate has minimal dependencies and defines the
//! shared vocabulary used across all other crates.

pub mod agent;
pub mod cmd;
pub mod error;
pub mod events;
pub mod ids;
pub mod ports;
pub mod queues;
pub mod schema;
pub mod selector;
pub mod settings;

pub use error::{Error, Result};
pub use ids::*;
