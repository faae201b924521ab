//! Crash-row prediction game engine.
//!
//! A tick-driven round loop (`engine`) reacts to a live price feed,
//! admits bets through a single actor task, settles them through a
//! retrying background queue (`settlement`), and persists through a
//! pluggable relational `Store`. `gateway` is the realtime transport;
//! everything else is the ambient stack: config, errors, auth, logging.

pub mod auth;
pub mod config;
pub mod engine;
pub mod errors;
pub mod gateway;
pub mod ledger;
pub mod locks;
pub mod models;
pub mod protocol;
pub mod risk;
pub mod settlement;
pub mod store;
pub mod telemetry;

pub use config::Config;
pub use errors::{EngineError, EngineResult, ErrorCode};
pub use store::Store;
