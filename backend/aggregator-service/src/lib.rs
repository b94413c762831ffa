//! Aggregator Service
//!
//! Accepts batches of events over HTTP, buffers them in memory and processes
//! them on a single consumer worker against a durable dedup store, so that each
//! `(event_id, topic)` pair takes effect at most once.

pub mod app;
pub mod buffer;
pub mod config;
pub mod consumer;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod services;

// Public re-exports
pub use app::{Aggregator, AppState};
pub use config::Config;
pub use error::{AppError, Result};
