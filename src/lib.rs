//! Rust Event Gate
//!
//! Distributed admission control and event-driven read-model sync for a
//! small social platform. Requests pass a fixed-window rate limiter backed
//! by Redis, with a per-process insurance limiter when Redis is down. Post
//! lifecycle events travel over a RabbitMQ topic exchange to idempotent
//! synchronizers that maintain the search index and media store and
//! invalidate cached queries.

pub mod auth;
pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod limiter;
pub mod metrics;
pub mod redis;
pub mod repository;
pub mod service;
pub mod store;
pub mod sync;
pub mod utils;

// Re-export main types
pub use bus::{EventBus, EventHandler};
pub use config::{RateLimitPolicy, Settings};
pub use error::{GateError, Result};
pub use events::DomainEvent;
pub use limiter::{Admission, AdmissionController};
