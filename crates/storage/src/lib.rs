//! Shared store abstraction and resilience primitives for the perimeter.
//!
//! Every other perimeter crate talks to the shared key/value store through the
//! [`StorageBackend`] trait defined here. The crate also provides the two
//! pieces that keep a slow or unreachable store from taking the perimeter down
//! with it: a [`CircuitBreaker`] that short-circuits reads to a fallback, and a
//! [`WriteBatcher`] that coalesces best-effort log writes.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │        authn (revocation, audit, nonces) │ ratelimit      │
//! ├───────────────────────────────────────────────────────────┤
//! │   CircuitBreaker          │        WriteBatcher           │
//! ├───────────────────────────────────────────────────────────┤
//! │                  StorageBackend trait                     │
//! │   (get, set_with_ttl, compare_and_set, increment, ttl)    │
//! ├───────────────────────────────────────────────────────────┤
//! │   MemoryBackend (tests, single node) │ external stores    │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//!
//! use perimeter_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new();
//!
//!     backend.set("user:dev:a@example.com:tokenVersion", b"1".to_vec()).await?;
//!     let window = Duration::from_secs(60);
//!     let hits = backend.increment("ratelimit:dev:10.0.0.1:count", window).await?;
//!     assert_eq!(hits, 1);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the [`testutil`] module with [`testutil::FlakyBackend`], a store whose
//!   failures can be switched on and off from a test.
//! - **`failpoints`**: Compiles `fail` crate injection points into the batch writer.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod batch;
pub mod circuit_breaker;
pub mod error;
pub mod keys;
pub mod memory;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;

pub use backend::{BatchEntry, StorageBackend};
pub use batch::{BatchConfig, BatchFlushStats, WriteBatcher};
pub use circuit_breaker::{
    Admission, BreakerError, BreakerFsm, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerMetrics, CircuitState,
};
pub use error::{BoxError, ConfigError, StorageError, StorageResult};
pub use keys::Environment;
pub use memory::MemoryBackend;
