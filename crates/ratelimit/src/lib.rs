//! Rate limiting for the perimeter.
//!
//! Two independent policies share the [`RateLimitPolicy`] interface:
//!
//! - [`ActorRateLimiter`]: one serialized actor per key running a leaky bucket
//!   with a penalty lockout. Strongly consistent for a key.
//! - [`SharedCounterRateLimiter`]: a fixed-window counter kept in the shared
//!   store, relying on the store's atomic increment.
//!
//! [`LayeredLimiter`] runs any number of them in sequence. The first denial
//! wins, and a policy that fails is logged and treated as allowing.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use perimeter_ratelimit::{
//!     ActorLimiterConfig, ActorRateLimiter, LayeredLimiter, SharedCounterConfig,
//!     SharedCounterRateLimiter,
//! };
//! use perimeter_storage::MemoryBackend;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let store = Arc::new(MemoryBackend::new());
//! let limiter = LayeredLimiter::new()
//!     .with(Arc::new(ActorRateLimiter::new(store.clone(), ActorLimiterConfig::default())))
//!     .with(Arc::new(SharedCounterRateLimiter::new(store, SharedCounterConfig::default())));
//!
//! assert!(limiter.check("10.0.0.1").await.is_allowed());
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod actor;
pub mod clock;
pub mod decision;
pub mod error;
pub mod policy;
pub mod response;
pub mod shared;

pub use actor::{ActorLimiterConfig, ActorRateLimiter, ActorState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::RateLimitDecision;
pub use error::RateLimitError;
pub use policy::{LayeredLimiter, RateLimitPolicy};
pub use response::{apply_quota_headers, render_denial, too_many_requests};
pub use shared::{SharedCounterConfig, SharedCounterRateLimiter};
