//! The perimeter assembled: gateway pipeline, service guard and configuration.
//!
//! The gateway runs [`Perimeter::handle`] on every inbound request: rate limit,
//! authenticate, sign. Internal services run [`ServiceGuard::verify`] on every
//! request they receive and trust the identity it returns.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use http::HeaderMap;
//! use perimeter_gateway::{Perimeter, PerimeterConfig, ServiceGuard};
//! use perimeter_storage::MemoryBackend;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let store = Arc::new(MemoryBackend::new());
//! let config = PerimeterConfig::new("gateway-secret", "token-secret");
//!
//! let gateway = Perimeter::from_config(&config, store.clone()).unwrap();
//! let service = ServiceGuard::from_config(&config, store).unwrap();
//!
//! let admitted = gateway.handle("10.0.0.1", &HeaderMap::new()).await.unwrap();
//! assert_eq!(service.verify(&admitted.headers).await.unwrap(), None);
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod guard;
pub mod perimeter;
pub mod telemetry;

pub use config::{LogFormat, PerimeterConfig, Secret};
pub use error::{GatewayError, Rejection};
pub use guard::ServiceGuard;
pub use perimeter::{Admitted, Perimeter};
