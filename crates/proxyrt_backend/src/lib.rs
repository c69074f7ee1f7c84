//! Backend selection and health for compiled proxy policy programs.
//!
//! `proxyrt_backend` defines where fetched content comes from:
//!
//! - [`director`] - The director abstraction and connection targets
//! - [`backend`] - Backend descriptors and the simple director
//! - [`probe`] - Health probing and the derived verdict
//! - [`stats`] - Shared statistics segments
//!
//! # Architecture
//!
//! Policy programs declare backends; the compiler freezes each declaration
//! into a [`backend::BackendDescriptor`] and wraps it in a
//! [`backend::Backend`], the leaf [`director::Director`]. Composite
//! directors (random, round-robin, fallback) are provided by extension
//! modules and resolve recursively down to a leaf. Health probing runs on
//! its own timer and publishes verdicts the request path reads lock-free.
//!
//! # Example
//!
//! ```
//! use proxyrt_backend::backend::{Backend, BackendBuilder};
//! use proxyrt_backend::director::Director;
//!
//! let desc = BackendBuilder::new("origin")
//!     .ipv4("192.0.2.10")
//!     .port("8080")
//!     .build()
//!     .unwrap();
//! let backend = Backend::new(desc);
//! assert_eq!(backend.name(), "origin");
//! ```

/// Backend descriptors and the simple director.
pub mod backend;

/// The director abstraction and connection targets.
pub mod director;

/// Health probing and the derived verdict.
pub mod probe;

/// Shared statistics segments.
pub mod stats;

/// Re-export all common types for easy access.
pub mod prelude {
    pub use crate::backend::{Backend, BackendBuilder, BackendDescriptor, BackendError};
    pub use crate::director::{ConnTarget, Director};
    pub use crate::probe::{
        HealthMonitor, ProbeConfig, ProbeConfigError, ProbeOutcome, ProbeTask, Prober,
    };
    pub use crate::stats::{SegmentAllocator, SegmentId, StatsCluster, StatsError};
}
