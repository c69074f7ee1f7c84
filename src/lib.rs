//! The execution runtime of a caching reverse proxy's policy programs.
//!
//! Compiled request-handling policy programs run against this runtime: a
//! per-phase execution context with a write-once handling protocol
//! ([`proxyrt_core`]), directors with derived health verdicts
//! ([`proxyrt_backend`]), and versioned extension modules with an ordered
//! lifecycle ([`proxyrt_module`]).

pub use proxyrt_backend;
pub use proxyrt_core;
pub use proxyrt_module;

/// Re-export all common types for easy access.
pub mod prelude {
    pub use proxyrt_backend::prelude::*;
    pub use proxyrt_core::prelude::*;
    pub use proxyrt_module::prelude::*;
}
