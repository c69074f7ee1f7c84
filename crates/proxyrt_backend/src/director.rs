//! The director abstraction.
//!
//! A director is a polymorphic answer to "where do we fetch this object
//! from". The simple [`Backend`](crate::backend::Backend) director wraps a
//! single origin server; composite directors (load-balancing groups,
//! fallback chains) implement the same trait over an ordered set of child
//! directors and are defined by extension modules, not here.
//!
//! Directors are shared across all concurrently executing requests.
//! `resolve` and `healthy` must stay cheap and lock-free on the hot path.
//! Destruction is by dropping the owning `Arc`; the runtime must not drop
//! its last reference while any in-flight request still holds a resolved
//! target (quiescence is the owner's obligation, not enforced here).

use proxyrt_core::ctx::ExecCtx;
use proxyrt_core::event::LifecycleEvent;
use std::net::SocketAddr;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// ConnTarget
// ─────────────────────────────────────────────────────────────────────────────

/// A connection-capable handle produced by [`Director::resolve`].
///
/// Carries everything the transport layer needs to open a connection; no
/// I/O happens in this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnTarget {
    /// Address to connect to.
    pub addr: SocketAddr,
    /// Host header to send, if the backend expects one.
    pub host_header: Option<String>,
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    /// Timeout for the first response byte.
    pub first_byte_timeout: Duration,
    /// Timeout between response bytes.
    pub between_bytes_timeout: Duration,
    /// Whether to send a PROXY protocol preamble.
    pub proxy_header: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Director
// ─────────────────────────────────────────────────────────────────────────────

/// A selectable backend target.
///
/// A director's identity (its name) is stable for its lifetime. All methods
/// take `&self` and are called concurrently from request worker threads.
pub trait Director: Send + Sync {
    /// Returns the director's symbolic name.
    fn name(&self) -> &str;

    /// Resolves a connection target for the current request.
    ///
    /// Returns `None` when the director cannot presently serve — sick
    /// backend, exhausted group, misconfiguration — so the caller can fail
    /// over. Never an error.
    fn resolve(&self, ctx: &ExecCtx<'_>) -> Option<ConnTarget>;

    /// Returns the current health verdict.
    ///
    /// For probed directors this is the health monitor's derived snapshot;
    /// directors without probing are always healthy.
    fn healthy(&self, _ctx: &ExecCtx<'_>) -> bool {
        true
    }

    /// Delivers a lifecycle event of the owning program instance.
    ///
    /// Directors use this to initialize and release resources (probe
    /// tasks, statistics segments) coherently with the instance that
    /// created them.
    fn event(&self, _event: LifecycleEvent) {}
}
