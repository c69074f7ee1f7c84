//! ACL evaluation.
//!
//! Compilation of literal and network rules into a matcher is the policy
//! compiler's concern; at run time an ACL is an opaque predicate over IP
//! addresses. The one behavior this layer owns is the audit trail: every
//! match attempt is logged with the address and the outcome, regardless of
//! the result.
//!
//! # Example
//!
//! ```
//! use std::net::IpAddr;
//! use proxyrt_core::acl::Acl;
//! use proxyrt_core::collab::{BudgetWorkspace, MemoryLog};
//! use proxyrt_core::ctx::{ExecCtx, Phase};
//!
//! let acl = Acl::new("purgers", |_ctx, ip: IpAddr| ip.is_loopback());
//!
//! let ws = BudgetWorkspace::new(1024);
//! let log = MemoryLog::new();
//! let ctx = ExecCtx::builder(Phase::Recv, &ws, &log).build();
//!
//! assert!(acl.matches(&ctx, "127.0.0.1".parse().unwrap()));
//! assert!(!acl.matches(&ctx, "10.0.0.1".parse().unwrap()));
//! ```

use crate::collab::LogTag;
use crate::ctx::ExecCtx;
use core::cmp::Ordering;
use core::fmt;
use std::net::IpAddr;

/// Signature of a compiled ACL matcher.
pub type MatchFn = dyn Fn(&ExecCtx<'_>, IpAddr) -> bool + Send + Sync;

/// An opaque compiled address matcher.
pub struct Acl {
    name: String,
    matcher: Box<MatchFn>,
}

impl Acl {
    /// Wraps a compiled matcher under its symbolic name.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        matcher: impl Fn(&ExecCtx<'_>, IpAddr) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            matcher: Box::new(matcher),
        }
    }

    /// Returns the ACL's symbolic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluates membership of `ip` and logs the attempt unconditionally.
    ///
    /// The audit record carries the ACL name, the address and the outcome
    /// whether or not the address matched.
    #[must_use]
    pub fn matches(&self, ctx: &ExecCtx<'_>, ip: IpAddr) -> bool {
        let hit = (self.matcher)(ctx, ip);
        let verdict = if hit { "MATCH" } else { "NO_MATCH" };
        ctx.log().emit(
            ctx.phase(),
            LogTag::Acl,
            &format!("{verdict} {} {ip}", self.name),
        );
        hit
    }
}

impl fmt::Debug for Acl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acl").field("name", &self.name).finish()
    }
}

/// Totally orders two IP addresses.
///
/// IPv4 sorts before IPv6; within a family, addresses order by their raw
/// octets. Useful for canonical comparison of client addresses in policy
/// code.
#[must_use]
pub fn ip_cmp(a: IpAddr, b: IpAddr) -> Ordering {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.octets().cmp(&b.octets()),
        (IpAddr::V6(a), IpAddr::V6(b)) => a.octets().cmp(&b.octets()),
        (IpAddr::V4(_), IpAddr::V6(_)) => Ordering::Less,
        (IpAddr::V6(_), IpAddr::V4(_)) => Ordering::Greater,
    }
}
