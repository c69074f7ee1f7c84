//! Core execution primitives for compiled proxy policy programs.
//!
//! `proxyrt_core` provides the per-request machinery a compiled
//! request-handling policy program runs against:
//!
//! - [`ctx`] - Execution context and the handling protocol
//! - [`collab`] - Collaborator interfaces (workspace, request log, headers)
//! - [`strands`] - Fragment-list string assembly
//! - [`acl`] - Opaque ACL matchers with audit logging
//! - [`scope`] - Scoped private state for extension modules
//! - [`coverage`] - Source-location execution counters
//! - [`convert`] - Canonical textual forms of policy values
//!
//! # Architecture
//!
//! The surrounding request pipeline builds one [`ctx::ExecCtx`] per phase,
//! calls the compiled hook functions against it, and reads the handling
//! slot back to drive the request state machine. Backend selection lives in
//! `proxyrt_backend`; module loading and lifecycle in `proxyrt_module`.
//!
//! # Example
//!
//! ```
//! use proxyrt_core::collab::{BudgetWorkspace, MemoryLog};
//! use proxyrt_core::ctx::{ExecCtx, Handling, Phase};
//!
//! let ws = BudgetWorkspace::new(4096);
//! let log = MemoryLog::new();
//!
//! let ctx = ExecCtx::builder(Phase::Recv, &ws, &log).build();
//! ctx.set_handling(Handling::Lookup).unwrap();
//! assert_eq!(ctx.handling(), Some(Handling::Lookup));
//! ```

/// Opaque ACL matchers with audit logging.
pub mod acl;

/// Collaborator interfaces consumed by the runtime.
pub mod collab;

/// Canonical textual forms of policy values.
pub mod convert;

/// Source-location execution counters.
pub mod coverage;

/// Execution context and the handling protocol.
pub mod ctx;

/// Lifecycle events delivered to programs, modules and directors.
pub mod event;

/// Scoped private state for extension modules.
pub mod scope;

/// Fragment-list string assembly.
pub mod strands;

/// Re-export all common types for easy access.
pub mod prelude {
    pub use crate::acl::{Acl, ip_cmp};
    pub use crate::collab::{Headers, LogSink, LogTag, Workspace, WorkspaceOverflow, WsSnapshot};
    pub use crate::coverage::{CoverageTable, SourceRef};
    pub use crate::ctx::{
        ExecCtx, ExecCtxBuilder, Handling, HashAccumulator, HeaderSelector, MsgBuilder, Phase,
        PhaseData, PolicyFault,
    };
    pub use crate::event::LifecycleEvent;
    pub use crate::scope::{ModuleIdent, PrivScope, PrivSlot, ScopeKind, SlotRef};
    pub use crate::strands::Strands;
}
