//! Per-hook execution context and the handling protocol.
//!
//! Every hook of a compiled policy program receives an [`ExecCtx`] by shared
//! reference. The context binds the current [`Phase`], the request's header
//! views, the scratch [`Workspace`], the request [`LogSink`], two clocks and
//! an optional phase-specific payload. The hook directs the surrounding
//! request state machine by writing the context's handling slot exactly once
//! per invocation.
//!
//! The pipeline that drives the state machine owns the context's allocation:
//! it builds one immediately before entering compiled hook code for a phase
//! and reads the handling slot back after the hook returns.
//!
//! # Example
//!
//! ```
//! use proxyrt_core::collab::{BudgetWorkspace, MemoryLog};
//! use proxyrt_core::ctx::{ExecCtx, Handling, Phase};
//!
//! let ws = BudgetWorkspace::new(4096);
//! let log = MemoryLog::new();
//! let ctx = ExecCtx::builder(Phase::Recv, &ws, &log).build();
//!
//! // Inside a compiled hook:
//! ctx.set_handling(Handling::Lookup).unwrap();
//!
//! // Back in the pipeline:
//! assert_eq!(ctx.handling(), Some(Handling::Lookup));
//! ```

use crate::collab::{Headers, LogSink, LogTag, Workspace};
use crate::coverage::CoverageTable;
use core::any::type_name;
use core::cell::Cell;
use core::fmt;
use downcast_rs::{Downcast, impl_downcast};
use parking_lot::Mutex;
use std::time::SystemTime;

// ─────────────────────────────────────────────────────────────────────────────
// Phase
// ─────────────────────────────────────────────────────────────────────────────

/// The request state-machine phase a hook runs under.
///
/// Which header views exist and which [`Handling`] transitions are legal
/// both depend on the phase; see [`Phase::permits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Policy-program initialization (no request in flight).
    Init,
    /// Client request received.
    Recv,
    /// Request switched to raw pipe mode.
    Pipe,
    /// Cache bypass decided.
    Pass,
    /// Cache-key assembly.
    Hash,
    /// Cache invalidation request.
    Purge,
    /// Cache lookup missed.
    Miss,
    /// Cache lookup hit.
    Hit,
    /// Response delivery to the client.
    Deliver,
    /// Synthetic response generation.
    Synth,
    /// Backend request about to be sent.
    BackendFetch,
    /// Backend response headers received.
    BackendResponse,
    /// Backend fetch failed.
    BackendError,
    /// Policy-program teardown (no request in flight).
    Fini,
}

impl Phase {
    /// Returns true if `handling` is a legal transition out of this phase.
    #[must_use]
    pub fn permits(self, handling: Handling) -> bool {
        use Handling as H;
        use Phase as P;
        // Fail aborts the transaction and is legal everywhere.
        if handling == H::Fail {
            return true;
        }
        match self {
            P::Init | P::Fini => matches!(handling, H::Ok),
            P::Recv => matches!(handling, H::Lookup | H::Pass | H::Pipe | H::Purge | H::Synth),
            P::Pipe => matches!(handling, H::Pipe | H::Synth),
            P::Pass => matches!(handling, H::Fetch | H::Synth | H::Restart),
            P::Hash => matches!(handling, H::Lookup),
            P::Purge => matches!(handling, H::Synth | H::Restart),
            P::Miss => matches!(handling, H::Fetch | H::Pass | H::Synth | H::Restart),
            P::Hit => matches!(handling, H::Deliver | H::Pass | H::Synth | H::Restart),
            P::Deliver => matches!(handling, H::Deliver | H::Synth | H::Restart),
            P::Synth => matches!(handling, H::Deliver | H::Restart),
            P::BackendFetch => matches!(handling, H::Fetch | H::Abandon),
            P::BackendResponse | P::BackendError => {
                matches!(handling, H::Deliver | H::Abandon | H::Retry)
            }
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Init => "init",
            Phase::Recv => "recv",
            Phase::Pipe => "pipe",
            Phase::Pass => "pass",
            Phase::Hash => "hash",
            Phase::Purge => "purge",
            Phase::Miss => "miss",
            Phase::Hit => "hit",
            Phase::Deliver => "deliver",
            Phase::Synth => "synth",
            Phase::BackendFetch => "backend_fetch",
            Phase::BackendResponse => "backend_response",
            Phase::BackendError => "backend_error",
            Phase::Fini => "fini",
        };
        f.write_str(s)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handling
// ─────────────────────────────────────────────────────────────────────────────

/// The next request state-machine transition, as directed by a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handling {
    /// No transition; continue with the phase's default (init/fini only).
    Ok,
    /// Look the object up in the cache.
    Lookup,
    /// Bypass the cache for this request.
    Pass,
    /// Switch to raw pipe mode.
    Pipe,
    /// Invalidate matching cached objects.
    Purge,
    /// Synthesize a response instead of fetching one.
    Synth,
    /// Restart request processing from the top.
    Restart,
    /// Fetch the object from a backend.
    Fetch,
    /// Deliver the response to the client.
    Deliver,
    /// Abandon the backend fetch.
    Abandon,
    /// Retry the backend fetch.
    Retry,
    /// Fail the transaction.
    Fail,
}

impl fmt::Display for Handling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Handling::Ok => "ok",
            Handling::Lookup => "lookup",
            Handling::Pass => "pass",
            Handling::Pipe => "pipe",
            Handling::Purge => "purge",
            Handling::Synth => "synth",
            Handling::Restart => "restart",
            Handling::Fetch => "fetch",
            Handling::Deliver => "deliver",
            Handling::Abandon => "abandon",
            Handling::Retry => "retry",
            Handling::Fail => "fail",
        };
        f.write_str(s)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PolicyFault
// ─────────────────────────────────────────────────────────────────────────────

/// Misuse of the handling protocol by a compiled policy program.
///
/// A fault aborts the current transaction (the pipeline synthesizes an error
/// response); it never crashes the process and is never silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PolicyFault {
    /// The handling slot was written twice in one hook invocation.
    #[error("handling already set to '{prev}' in phase '{phase}', refusing '{requested}'")]
    HandlingAlreadySet {
        /// Phase the hook ran under.
        phase: Phase,
        /// The handling that had already been set.
        prev: Handling,
        /// The handling the second call asked for.
        requested: Handling,
    },

    /// The requested handling is not a legal transition out of this phase.
    #[error("handling '{requested}' not permitted in phase '{phase}'")]
    HandlingNotPermitted {
        /// Phase the hook ran under.
        phase: Phase,
        /// The illegal handling.
        requested: Handling,
    },

    /// The phase-specific payload was read under the wrong phase.
    #[error("phase '{phase}' carries no payload of type {expected}")]
    PhasePayload {
        /// Phase the hook ran under.
        phase: Phase,
        /// Type name the caller asked for.
        expected: &'static str,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Phase-specific payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Marker for phase-specific context payloads.
///
/// Exactly one payload interpretation is valid per phase: a hash accumulator
/// during [`Phase::Hash`], a message builder during [`Phase::Synth`] and
/// [`Phase::BackendError`]. Reading the payload under any other phase is a
/// [`PolicyFault`].
pub trait PhaseData: Downcast + Send + Sync {}
impl_downcast!(PhaseData);

/// Cache-key accumulator, the payload of [`Phase::Hash`].
#[derive(Default)]
pub struct HashAccumulator {
    buf: Mutex<Vec<u8>>,
}

impl PhaseData for HashAccumulator {}

impl HashAccumulator {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes to the key material.
    pub fn update(&self, bytes: &[u8]) {
        self.buf.lock().extend_from_slice(bytes);
    }

    /// Returns the number of bytes accumulated.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    /// Returns true if nothing was accumulated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.lock().is_empty()
    }

    /// Takes the accumulated key material, leaving the accumulator empty.
    #[must_use]
    pub fn take(&self) -> Vec<u8> {
        core::mem::take(&mut *self.buf.lock())
    }
}

/// Synthetic-response body builder, the payload of [`Phase::Synth`] and
/// [`Phase::BackendError`].
#[derive(Default)]
pub struct MsgBuilder {
    buf: Mutex<String>,
}

impl PhaseData for MsgBuilder {}

impl MsgBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends text to the body.
    pub fn append(&self, s: &str) {
        self.buf.lock().push_str(s);
    }

    /// Returns the number of bytes built so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    /// Returns true if the body is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.lock().is_empty()
    }

    /// Takes the built body, leaving the builder empty.
    #[must_use]
    pub fn take(&self) -> String {
        core::mem::take(&mut *self.buf.lock())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Header views
// ─────────────────────────────────────────────────────────────────────────────

/// Selector for the six logical header views a context may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderSelector {
    /// Client request headers.
    Req,
    /// Client request headers of the outermost request (nested sub-requests
    /// see their parent chain's top here).
    ReqTop,
    /// Client response headers.
    Resp,
    /// Cached-object headers.
    Obj,
    /// Backend request headers.
    Bereq,
    /// Backend response headers.
    Beresp,
}

/// The header views present for one context.
///
/// Each view may be absent depending on the phase; the pipeline wires up
/// whichever views exist.
#[derive(Default, Clone, Copy)]
pub struct HeaderViews<'a> {
    req: Option<&'a dyn Headers>,
    req_top: Option<&'a dyn Headers>,
    resp: Option<&'a dyn Headers>,
    obj: Option<&'a dyn Headers>,
    bereq: Option<&'a dyn Headers>,
    beresp: Option<&'a dyn Headers>,
}

impl<'a> HeaderViews<'a> {
    /// Returns the view for `sel`, if present.
    #[must_use]
    pub fn select(&self, sel: HeaderSelector) -> Option<&'a dyn Headers> {
        match sel {
            HeaderSelector::Req => self.req,
            HeaderSelector::ReqTop => self.req_top,
            HeaderSelector::Resp => self.resp,
            HeaderSelector::Obj => self.obj,
            HeaderSelector::Bereq => self.bereq,
            HeaderSelector::Beresp => self.beresp,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ExecCtx
// ─────────────────────────────────────────────────────────────────────────────

/// The execution context threaded through every hook invocation.
///
/// Hooks receive a shared reference; the only mutation they perform goes
/// through the interior handling slot ([`set_handling`](Self::set_handling),
/// [`fail`](Self::fail)). Contexts are never shared across concurrent
/// requests, and one context is often reused across a request's multiple
/// hook calls within a phase.
pub struct ExecCtx<'a> {
    phase: Phase,
    handling: Cell<Option<Handling>>,
    failed: Cell<bool>,
    ws: &'a dyn Workspace,
    log: &'a dyn LogSink,
    headers: HeaderViews<'a>,
    now: SystemTime,
    ttl_now: SystemTime,
    specific: Option<&'a dyn PhaseData>,
    coverage: Option<&'a CoverageTable>,
}

impl<'a> ExecCtx<'a> {
    /// Starts building a context for `phase`.
    #[must_use]
    pub fn builder(
        phase: Phase,
        ws: &'a dyn Workspace,
        log: &'a dyn LogSink,
    ) -> ExecCtxBuilder<'a> {
        ExecCtxBuilder {
            phase,
            ws,
            log,
            headers: HeaderViews::default(),
            now: None,
            ttl_now: None,
            specific: None,
            coverage: None,
        }
    }

    /// Returns the current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns the handling written by the hook, if any.
    ///
    /// Read by the pipeline after the hook returns.
    #[must_use]
    pub fn handling(&self) -> Option<Handling> {
        self.handling.get()
    }

    /// Returns true if [`fail`](Self::fail) was called on this context.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.failed.get()
    }

    /// Returns the request's scratch workspace.
    #[must_use]
    pub fn workspace(&self) -> &'a dyn Workspace {
        self.ws
    }

    /// Returns the request log sink.
    #[must_use]
    pub fn log(&self) -> &'a dyn LogSink {
        self.log
    }

    /// Returns the wall clock of this hook invocation.
    #[must_use]
    pub fn now(&self) -> SystemTime {
        self.now
    }

    /// Returns the object-retention clock.
    ///
    /// Usually equal to [`now`](Self::now); the pipeline may supply a
    /// diverging value when the retention clock is overridden.
    #[must_use]
    pub fn ttl_now(&self) -> SystemTime {
        self.ttl_now
    }

    /// Returns the header view for `sel`, if present in this phase.
    #[must_use]
    pub fn headers(&self, sel: HeaderSelector) -> Option<&'a dyn Headers> {
        self.headers.select(sel)
    }

    /// Directs the request state machine's next transition.
    ///
    /// At most one handling may be set per hook invocation, and it must be
    /// legal for the current phase.
    ///
    /// # Errors
    ///
    /// Returns a [`PolicyFault`] (also emitted to the request log) if the
    /// slot was already written or `handling` is illegal for this phase.
    pub fn set_handling(&self, handling: Handling) -> Result<(), PolicyFault> {
        if !self.phase.permits(handling) {
            let fault = PolicyFault::HandlingNotPermitted {
                phase: self.phase,
                requested: handling,
            };
            self.log.emit(self.phase, LogTag::Fault, &fault.to_string());
            return Err(fault);
        }
        if let Some(prev) = self.handling.get() {
            let fault = PolicyFault::HandlingAlreadySet {
                phase: self.phase,
                prev,
                requested: handling,
            };
            self.log.emit(self.phase, LogTag::Fault, &fault.to_string());
            return Err(fault);
        }
        self.handling.set(Some(handling));
        self.log
            .emit(self.phase, LogTag::Handling, &handling.to_string());
        Ok(())
    }

    /// Aborts the current transaction with a diagnostic message.
    ///
    /// Idempotent: the first call records the failure and forces the
    /// handling slot to [`Handling::Fail`]; subsequent calls only log.
    pub fn fail(&self, msg: &str) {
        if self.failed.get() {
            self.log
                .emit(self.phase, LogTag::Fault, &format!("fail (repeated): {msg}"));
            return;
        }
        self.failed.set(true);
        self.handling.set(Some(Handling::Fail));
        self.log
            .emit(self.phase, LogTag::Fault, &format!("transaction failed: {msg}"));
    }

    /// Records execution of the policy-program source location `idx`.
    ///
    /// Coverage instrumentation only: bumps a counter, never affects
    /// behavior. No-op when the pipeline attached no coverage table.
    pub fn count(&self, idx: usize) {
        if let Some(cov) = self.coverage {
            cov.hit(idx);
        }
    }

    /// Returns the phase-specific payload downcast to `T`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyFault::PhasePayload`] if the current phase carries no
    /// payload of type `T`.
    pub fn phase_data<T: PhaseData>(&self) -> Result<&'a T, PolicyFault> {
        self.specific
            .and_then(|d| d.downcast_ref::<T>())
            .ok_or(PolicyFault::PhasePayload {
                phase: self.phase,
                expected: type_name::<T>(),
            })
    }

    /// Appends bytes to the cache-key accumulator.
    ///
    /// # Errors
    ///
    /// Faults unless called during [`Phase::Hash`] with a hash payload.
    pub fn hash_data(&self, bytes: &[u8]) -> Result<(), PolicyFault> {
        if self.phase != Phase::Hash {
            return Err(PolicyFault::PhasePayload {
                phase: self.phase,
                expected: type_name::<HashAccumulator>(),
            });
        }
        self.phase_data::<HashAccumulator>()?.update(bytes);
        Ok(())
    }

    /// Appends text to the synthetic-response body.
    ///
    /// # Errors
    ///
    /// Faults unless called during [`Phase::Synth`] or
    /// [`Phase::BackendError`] with a message-builder payload.
    pub fn synth_body(&self, s: &str) -> Result<(), PolicyFault> {
        if !matches!(self.phase, Phase::Synth | Phase::BackendError) {
            return Err(PolicyFault::PhasePayload {
                phase: self.phase,
                expected: type_name::<MsgBuilder>(),
            });
        }
        self.phase_data::<MsgBuilder>()?.append(s);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ExecCtxBuilder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for [`ExecCtx`], used by the surrounding pipeline.
///
/// Unset clocks default to the current wall time; `ttl_now` defaults to
/// `now`; the top request view defaults to the request view (they only
/// diverge for nested sub-requests).
pub struct ExecCtxBuilder<'a> {
    phase: Phase,
    ws: &'a dyn Workspace,
    log: &'a dyn LogSink,
    headers: HeaderViews<'a>,
    now: Option<SystemTime>,
    ttl_now: Option<SystemTime>,
    specific: Option<&'a dyn PhaseData>,
    coverage: Option<&'a CoverageTable>,
}

impl<'a> ExecCtxBuilder<'a> {
    /// Attaches the client request header view.
    #[must_use]
    pub fn req(mut self, h: &'a dyn Headers) -> Self {
        self.headers.req = Some(h);
        self
    }

    /// Attaches the outermost client request header view.
    #[must_use]
    pub fn req_top(mut self, h: &'a dyn Headers) -> Self {
        self.headers.req_top = Some(h);
        self
    }

    /// Attaches the client response header view.
    #[must_use]
    pub fn resp(mut self, h: &'a dyn Headers) -> Self {
        self.headers.resp = Some(h);
        self
    }

    /// Attaches the cached-object header view.
    #[must_use]
    pub fn obj(mut self, h: &'a dyn Headers) -> Self {
        self.headers.obj = Some(h);
        self
    }

    /// Attaches the backend request header view.
    #[must_use]
    pub fn bereq(mut self, h: &'a dyn Headers) -> Self {
        self.headers.bereq = Some(h);
        self
    }

    /// Attaches the backend response header view.
    #[must_use]
    pub fn beresp(mut self, h: &'a dyn Headers) -> Self {
        self.headers.beresp = Some(h);
        self
    }

    /// Sets the wall clock.
    #[must_use]
    pub fn now(mut self, t: SystemTime) -> Self {
        self.now = Some(t);
        self
    }

    /// Sets the object-retention clock.
    #[must_use]
    pub fn ttl_now(mut self, t: SystemTime) -> Self {
        self.ttl_now = Some(t);
        self
    }

    /// Attaches the phase-specific payload.
    #[must_use]
    pub fn phase_data(mut self, data: &'a dyn PhaseData) -> Self {
        self.specific = Some(data);
        self
    }

    /// Attaches the coverage counter table.
    #[must_use]
    pub fn coverage(mut self, cov: &'a CoverageTable) -> Self {
        self.coverage = Some(cov);
        self
    }

    /// Builds the context.
    #[must_use]
    pub fn build(self) -> ExecCtx<'a> {
        let now = self.now.unwrap_or_else(SystemTime::now);
        let mut headers = self.headers;
        if headers.req_top.is_none() {
            headers.req_top = headers.req;
        }
        ExecCtx {
            phase: self.phase,
            handling: Cell::new(None),
            failed: Cell::new(false),
            ws: self.ws,
            log: self.log,
            headers,
            now,
            ttl_now: self.ttl_now.unwrap_or(now),
            specific: self.specific,
            coverage: self.coverage,
        }
    }
}
