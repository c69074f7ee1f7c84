//! Collaborator interfaces consumed by the runtime.
//!
//! The runtime does not implement scratch allocation, request logging or the
//! HTTP header object model itself. It consumes them through the narrow
//! traits in this module; the surrounding pipeline supplies the real
//! implementations. Mock implementations for tests live behind the
//! `test-utils` feature, following the same pattern as a mockable clock:
//! trait at the seam, production impl outside, deterministic impl gated.
//!
//! # Example
//!
//! ```
//! use proxyrt_core::collab::{LogSink, LogTag};
//! use proxyrt_core::ctx::Phase;
//!
//! struct StderrLog;
//!
//! impl LogSink for StderrLog {
//!     fn emit(&self, phase: Phase, tag: LogTag, msg: &str) {
//!         tracing::info!(?phase, ?tag, msg, "request log");
//!     }
//! }
//! ```

use crate::ctx::Phase;

// ─────────────────────────────────────────────────────────────────────────────
// Workspace
// ─────────────────────────────────────────────────────────────────────────────

/// The scratch budget of a request ran out.
///
/// Raised when a reservation against the per-request workspace cannot be
/// satisfied. The transaction that hits this typically fails over to a
/// synthesized error response; the workspace itself is reset between
/// requests by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("workspace overflow: needed {needed} bytes, {remaining} remaining")]
pub struct WorkspaceOverflow {
    /// Bytes the failed reservation asked for.
    pub needed: usize,
    /// Bytes that were still available.
    pub remaining: usize,
}

/// Opaque mark into a workspace, returned by [`Workspace::snapshot`].
///
/// Releasing a snapshot returns the workspace to the state it had when the
/// snapshot was taken, discarding every reservation made since.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WsSnapshot(pub(crate) usize);

impl WsSnapshot {
    /// Creates a snapshot from a raw high-water mark.
    ///
    /// Only workspace implementations should need this.
    #[must_use]
    pub fn from_mark(mark: usize) -> Self {
        Self(mark)
    }

    /// Returns the raw high-water mark.
    #[must_use]
    pub fn mark(&self) -> usize {
        self.0
    }
}

/// Per-request bounded scratch allocator.
///
/// The arena mechanics are external; this core only needs to charge the
/// budget (so string materialization cannot blow past the request's scratch
/// space) and to bracket speculative work with snapshot/release.
pub trait Workspace: Send + Sync {
    /// Charges `len` bytes against the budget.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceOverflow`] if the budget cannot cover `len`.
    fn reserve(&self, len: usize) -> Result<(), WorkspaceOverflow>;

    /// Returns a mark for the current usage level.
    fn snapshot(&self) -> WsSnapshot;

    /// Rolls usage back to a previously taken snapshot.
    fn release(&self, snap: WsSnapshot);

    /// Returns the number of bytes still available.
    fn remaining(&self) -> usize;
}

// ─────────────────────────────────────────────────────────────────────────────
// LogSink
// ─────────────────────────────────────────────────────────────────────────────

/// Category tag for a request-log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogTag {
    /// ACL match attempt (address and outcome, logged unconditionally).
    Acl,
    /// Policy-program fault (handling misuse, failed transaction).
    Fault,
    /// Handling decision taken by a hook.
    Handling,
    /// Health-probe activity attributed to a request view.
    Probe,
    /// Extension-module activity.
    Module,
    /// Backend/director activity.
    Backend,
    /// Free-form diagnostics.
    Debug,
}

/// Append-only, phase-tagged structured log for one request.
///
/// Distinct from the runtime's own `tracing` diagnostics: records emitted
/// here belong to the request being processed and are read back by the
/// operator per transaction.
pub trait LogSink: Send + Sync {
    /// Appends one record.
    fn emit(&self, phase: Phase, tag: LogTag, msg: &str);
}

// ─────────────────────────────────────────────────────────────────────────────
// Headers
// ─────────────────────────────────────────────────────────────────────────────

/// Accessor over one logical header view.
///
/// The header object model (storage, folding, serialization) is external.
/// Implementations are expected to use interior mutability; the runtime
/// hands out shared references only.
pub trait Headers {
    /// Returns the value of `name`, if present.
    fn get(&self, name: &str) -> Option<String>;

    /// Sets `name` to `value`, replacing any existing value.
    fn set(&self, name: &str, value: &str);

    /// Removes `name` if present.
    fn unset(&self, name: &str);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test implementations
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(any(test, feature = "test-utils"))]
mod mocks {
    use super::{Headers, LogSink, LogTag, Workspace, WorkspaceOverflow, WsSnapshot};
    use crate::ctx::Phase;
    use parking_lot::Mutex;

    /// One record captured by [`MemoryLog`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct LogRecord {
        /// Phase the record was emitted under.
        pub phase: Phase,
        /// Record category.
        pub tag: LogTag,
        /// Record text.
        pub msg: String,
    }

    /// In-memory [`LogSink`] for asserting on emitted records.
    #[derive(Default)]
    pub struct MemoryLog {
        records: Mutex<Vec<LogRecord>>,
    }

    impl MemoryLog {
        /// Creates an empty log.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Returns a copy of everything emitted so far.
        #[must_use]
        pub fn records(&self) -> Vec<LogRecord> {
            self.records.lock().clone()
        }

        /// Returns the records carrying `tag`.
        #[must_use]
        pub fn with_tag(&self, tag: LogTag) -> Vec<LogRecord> {
            self.records
                .lock()
                .iter()
                .filter(|r| r.tag == tag)
                .cloned()
                .collect()
        }
    }

    impl LogSink for MemoryLog {
        fn emit(&self, phase: Phase, tag: LogTag, msg: &str) {
            self.records.lock().push(LogRecord {
                phase,
                tag,
                msg: msg.to_string(),
            });
        }
    }

    /// [`Workspace`] that tracks a byte budget without a real arena.
    pub struct BudgetWorkspace {
        capacity: usize,
        used: Mutex<usize>,
    }

    impl BudgetWorkspace {
        /// Creates a workspace with `capacity` bytes of budget.
        #[must_use]
        pub fn new(capacity: usize) -> Self {
            Self {
                capacity,
                used: Mutex::new(0),
            }
        }
    }

    impl Workspace for BudgetWorkspace {
        fn reserve(&self, len: usize) -> Result<(), WorkspaceOverflow> {
            let mut used = self.used.lock();
            let remaining = self.capacity - *used;
            if len > remaining {
                return Err(WorkspaceOverflow {
                    needed: len,
                    remaining,
                });
            }
            *used += len;
            Ok(())
        }

        fn snapshot(&self) -> WsSnapshot {
            WsSnapshot(*self.used.lock())
        }

        fn release(&self, snap: WsSnapshot) {
            let mut used = self.used.lock();
            debug_assert!(snap.0 <= *used, "snapshot release out of order");
            *used = snap.0;
        }

        fn remaining(&self) -> usize {
            self.capacity - *self.used.lock()
        }
    }

    /// [`Headers`] backed by a flat name/value list.
    #[derive(Default)]
    pub struct MockHeaders {
        inner: Mutex<Vec<(String, String)>>,
    }

    impl MockHeaders {
        /// Creates an empty header view.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Returns the number of headers present.
        #[must_use]
        pub fn len(&self) -> usize {
            self.inner.lock().len()
        }

        /// Returns true if no headers are present.
        #[must_use]
        pub fn is_empty(&self) -> bool {
            self.inner.lock().is_empty()
        }
    }

    impl Headers for MockHeaders {
        fn get(&self, name: &str) -> Option<String> {
            self.inner
                .lock()
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        }

        fn set(&self, name: &str, value: &str) {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
                entry.1 = value.to_string();
            } else {
                inner.push((name.to_string(), value.to_string()));
            }
        }

        fn unset(&self, name: &str) {
            self.inner.lock().retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use mocks::{BudgetWorkspace, LogRecord, MemoryLog, MockHeaders};
