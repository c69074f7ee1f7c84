//! Scoped private state for extension modules.
//!
//! A module may stash arbitrary opaque state in one of three nested
//! lifetime domains: per-phase task, per-top-request (shared with nested
//! sub-requests), and per-module-instance. Each `(scope, module)` pair maps
//! to at most one live slot; an optional release callback runs exactly once
//! when the owning scope ends.
//!
//! Finalization synchronizes by scope-exit ordering, not per-read locking:
//! the pipeline only finalizes a scope once nothing can still hold a
//! reference into it (task end, outermost-request end, module discard).
//!
//! # Example
//!
//! ```
//! use proxyrt_core::scope::{ModuleIdent, PrivScope, ScopeKind};
//!
//! let task = PrivScope::new(ScopeKind::Task);
//! let me = ModuleIdent::fresh();
//!
//! task.get_or_create(me).store(vec![1u8, 2, 3]);
//! assert_eq!(
//!     task.get_or_create(me).get::<Vec<u8>>().map(Vec::len),
//!     Some(3)
//! );
//!
//! task.finalize_all(); // end of the phase's transaction
//! assert!(task.get_or_create(me).is_empty());
//! ```

use core::any::Any;
use core::fmt;
use core::ops::{Deref, DerefMut};
use hashbrown::HashMap;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

// ─────────────────────────────────────────────────────────────────────────────
// ModuleIdent
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque identity token of a loaded module instance.
///
/// Issued once per activation; keys private-state slots so two modules (or
/// two instances of one module) never see each other's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleIdent(u64);

static NEXT_IDENT: AtomicU64 = AtomicU64::new(1);

impl ModuleIdent {
    /// Issues a process-unique identity token.
    #[must_use]
    pub fn fresh() -> Self {
        Self(NEXT_IDENT.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw token value.
    #[must_use]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ScopeKind
// ─────────────────────────────────────────────────────────────────────────────

/// The lifetime domain of a private-state scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    /// Lives as long as the loaded module instance; finalized during the
    /// module's discard.
    ModuleInstance,
    /// Lives as long as the outermost client request, shared across any
    /// nested sub-requests it spawns.
    TopRequest,
    /// Lives as long as the current phase's transaction; the narrowest
    /// scope.
    Task,
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScopeKind::ModuleInstance => "module-instance",
            ScopeKind::TopRequest => "top-request",
            ScopeKind::Task => "task",
        };
        f.write_str(s)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PrivSlot
// ─────────────────────────────────────────────────────────────────────────────

/// Type-erased payload stored in a slot.
pub type Payload = Box<dyn Any + Send + Sync>;

type Finalizer = Box<dyn FnOnce(Payload) + Send>;

/// One module's storage slot within a scope.
#[derive(Default)]
pub struct PrivSlot {
    payload: Option<Payload>,
    finalizer: Option<Finalizer>,
}

impl PrivSlot {
    /// Returns true if no payload is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_none()
    }

    /// Stores a payload with no release callback.
    ///
    /// Replacing an existing payload runs its release callback first, so a
    /// callback never outlives the payload it guards.
    pub fn store<T: Any + Send + Sync>(&mut self, value: T) {
        self.release_current();
        self.payload = Some(Box::new(value));
    }

    /// Stores a payload with a release callback.
    ///
    /// The callback runs exactly once, when the owning scope ends (or the
    /// payload is replaced), with the payload it guarded.
    pub fn store_with<T: Any + Send + Sync>(
        &mut self,
        value: T,
        on_release: impl FnOnce(T) + Send + 'static,
    ) {
        self.release_current();
        self.payload = Some(Box::new(value));
        self.finalizer = Some(Box::new(move |payload: Payload| {
            if let Ok(v) = payload.downcast::<T>() {
                on_release(*v);
            }
        }));
    }

    /// Returns the payload downcast to `T`.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.payload.as_ref().and_then(|p| p.downcast_ref::<T>())
    }

    /// Returns the payload downcast to `T`, mutably.
    #[must_use]
    pub fn get_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.payload.as_mut().and_then(|p| p.downcast_mut::<T>())
    }

    /// Takes the payload out without running the release callback.
    ///
    /// The callback is dropped along with the slot's claim on the payload;
    /// the caller assumes ownership.
    #[must_use]
    pub fn take<T: Any + Send + Sync>(&mut self) -> Option<T> {
        if self.payload.as_ref().is_some_and(|p| p.is::<T>()) {
            self.finalizer = None;
            return self
                .payload
                .take()
                .and_then(|p| p.downcast::<T>().ok())
                .map(|b| *b);
        }
        None
    }

    /// Runs the release callback on the current payload, emptying the slot.
    fn release_current(&mut self) {
        let payload = self.payload.take();
        let finalizer = self.finalizer.take();
        if let Some(payload) = payload {
            if let Some(fin) = finalizer {
                fin(payload);
            }
        }
    }
}

impl fmt::Debug for PrivSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivSlot")
            .field("occupied", &self.payload.is_some())
            .field("has_finalizer", &self.finalizer.is_some())
            .finish()
    }
}

/// Guard over one module's slot, holding the scope's registry lock.
///
/// Short-lived by design: take it, read or write the slot, drop it.
pub struct SlotRef<'a>(MappedMutexGuard<'a, PrivSlot>);

impl Deref for SlotRef<'_> {
    type Target = PrivSlot;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SlotRef<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PrivScope
// ─────────────────────────────────────────────────────────────────────────────

/// One private-state lifetime domain.
///
/// The pipeline owns one `Task` scope per phase transaction, one
/// `TopRequest` scope per outermost request, and the module loader owns one
/// `ModuleInstance` scope per activated module. Dropping a scope finalizes
/// every remaining slot.
pub struct PrivScope {
    kind: ScopeKind,
    slots: Mutex<HashMap<ModuleIdent, PrivSlot>>,
}

impl PrivScope {
    /// Creates an empty scope for the given lifetime domain.
    #[must_use]
    pub fn new(kind: ScopeKind) -> Self {
        Self {
            kind,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the scope's lifetime domain.
    #[must_use]
    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    /// Returns the slot for `module`, creating an empty one if absent.
    ///
    /// At most one live slot exists per `(scope, module)` pair; repeated
    /// calls return the same slot.
    #[must_use]
    pub fn get_or_create(&self, module: ModuleIdent) -> SlotRef<'_> {
        let guard = self.slots.lock();
        SlotRef(MutexGuard::map(guard, |slots| {
            slots.entry(module).or_default()
        }))
    }

    /// Finalizes `module`'s slot: runs its release callback (if any) and
    /// marks the slot empty.
    ///
    /// Safe to call on an absent or already-empty slot (no-op). The
    /// callback runs outside the registry lock.
    pub fn finalize(&self, module: ModuleIdent) {
        let parts = {
            let mut slots = self.slots.lock();
            slots
                .get_mut(&module)
                .map(|slot| (slot.payload.take(), slot.finalizer.take()))
        };
        if let Some((Some(payload), Some(fin))) = parts {
            fin(payload);
        }
    }

    /// Finalizes every slot in the scope; called at scope end.
    pub fn finalize_all(&self) {
        let drained: Vec<(Option<Payload>, Option<Finalizer>)> = {
            let mut slots = self.slots.lock();
            slots
                .drain()
                .map(|(_, mut slot)| (slot.payload.take(), slot.finalizer.take()))
                .collect()
        };
        for (payload, finalizer) in drained {
            if let (Some(payload), Some(fin)) = (payload, finalizer) {
                fin(payload);
            }
        }
    }
}

impl Drop for PrivScope {
    fn drop(&mut self) {
        self.finalize_all();
    }
}

impl fmt::Debug for PrivScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivScope")
            .field("kind", &self.kind)
            .field("slots", &self.slots.lock().len())
            .finish()
    }
}
