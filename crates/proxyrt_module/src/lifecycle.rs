//! Module instance lifecycle.
//!
//! A loaded module instance receives the lifecycle events of the program
//! instance that loaded it, in the program's own order: `Load` first and
//! exactly once (sent by the loader), `Warm`/`Cold` alternating, `Discard`
//! last and exactly once. The handle enforces that order — an event
//! arriving out of sequence is rejected before the module ever sees it.
//!
//! Delivery is serialized per handle; traffic through the module's hooks
//! proceeds concurrently on other threads.

use crate::descriptor::{HookFn, ModuleDescriptor, ModuleFailure};
use parking_lot::Mutex;
use proxyrt_core::ctx::ExecCtx;
use proxyrt_core::event::LifecycleEvent;
use proxyrt_core::scope::{ModuleIdent, PrivScope, ScopeKind};
use std::sync::Arc;

// ─────────────────────────────────────────────────────────────────────────────
// EventError
// ─────────────────────────────────────────────────────────────────────────────

/// Failed lifecycle event delivery.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The event is not legal in the handle's current state.
    #[error("module instance {instance:?}: event '{event}' not legal in state '{state}'")]
    OutOfOrder {
        /// Instance name.
        instance: String,
        /// State the handle was in.
        state: &'static str,
        /// The rejected event.
        event: LifecycleEvent,
    },

    /// The handle was already discarded; nothing can be delivered.
    #[error("module instance {instance:?} already discarded")]
    AlreadyDiscarded {
        /// Instance name.
        instance: String,
    },

    /// The module's own event entry refused the event.
    #[error("module instance {instance:?} rejected '{event}': {source}")]
    Module {
        /// Instance name.
        instance: String,
        /// The refused event.
        event: LifecycleEvent,
        /// The module's failure.
        source: ModuleFailure,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// ModuleHandle
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Loaded,
    Warm,
    Cold,
    Discarded,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Created => "created",
            State::Loaded => "loaded",
            State::Warm => "warm",
            State::Cold => "cold",
            State::Discarded => "discarded",
        }
    }
}

/// A validated, activated module instance.
///
/// Owns the instance's identity token and its module-instance
/// [`PrivScope`]; hooks resolve through it and lifecycle events flow
/// through [`deliver`](ModuleHandle::deliver).
pub struct ModuleHandle {
    instance: String,
    origin: String,
    ident: ModuleIdent,
    descriptor: ModuleDescriptor,
    scope: Arc<PrivScope>,
    state: Mutex<State>,
}

impl ModuleHandle {
    /// Creates an inactive handle; the loader delivers `Load` to activate
    /// it.
    pub(crate) fn new(
        instance: impl Into<String>,
        origin: impl Into<String>,
        descriptor: ModuleDescriptor,
    ) -> Self {
        Self {
            instance: instance.into(),
            origin: origin.into(),
            ident: ModuleIdent::fresh(),
            descriptor,
            scope: Arc::new(PrivScope::new(ScopeKind::ModuleInstance)),
            state: Mutex::new(State::Created),
        }
    }

    /// Returns the instance name the policy program imported the module
    /// under.
    #[must_use]
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Returns the path the module was loaded from.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Returns the instance's identity token, the key to its private-state
    /// slots.
    #[must_use]
    pub fn ident(&self) -> ModuleIdent {
        self.ident
    }

    /// Returns the module-instance scope.
    #[must_use]
    pub fn scope(&self) -> &PrivScope {
        &self.scope
    }

    /// Returns the validated descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    /// Looks an exported hook up by name.
    #[must_use]
    pub fn hook(&self, name: &str) -> Option<HookFn> {
        self.descriptor.functions.get(name)
    }

    /// Returns true once `Discard` has been delivered.
    #[must_use]
    pub fn is_discarded(&self) -> bool {
        *self.state.lock() == State::Discarded
    }

    /// Delivers a lifecycle event to the module.
    ///
    /// Events must follow `Load, Warm, (Cold, Warm)*, Cold, Discard`;
    /// `Discard` is also accepted straight from `Loaded` for instances
    /// that never served. The module's own refusal of `Load` or `Warm`
    /// leaves the state unchanged, so a failed warm-up can be retried.
    /// `Discard` always completes: the instance scope is finalized after
    /// the module's event entry returns, whatever that entry returned.
    ///
    /// # Errors
    ///
    /// [`EventError::OutOfOrder`] / [`EventError::AlreadyDiscarded`] for a
    /// sequence violation, [`EventError::Module`] when the module itself
    /// refuses the event.
    pub fn deliver(&self, ctx: &ExecCtx<'_>, event: LifecycleEvent) -> Result<(), EventError> {
        let mut state = self.state.lock();

        if *state == State::Discarded {
            return Err(EventError::AlreadyDiscarded {
                instance: self.instance.clone(),
            });
        }
        let next = match (*state, event) {
            (State::Created, LifecycleEvent::Load) => State::Loaded,
            (State::Loaded | State::Cold, LifecycleEvent::Warm) => State::Warm,
            (State::Warm, LifecycleEvent::Cold) => State::Cold,
            (State::Loaded | State::Cold, LifecycleEvent::Discard) => State::Discarded,
            _ => {
                return Err(EventError::OutOfOrder {
                    instance: self.instance.clone(),
                    state: state.name(),
                    event,
                });
            }
        };

        let result = self.descriptor.events.event(ctx, &self.scope, event);

        if next == State::Discarded {
            *state = next;
            self.scope.finalize_all();
            tracing::info!(instance = %self.instance, module = %self.descriptor.name, "module discarded");
            if let Err(source) = result {
                tracing::warn!(instance = %self.instance, %source, "module discard entry failed");
            }
            return Ok(());
        }

        match result {
            Ok(()) => {
                tracing::debug!(
                    instance = %self.instance,
                    module = %self.descriptor.name,
                    %event,
                    "lifecycle event delivered"
                );
                *state = next;
                Ok(())
            }
            Err(source) => Err(EventError::Module {
                instance: self.instance.clone(),
                event,
                source,
            }),
        }
    }

    /// Tears a discarded handle down. Idempotent; the only operation legal
    /// after `Discard`.
    ///
    /// # Errors
    ///
    /// [`EventError::OutOfOrder`] if the handle has not been discarded.
    pub fn unload(&self) -> Result<(), EventError> {
        let state = self.state.lock();
        if *state != State::Discarded {
            return Err(EventError::OutOfOrder {
                instance: self.instance.clone(),
                state: state.name(),
                event: LifecycleEvent::Discard,
            });
        }
        // Scope already finalized at discard; repeating is a no-op.
        self.scope.finalize_all();
        Ok(())
    }
}

impl core::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("instance", &self.instance)
            .field("module", &self.descriptor.name)
            .field("ident", &self.ident)
            .field("state", &self.state.lock().name())
            .finish()
    }
}
