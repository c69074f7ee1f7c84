//! Module descriptors.
//!
//! An extension module exports exactly one [`ModuleDescriptor`]. Its
//! version and identity fields come first and are the only thing the
//! loader reads before deciding whether the rest of the record can be
//! trusted at all; the function table, signatures and event entry are
//! touched only after validation passes.

use proxyrt_core::ctx::{ExecCtx, PolicyFault};
use proxyrt_core::event::LifecycleEvent;
use proxyrt_core::scope::PrivScope;
use std::sync::Arc;

// ─────────────────────────────────────────────────────────────────────────────
// Function table
// ─────────────────────────────────────────────────────────────────────────────

/// A hook exported by a module, callable from compiled policy code.
pub type HookFn = fn(&ExecCtx<'_>) -> Result<(), PolicyFault>;

/// One named entry of a module's function table.
#[derive(Clone)]
pub struct FuncSlot {
    /// Exported hook name.
    pub name: &'static str,
    /// The hook itself.
    pub func: HookFn,
}

impl core::fmt::Debug for FuncSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FuncSlot").field("name", &self.name).finish()
    }
}

/// A module's exported hooks, in declaration order.
///
/// The compiled policy program addresses hooks by table position; the
/// loader only hands a table out after its length matched the module's
/// declared length.
#[derive(Debug, Clone, Default)]
pub struct FunctionTable {
    slots: Vec<FuncSlot>,
}

impl FunctionTable {
    /// Builds a table from slots in declaration order.
    #[must_use]
    pub fn new(slots: Vec<FuncSlot>) -> Self {
        Self { slots }
    }

    /// Returns the number of exported hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if the module exports no hooks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Looks a hook up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<HookFn> {
        self.slots.iter().find(|s| s.name == name).map(|s| s.func)
    }

    /// Returns the hook at a table position.
    #[must_use]
    pub fn at(&self, index: usize) -> Option<HookFn> {
        self.slots.get(index).map(|s| s.func)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ModuleEvents
// ─────────────────────────────────────────────────────────────────────────────

/// A module's own failure, surfaced through event delivery.
pub type ModuleFailure = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The lifecycle entry point of a module.
///
/// Receives the module-instance scope so `Load` can populate instance
/// state and `Discard` can hand resources back before the scope is
/// finalized.
pub trait ModuleEvents: Send + Sync {
    /// Reacts to one lifecycle event of the owning program instance.
    ///
    /// # Errors
    ///
    /// A module may refuse `Load` or `Warm` by returning its own error;
    /// the activation attempt then fails as a whole.
    fn event(
        &self,
        ctx: &ExecCtx<'_>,
        scope: &PrivScope,
        event: LifecycleEvent,
    ) -> Result<(), ModuleFailure>;
}

/// Event entry for modules with no lifecycle needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEvents;

impl ModuleEvents for NoEvents {
    fn event(
        &self,
        _ctx: &ExecCtx<'_>,
        _scope: &PrivScope,
        _event: LifecycleEvent,
    ) -> Result<(), ModuleFailure> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ModuleDescriptor
// ─────────────────────────────────────────────────────────────────────────────

/// The record an extension module exports to the loader.
///
/// `abi_major`, `abi_minor` and `build_identity` must stay the leading
/// fields: the loader validates them before trusting anything below.
#[derive(Clone)]
pub struct ModuleDescriptor {
    /// ABI major version the module was built against. Must match the
    /// runtime exactly.
    pub abi_major: u16,
    /// ABI minor version the module was built against.
    pub abi_minor: u16,
    /// Build-time identity tying this binary to the compiled policy
    /// program that references it.
    pub build_identity: String,
    /// Module name.
    pub name: String,
    /// Exported hooks.
    pub functions: FunctionTable,
    /// Hook count the module claims to export; must equal the table's
    /// actual length.
    pub declared_len: usize,
    /// Machine-readable signature of every hook's parameters.
    pub parameter_signature: String,
    /// Interface description consumed by the policy compiler.
    pub spec_table: Vec<String>,
    /// Human-readable ABI tag for diagnostics.
    pub abi_tag: String,
    /// Lifecycle entry point.
    pub events: Arc<dyn ModuleEvents>,
}

impl core::fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("abi_major", &self.abi_major)
            .field("abi_minor", &self.abi_minor)
            .field("build_identity", &self.build_identity)
            .field("name", &self.name)
            .field("declared_len", &self.declared_len)
            .field("abi_tag", &self.abi_tag)
            .finish_non_exhaustive()
    }
}
