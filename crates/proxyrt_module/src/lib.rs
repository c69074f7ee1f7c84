//! Versioned extension-module loading for compiled proxy policy programs.
//!
//! `proxyrt_module` activates the extension modules a policy program
//! imports:
//!
//! - [`descriptor`] - The record a module exports to the loader
//! - [`loader`] - ABI and identity validation, activation
//! - [`lifecycle`] - Per-instance event ordering and teardown
//!
//! # Architecture
//!
//! The policy compiler records each imported module's build identity; at
//! activation time the [`loader::Loader`] checks the module's exported
//! [`descriptor::ModuleDescriptor`] against the runtime ABI and that
//! recorded identity, and only then constructs a
//! [`lifecycle::ModuleHandle`] and delivers `Load` through it. From there
//! the handle relays the owning program instance's `Warm`/`Cold`/`Discard`
//! events in order, and finalizes the instance's private-state scope at
//! discard.

/// The record a module exports to the loader.
pub mod descriptor;

/// Per-instance event ordering and teardown.
pub mod lifecycle;

/// ABI and identity validation, activation.
pub mod loader;

/// Re-export all common types for easy access.
pub mod prelude {
    pub use crate::descriptor::{
        FuncSlot, FunctionTable, HookFn, ModuleDescriptor, ModuleEvents, ModuleFailure, NoEvents,
    };
    pub use crate::lifecycle::{EventError, ModuleHandle};
    pub use crate::loader::{LoadError, Loader};
}
