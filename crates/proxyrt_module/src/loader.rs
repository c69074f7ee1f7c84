//! The module loader.
//!
//! Loading validates a module's exported descriptor against the running
//! ABI and against the build identity the policy compiler recorded when it
//! compiled the importing program. Validation is all-or-nothing: a module
//! that fails any check is rejected outright and the previously active
//! configuration is left untouched — the loader never hands out a
//! partially validated handle.
//!
//! The one forgiving path is the identity check: when the descriptor's
//! identity does not match the recorded one, a caller-supplied fallback
//! descriptor (typically read from a backup copy of the module binary) is
//! given a single chance at the full validation sequence.

use crate::descriptor::ModuleDescriptor;
use crate::lifecycle::{EventError, ModuleHandle};
use hashbrown::HashMap;
use parking_lot::Mutex;
use proxyrt_core::ctx::ExecCtx;
use proxyrt_core::event::LifecycleEvent;

// ─────────────────────────────────────────────────────────────────────────────
// LoadError
// ─────────────────────────────────────────────────────────────────────────────

/// Rejected module load.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The module was built against a different ABI major version.
    #[error("module {name:?}: ABI major {module} does not match runtime {runtime}")]
    MajorMismatch {
        /// Module name.
        name: String,
        /// Module's ABI major.
        module: u16,
        /// Runtime's ABI major.
        runtime: u16,
    },

    /// The module was built against an older ABI minor version than the
    /// runtime requires.
    #[error("module {name:?}: ABI minor {module} older than runtime minimum {runtime}")]
    MinorTooOld {
        /// Module name.
        name: String,
        /// Module's ABI minor.
        module: u16,
        /// Runtime's minimum minor.
        runtime: u16,
    },

    /// No identity was recorded for this module name; the importing
    /// program was not compiled against it.
    #[error("module {name:?}: no recorded build identity")]
    UnknownModule {
        /// Module name.
        name: String,
    },

    /// The module binary is not the one the program was compiled against.
    #[error("module {name:?}: build identity {found:?} does not match recorded {recorded:?}")]
    IdentityMismatch {
        /// Module name.
        name: String,
        /// Identity recorded at policy-compile time.
        recorded: String,
        /// Identity the descriptor carries.
        found: String,
        /// Whether a fallback descriptor was also tried and rejected.
        fallback_tried: bool,
    },

    /// The function table's length does not match the declared length.
    #[error("module {name:?}: function table holds {actual} entries, {declared} declared")]
    TableLength {
        /// Module name.
        name: String,
        /// Length the descriptor declares.
        declared: usize,
        /// The table's actual length.
        actual: usize,
    },

    /// The module's own load entry refused activation.
    #[error("module load rejected: {0}")]
    LoadRejected(#[from] EventError),
}

// ─────────────────────────────────────────────────────────────────────────────
// Loader
// ─────────────────────────────────────────────────────────────────────────────

/// Validates module descriptors and activates instances.
///
/// Carries the runtime's ABI version and the build identities the policy
/// compiler recorded per module name.
pub struct Loader {
    abi_major: u16,
    abi_minor: u16,
    identities: Mutex<HashMap<String, String>>,
}

impl Loader {
    /// Creates a loader for a runtime exposing ABI `major.minor`.
    #[must_use]
    pub fn new(abi_major: u16, abi_minor: u16) -> Self {
        Self {
            abi_major,
            abi_minor,
            identities: Mutex::new(HashMap::new()),
        }
    }

    /// Records the build identity the policy compiler saw for `module`.
    ///
    /// Later loads of `module` must present exactly this identity.
    pub fn record_identity(&self, module: impl Into<String>, identity: impl Into<String>) {
        self.identities.lock().insert(module.into(), identity.into());
    }

    /// Validates `descriptor` and activates it as `instance`.
    ///
    /// Checks run in a fixed order — ABI major (exact), ABI minor (at
    /// least the runtime's), build identity, table length — and the first
    /// failure rejects the load. On an identity mismatch only, `fallback`
    /// gets one try through the same full sequence. A successful
    /// validation delivers `Load` through the new handle; if the module
    /// refuses it, the load fails as a whole.
    ///
    /// # Errors
    ///
    /// [`LoadError`] describing the first failed check, or the module's
    /// own `Load` refusal.
    pub fn load(
        &self,
        ctx: &ExecCtx<'_>,
        descriptor: ModuleDescriptor,
        instance: &str,
        origin: &str,
        fallback: Option<ModuleDescriptor>,
    ) -> Result<ModuleHandle, LoadError> {
        let validated = match self.validate(&descriptor, false) {
            Ok(()) => descriptor,
            Err(LoadError::IdentityMismatch { .. }) if fallback.is_some() => {
                let fb = fallback.unwrap_or(descriptor);
                tracing::info!(
                    module = %fb.name,
                    instance,
                    "build identity mismatch, trying fallback descriptor"
                );
                self.validate(&fb, true)?;
                fb
            }
            Err(err) => {
                tracing::warn!(instance, origin, %err, "module load rejected");
                return Err(err);
            }
        };

        let handle = ModuleHandle::new(instance, origin, validated);
        handle.deliver(ctx, LifecycleEvent::Load)?;
        tracing::info!(
            module = %handle.descriptor().name,
            instance,
            origin,
            "module loaded"
        );
        Ok(handle)
    }

    fn validate(&self, d: &ModuleDescriptor, is_fallback: bool) -> Result<(), LoadError> {
        if d.abi_major != self.abi_major {
            return Err(LoadError::MajorMismatch {
                name: d.name.clone(),
                module: d.abi_major,
                runtime: self.abi_major,
            });
        }
        if d.abi_minor < self.abi_minor {
            return Err(LoadError::MinorTooOld {
                name: d.name.clone(),
                module: d.abi_minor,
                runtime: self.abi_minor,
            });
        }
        let identities = self.identities.lock();
        let recorded = identities
            .get(&d.name)
            .ok_or_else(|| LoadError::UnknownModule {
                name: d.name.clone(),
            })?;
        if *recorded != d.build_identity {
            return Err(LoadError::IdentityMismatch {
                name: d.name.clone(),
                recorded: recorded.clone(),
                found: d.build_identity.clone(),
                fallback_tried: is_fallback,
            });
        }
        drop(identities);
        if d.functions.len() != d.declared_len {
            return Err(LoadError::TableLength {
                name: d.name.clone(),
                declared: d.declared_len,
                actual: d.functions.len(),
            });
        }
        Ok(())
    }
}

impl core::fmt::Debug for Loader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Loader")
            .field("abi_major", &self.abi_major)
            .field("abi_minor", &self.abi_minor)
            .field("recorded", &self.identities.lock().len())
            .finish()
    }
}
