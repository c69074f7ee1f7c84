//! Lifecycle events.
//!
//! The configuration-driven timeline of the runtime is expressed as four
//! events, delivered to the compiled policy program, to its extension
//! modules, and to directors — always in the order of the owning program
//! instance's own lifecycle.

use core::fmt;

/// One step in a program instance's lifecycle.
///
/// For any given instance the observed sequence is always
/// `Load, Warm, (Cold, Warm)*, Cold, Discard`: `Load` first and exactly
/// once, `Discard` last and exactly once, `Warm`/`Cold` alternating in
/// between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// The instance becomes addressable and may allocate
    /// module-instance-scoped state.
    Load,
    /// The instance becomes eligible to serve traffic.
    Warm,
    /// The instance stops serving traffic and must release transient
    /// resources; retained state survives a later `Warm`.
    Cold,
    /// Permanent teardown; nothing is delivered afterwards.
    Discard,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleEvent::Load => "load",
            LifecycleEvent::Warm => "warm",
            LifecycleEvent::Cold => "cold",
            LifecycleEvent::Discard => "discard",
        };
        f.write_str(s)
    }
}
