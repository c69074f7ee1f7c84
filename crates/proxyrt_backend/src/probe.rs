//! Health probing.
//!
//! A probed director owns a [`HealthMonitor`]: a sliding window over the
//! last `window` probe outcomes from which the healthy/sick verdict is
//! *derived* — policy code can observe health but never set it. Probes run
//! on their own timer ([`ProbeTask`]), asynchronously from request threads;
//! each completion publishes a fresh verdict through an atomic that
//! [`is_healthy`](HealthMonitor::is_healthy) loads lock-free.
//!
//! A probe that times out or errors is just a failing sample. It is never
//! surfaced to request threads as an error.

use core::fmt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// ProbeConfig
// ─────────────────────────────────────────────────────────────────────────────

/// The sliding window cannot exceed one verdict bitmap.
pub const MAX_WINDOW: u32 = 64;

/// Invalid probe configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProbeConfigError {
    /// The window must hold at least one sample.
    #[error("probe window must be at least 1")]
    ZeroWindow,

    /// The window exceeds [`MAX_WINDOW`] samples.
    #[error("probe window {0} exceeds maximum of {MAX_WINDOW}")]
    WindowTooLarge(u32),

    /// More passing samples required than the window can hold.
    #[error("probe threshold {threshold} exceeds window {window}")]
    ThresholdExceedsWindow {
        /// Configured threshold.
        threshold: u32,
        /// Configured window.
        window: u32,
    },
}

/// Configuration of one director's health probe.
///
/// Supplied by the policy program's configuration; frozen at backend
/// creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// URL to probe.
    pub url: String,
    /// Raw request template overriding `url`, if set.
    #[serde(default)]
    pub request_template: Option<String>,
    /// Per-probe timeout; expiry records a failing sample.
    pub timeout: Duration,
    /// Interval between probe starts.
    pub interval: Duration,
    /// Status code a passing probe must return.
    pub expected_status: u16,
    /// Number of most recent samples the verdict derives from.
    pub window: u32,
    /// Passing samples within the window required to be healthy.
    pub threshold: u32,
    /// Assumed-good samples seeded before real outcomes exist.
    pub initial: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            url: "/".to_string(),
            request_template: None,
            timeout: Duration::from_secs(2),
            interval: Duration::from_secs(5),
            expected_status: 200,
            window: 8,
            threshold: 3,
            initial: 2,
        }
    }
}

impl ProbeConfig {
    /// Validates the window geometry, clamping `initial` to the window.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeConfigError`] for an empty or oversized window, or a
    /// threshold the window cannot hold.
    pub fn validated(mut self) -> Result<Self, ProbeConfigError> {
        if self.window == 0 {
            return Err(ProbeConfigError::ZeroWindow);
        }
        if self.window > MAX_WINDOW {
            return Err(ProbeConfigError::WindowTooLarge(self.window));
        }
        if self.threshold > self.window {
            return Err(ProbeConfigError::ThresholdExceedsWindow {
                threshold: self.threshold,
                window: self.window,
            });
        }
        self.initial = self.initial.min(self.window);
        Ok(self)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HealthMonitor
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of one completed probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The probe returned the expected status within the timeout.
    Pass,
    /// The probe errored, timed out, or returned an unexpected status.
    Fail,
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProbeOutcome::Pass => "pass",
            ProbeOutcome::Fail => "fail",
        })
    }
}

/// Sliding-window state, touched only by the probe writer.
struct Window {
    /// Outcome bitmap, LSB = most recent sample. Seeded with `initial`
    /// passing bits.
    bits: u64,
    /// Samples present in the bitmap (seeds included), capped at `window`.
    samples: u32,
}

/// Derives a director's health verdict from probe outcomes.
///
/// The verdict is healthy iff the passing samples in the last `window`
/// outcomes reach `threshold`; window positions not yet filled by a real
/// sample count as passing, and `initial` pre-seeds that many passing
/// samples so a freshly created backend starts healthy but loses the
/// benefit of the assumption after `window - initial` real probes.
pub struct HealthMonitor {
    name: String,
    window: u32,
    threshold: u32,
    state: Mutex<Window>,
    healthy: AtomicBool,
}

impl HealthMonitor {
    /// Creates a monitor for `name` from a validated config.
    #[must_use]
    pub fn new(name: impl Into<String>, cfg: &ProbeConfig) -> Self {
        let seeds = cfg.initial.min(cfg.window);
        let bits = if seeds == 0 { 0 } else { u64::MAX >> (64 - seeds) };
        let monitor = Self {
            name: name.into(),
            window: cfg.window,
            threshold: cfg.threshold,
            state: Mutex::new(Window {
                bits,
                samples: seeds,
            }),
            healthy: AtomicBool::new(false),
        };
        let initial_verdict = {
            let state = monitor.state.lock();
            monitor.derive(&state)
        };
        monitor.healthy.store(initial_verdict, Ordering::Release);
        monitor
    }

    /// Returns the last published verdict. Lock-free; called from request
    /// threads.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Records a probe completion and publishes the new verdict.
    ///
    /// Called from the probe task only. Returns the published verdict.
    pub fn record(&self, outcome: ProbeOutcome) -> bool {
        let verdict = {
            let mut state = self.state.lock();
            let mask = if self.window == 64 {
                u64::MAX
            } else {
                (1u64 << self.window) - 1
            };
            state.bits = ((state.bits << 1) | u64::from(outcome == ProbeOutcome::Pass)) & mask;
            state.samples = (state.samples + 1).min(self.window);
            self.derive(&state)
        };
        let prev = self.healthy.swap(verdict, Ordering::AcqRel);
        if prev != verdict {
            tracing::info!(
                backend = %self.name,
                verdict = if verdict { "healthy" } else { "sick" },
                "health verdict changed"
            );
        }
        verdict
    }

    /// Returns the number of samples recorded so far (seeds included,
    /// capped at the window size).
    #[must_use]
    pub fn samples(&self) -> u32 {
        self.state.lock().samples
    }

    fn derive(&self, state: &Window) -> bool {
        let assumed = self.window - state.samples;
        state.bits.count_ones() + assumed >= self.threshold
    }
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("name", &self.name)
            .field("window", &self.window)
            .field("threshold", &self.threshold)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ProbeTask
// ─────────────────────────────────────────────────────────────────────────────

/// Performs one probe against a backend.
///
/// The actual HTTP exchange (and its timeout enforcement) lives outside
/// this crate; implementations report a plain outcome.
pub trait Prober: Send + Sync {
    /// Runs one probe per `cfg` and reports how it went.
    fn probe(&self, cfg: &ProbeConfig) -> ProbeOutcome;
}

impl<F> Prober for F
where
    F: Fn(&ProbeConfig) -> ProbeOutcome + Send + Sync,
{
    fn probe(&self, cfg: &ProbeConfig) -> ProbeOutcome {
        self(cfg)
    }
}

/// Interval timer thread driving a [`Prober`] into a [`HealthMonitor`].
///
/// Started when the owning director warms, stopped when it cools or is
/// discarded. Stopping is idempotent and joins the thread.
pub struct ProbeTask {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProbeTask {
    /// Granularity of the stop-flag poll while sleeping out an interval.
    const TICK: Duration = Duration::from_millis(20);

    /// Spawns the probe timer for `monitor`.
    ///
    /// The first probe fires immediately; subsequent probes fire every
    /// `cfg.interval`.
    #[must_use]
    pub fn spawn(cfg: ProbeConfig, monitor: Arc<HealthMonitor>, prober: Arc<dyn Prober>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            while !stop_flag.load(Ordering::Acquire) {
                let outcome = prober.probe(&cfg);
                monitor.record(outcome);
                let mut slept = Duration::ZERO;
                while slept < cfg.interval && !stop_flag.load(Ordering::Acquire) {
                    let nap = Self::TICK.min(cfg.interval - slept);
                    std::thread::sleep(nap);
                    slept += nap;
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stops the timer and joins the thread. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProbeTask {
    fn drop(&mut self) {
        self.stop();
    }
}
