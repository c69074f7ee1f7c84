//! Backend descriptors and the simple director.
//!
//! A [`BackendDescriptor`] is the frozen record a policy program compiles a
//! backend declaration into: addressing, timeouts and an optional probe
//! config, all fixed at build time. [`Backend`] wraps one descriptor as a
//! [`Director`] — the leaf every composite director eventually resolves
//! through.
//!
//! # Example
//!
//! ```
//! use proxyrt_backend::backend::{Backend, BackendBuilder};
//! use std::time::Duration;
//!
//! let desc = BackendBuilder::new("origin")
//!     .ipv4("192.0.2.10")
//!     .port("8080")
//!     .connect_timeout(Duration::from_secs(1))
//!     .build()
//!     .unwrap();
//! let backend = Backend::new(desc);
//! ```

use crate::director::{ConnTarget, Director};
use crate::probe::{HealthMonitor, ProbeConfig, ProbeConfigError, ProbeTask, Prober};
use crate::stats::{SegmentAllocator, SegmentId, StatsError};
use core::fmt;
use parking_lot::Mutex;
use proxyrt_core::ctx::ExecCtx;
use proxyrt_core::event::LifecycleEvent;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// BackendDescriptor
// ─────────────────────────────────────────────────────────────────────────────

/// Invalid backend declaration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The backend has no name.
    #[error("backend name must not be empty")]
    EmptyName,

    /// Neither an IPv4 nor an IPv6 address was given.
    #[error("backend {0:?} declares no address")]
    NoAddress(String),

    /// An address literal did not parse.
    #[error("backend {name:?}: invalid address literal {literal:?}")]
    BadAddress {
        /// Backend name.
        name: String,
        /// The offending literal.
        literal: String,
    },

    /// The port field did not parse as a port number.
    #[error("backend {name:?}: invalid port {port:?}")]
    BadPort {
        /// Backend name.
        name: String,
        /// The offending port field.
        port: String,
    },

    /// The attached probe config is invalid.
    #[error("backend {name:?}: {source}")]
    Probe {
        /// Backend name.
        name: String,
        /// Underlying probe config error.
        source: ProbeConfigError,
    },

    /// Statistics segment registration failed.
    #[error("backend {name:?}: {source}")]
    Stats {
        /// Backend name.
        name: String,
        /// Underlying allocator error.
        source: StatsError,
    },
}

/// The frozen record a backend declaration compiles into.
///
/// Carries both the raw literals from the declaration and the addresses
/// resolved from them, so diagnostics can echo what was written while the
/// connection path uses ready-made socket addresses. Values never change
/// after [`BackendBuilder::build`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Symbolic backend name.
    pub name: String,
    /// IPv4 address literal as written, if any.
    pub ipv4_literal: Option<String>,
    /// IPv6 address literal as written, if any.
    pub ipv6_literal: Option<String>,
    /// Port field as written.
    pub port: String,
    /// Host header to send.
    pub host_header: Option<String>,
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    /// Timeout for the first response byte.
    pub first_byte_timeout: Duration,
    /// Timeout between response bytes.
    pub between_bytes_timeout: Duration,
    /// Connection cap, `0` meaning unlimited. Enforced by the connection
    /// pool, not here.
    pub max_connections: u32,
    /// Whether to send a PROXY protocol preamble.
    pub proxy_header: bool,
    /// Socket address resolved from `ipv4_literal` and `port`.
    pub resolved_ipv4: Option<SocketAddr>,
    /// Socket address resolved from `ipv6_literal` and `port`.
    pub resolved_ipv6: Option<SocketAddr>,
    /// Health probe, if the declaration attached one.
    pub probe: Option<ProbeConfig>,
}

/// Builder validating and freezing a [`BackendDescriptor`].
#[derive(Debug, Clone, Default)]
pub struct BackendBuilder {
    name: String,
    ipv4_literal: Option<String>,
    ipv6_literal: Option<String>,
    port: String,
    host_header: Option<String>,
    connect_timeout: Option<Duration>,
    first_byte_timeout: Option<Duration>,
    between_bytes_timeout: Option<Duration>,
    max_connections: u32,
    proxy_header: bool,
    probe: Option<ProbeConfig>,
}

impl BackendBuilder {
    /// Default timeouts applied when the declaration leaves them unset.
    const DEFAULT_CONNECT: Duration = Duration::from_millis(3500);
    const DEFAULT_FIRST_BYTE: Duration = Duration::from_secs(60);
    const DEFAULT_BETWEEN_BYTES: Duration = Duration::from_secs(60);

    /// Starts a descriptor for the backend called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port: "80".to_string(),
            ..Self::default()
        }
    }

    /// Sets the IPv4 address literal.
    #[must_use]
    pub fn ipv4(mut self, literal: impl Into<String>) -> Self {
        self.ipv4_literal = Some(literal.into());
        self
    }

    /// Sets the IPv6 address literal.
    #[must_use]
    pub fn ipv6(mut self, literal: impl Into<String>) -> Self {
        self.ipv6_literal = Some(literal.into());
        self
    }

    /// Sets the port field.
    #[must_use]
    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.port = port.into();
        self
    }

    /// Sets the host header.
    #[must_use]
    pub fn host_header(mut self, host: impl Into<String>) -> Self {
        self.host_header = Some(host.into());
        self
    }

    /// Sets the connection establishment timeout.
    #[must_use]
    pub fn connect_timeout(mut self, t: Duration) -> Self {
        self.connect_timeout = Some(t);
        self
    }

    /// Sets the first-byte timeout.
    #[must_use]
    pub fn first_byte_timeout(mut self, t: Duration) -> Self {
        self.first_byte_timeout = Some(t);
        self
    }

    /// Sets the between-bytes timeout.
    #[must_use]
    pub fn between_bytes_timeout(mut self, t: Duration) -> Self {
        self.between_bytes_timeout = Some(t);
        self
    }

    /// Caps concurrent connections; `0` means unlimited.
    #[must_use]
    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    /// Enables the PROXY protocol preamble.
    #[must_use]
    pub fn proxy_header(mut self, on: bool) -> Self {
        self.proxy_header = on;
        self
    }

    /// Attaches a health probe.
    #[must_use]
    pub fn probe(mut self, probe: ProbeConfig) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Validates the declaration and freezes the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] for an empty name, a missing or malformed
    /// address, an unparseable port, or an invalid probe config.
    pub fn build(self) -> Result<BackendDescriptor, BackendError> {
        if self.name.is_empty() {
            return Err(BackendError::EmptyName);
        }
        if self.ipv4_literal.is_none() && self.ipv6_literal.is_none() {
            return Err(BackendError::NoAddress(self.name));
        }
        let port: u16 = self.port.parse().map_err(|_| BackendError::BadPort {
            name: self.name.clone(),
            port: self.port.clone(),
        })?;

        let resolved_ipv4 = self
            .ipv4_literal
            .as_deref()
            .map(|lit| Self::resolve(&self.name, lit, port, false))
            .transpose()?;
        let resolved_ipv6 = self
            .ipv6_literal
            .as_deref()
            .map(|lit| Self::resolve(&self.name, lit, port, true))
            .transpose()?;

        let probe = self
            .probe
            .map(|p| {
                p.validated().map_err(|source| BackendError::Probe {
                    name: self.name.clone(),
                    source,
                })
            })
            .transpose()?;

        Ok(BackendDescriptor {
            name: self.name,
            ipv4_literal: self.ipv4_literal,
            ipv6_literal: self.ipv6_literal,
            port: self.port,
            host_header: self.host_header,
            connect_timeout: self.connect_timeout.unwrap_or(Self::DEFAULT_CONNECT),
            first_byte_timeout: self.first_byte_timeout.unwrap_or(Self::DEFAULT_FIRST_BYTE),
            between_bytes_timeout: self
                .between_bytes_timeout
                .unwrap_or(Self::DEFAULT_BETWEEN_BYTES),
            max_connections: self.max_connections,
            proxy_header: self.proxy_header,
            resolved_ipv4,
            resolved_ipv6,
            probe,
        })
    }

    fn resolve(name: &str, literal: &str, port: u16, v6: bool) -> Result<SocketAddr, BackendError> {
        let bad = || BackendError::BadAddress {
            name: name.to_string(),
            literal: literal.to_string(),
        };
        let ip: IpAddr = literal.parse().map_err(|_| bad())?;
        if ip.is_ipv6() != v6 {
            return Err(bad());
        }
        Ok(SocketAddr::new(ip, port))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend
// ─────────────────────────────────────────────────────────────────────────────

/// Payload bytes of one backend's statistics segment.
const STATS_SEGMENT_SIZE: usize = 256;

struct Probing {
    config: ProbeConfig,
    monitor: Arc<HealthMonitor>,
    prober: Arc<dyn Prober>,
    task: Mutex<Option<ProbeTask>>,
}

struct Clustering {
    allocator: Arc<dyn SegmentAllocator>,
    segment: Mutex<Option<SegmentId>>,
}

/// Simple director over one [`BackendDescriptor`].
pub struct Backend {
    descriptor: BackendDescriptor,
    probing: Option<Probing>,
    clustering: Option<Clustering>,
}

impl Backend {
    /// Creates a standalone backend, no statistics segment.
    ///
    /// A descriptor with a probe config starts probing on `Warm`; until the
    /// first probes land the verdict follows the probe's `initial` seeding.
    #[must_use]
    pub fn new(descriptor: BackendDescriptor) -> Self {
        let probing = descriptor.probe.clone().map(|config| Probing {
            monitor: Arc::new(HealthMonitor::new(descriptor.name.clone(), &config)),
            prober: Arc::new(|_: &ProbeConfig| crate::probe::ProbeOutcome::Fail),
            config,
            task: Mutex::new(None),
        });
        Self {
            descriptor,
            probing,
            clustering: None,
        }
    }

    /// Creates a backend whose counters live in `allocator`.
    ///
    /// The segment is allocated immediately under the backend's name and
    /// starts hidden; `Warm` reveals it, `Cold` hides it again, `Discard`
    /// destroys it.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Stats`] when the cluster cannot hold the
    /// segment or already holds one by this name.
    pub fn new_clustered(
        allocator: Arc<dyn SegmentAllocator>,
        descriptor: BackendDescriptor,
    ) -> Result<Self, BackendError> {
        let segment = allocator
            .alloc(&descriptor.name, STATS_SEGMENT_SIZE)
            .and_then(|id| {
                allocator.hide(id)?;
                Ok(id)
            })
            .map_err(|source| BackendError::Stats {
                name: descriptor.name.clone(),
                source,
            })?;
        let mut backend = Self::new(descriptor);
        backend.clustering = Some(Clustering {
            allocator,
            segment: Mutex::new(Some(segment)),
        });
        Ok(backend)
    }

    /// Returns the bytes one backend's segment will consume in `allocator`.
    ///
    /// Callers sum this over their planned backends to size the cluster
    /// before creating any of them.
    #[must_use]
    pub fn stats_need(allocator: &dyn SegmentAllocator) -> usize {
        allocator.overhead(STATS_SEGMENT_SIZE)
    }

    /// Replaces the probe executor; ignored for unprobed descriptors.
    #[must_use]
    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        if let Some(probing) = &mut self.probing {
            probing.prober = prober;
        }
        self
    }

    /// Returns the frozen descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    /// Returns the live statistics segment id, if clustered.
    #[cfg(any(test, feature = "test-utils"))]
    #[must_use]
    pub fn stats_segment(&self) -> Option<SegmentId> {
        self.clustering.as_ref().and_then(|c| *c.segment.lock())
    }

    fn stop_probe(&self) {
        if let Some(probing) = &self.probing {
            if let Some(mut task) = probing.task.lock().take() {
                task.stop();
            }
        }
    }

    fn with_segment(&self, f: impl FnOnce(&dyn SegmentAllocator, SegmentId)) {
        if let Some(clustering) = &self.clustering {
            if let Some(id) = *clustering.segment.lock() {
                f(clustering.allocator.as_ref(), id);
            }
        }
    }
}

impl Director for Backend {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn resolve(&self, ctx: &ExecCtx<'_>) -> Option<ConnTarget> {
        if !self.healthy(ctx) {
            return None;
        }
        let addr = self.descriptor.resolved_ipv4.or(self.descriptor.resolved_ipv6)?;
        Some(ConnTarget {
            addr,
            host_header: self.descriptor.host_header.clone(),
            connect_timeout: self.descriptor.connect_timeout,
            first_byte_timeout: self.descriptor.first_byte_timeout,
            between_bytes_timeout: self.descriptor.between_bytes_timeout,
            proxy_header: self.descriptor.proxy_header,
        })
    }

    fn healthy(&self, _ctx: &ExecCtx<'_>) -> bool {
        self.probing
            .as_ref()
            .is_none_or(|p| p.monitor.is_healthy())
    }

    fn event(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Load => {}
            LifecycleEvent::Warm => {
                if let Some(probing) = &self.probing {
                    let mut task = probing.task.lock();
                    if task.is_none() {
                        *task = Some(ProbeTask::spawn(
                            probing.config.clone(),
                            Arc::clone(&probing.monitor),
                            Arc::clone(&probing.prober),
                        ));
                    }
                }
                self.with_segment(|alloc, id| {
                    if let Err(err) = alloc.reveal(id) {
                        tracing::warn!(backend = %self.descriptor.name, %err, "stats reveal failed");
                    }
                });
            }
            LifecycleEvent::Cold => {
                self.stop_probe();
                self.with_segment(|alloc, id| {
                    if let Err(err) = alloc.hide(id) {
                        tracing::warn!(backend = %self.descriptor.name, %err, "stats hide failed");
                    }
                });
            }
            LifecycleEvent::Discard => {
                self.stop_probe();
                if let Some(clustering) = &self.clustering {
                    if let Some(id) = clustering.segment.lock().take() {
                        if let Err(err) = clustering.allocator.destroy(id) {
                            tracing::warn!(
                                backend = %self.descriptor.name,
                                %err,
                                "stats destroy failed"
                            );
                        }
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.descriptor.name)
            .field("probed", &self.probing.is_some())
            .field("clustered", &self.clustering.is_some())
            .finish()
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        // Equivalent to a missed Discard; safe to repeat after one.
        self.event(LifecycleEvent::Discard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeOutcome;
    use crate::stats::StatsCluster;
    use proxyrt_core::collab::{BudgetWorkspace, MemoryLog};
    use proxyrt_core::ctx::Phase;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn desc(name: &str) -> BackendDescriptor {
        BackendBuilder::new(name)
            .ipv4("192.0.2.1")
            .ipv6("2001:db8::1")
            .port("8080")
            .host_header("origin.example")
            .build()
            .unwrap()
    }

    #[test]
    fn builder_validates_declaration() {
        assert_eq!(
            BackendBuilder::new("").ipv4("192.0.2.1").build(),
            Err(BackendError::EmptyName)
        );
        assert_eq!(
            BackendBuilder::new("b").build(),
            Err(BackendError::NoAddress("b".to_string()))
        );
        assert!(matches!(
            BackendBuilder::new("b").ipv4("not-an-ip").build(),
            Err(BackendError::BadAddress { .. })
        ));
        assert!(matches!(
            // v6 literal in the v4 slot
            BackendBuilder::new("b").ipv4("2001:db8::1").build(),
            Err(BackendError::BadAddress { .. })
        ));
        assert!(matches!(
            BackendBuilder::new("b").ipv4("192.0.2.1").port("http").build(),
            Err(BackendError::BadPort { .. })
        ));
    }

    #[test]
    fn builder_resolves_both_families() {
        let d = desc("b1");
        assert_eq!(d.resolved_ipv4.unwrap().to_string(), "192.0.2.1:8080");
        assert_eq!(d.resolved_ipv6.unwrap().to_string(), "[2001:db8::1]:8080");
    }

    #[test]
    fn descriptor_round_trips_through_json() {
        let d = desc("b1");
        let json = serde_json::to_string(&d).unwrap();
        let back: BackendDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn resolve_prefers_ipv4() {
        let ws = BudgetWorkspace::new(64);
        let log = MemoryLog::new();
        let ctx = ExecCtx::builder(Phase::BackendFetch, &ws, &log).build();

        let b = Backend::new(desc("b1"));
        let target = b.resolve(&ctx).unwrap();
        assert!(target.addr.is_ipv4());
        assert_eq!(target.host_header.as_deref(), Some("origin.example"));

        let v6_only = BackendBuilder::new("b2")
            .ipv6("2001:db8::1")
            .port("80")
            .build()
            .unwrap();
        let b6 = Backend::new(v6_only);
        assert!(b6.resolve(&ctx).unwrap().addr.is_ipv6());
    }

    #[test]
    fn sick_backend_resolves_to_none() {
        let ws = BudgetWorkspace::new(64);
        let log = MemoryLog::new();
        let ctx = ExecCtx::builder(Phase::BackendFetch, &ws, &log).build();

        let probe = ProbeConfig {
            interval: Duration::from_millis(1),
            window: 1,
            threshold: 1,
            initial: 0,
            ..ProbeConfig::default()
        };
        let b = Backend::new(
            BackendBuilder::new("b1").ipv4("192.0.2.1").probe(probe).build().unwrap(),
        )
        .with_prober(Arc::new(|_: &ProbeConfig| ProbeOutcome::Fail));

        // Healthy by assumption until a probe actually fails.
        assert!(b.healthy(&ctx));

        b.event(LifecycleEvent::Warm);
        let deadline = Instant::now() + Duration::from_secs(5);
        while b.healthy(&ctx) {
            assert!(Instant::now() < deadline, "probe never failed");
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(b.resolve(&ctx).is_none());
        b.event(LifecycleEvent::Cold);
    }

    #[test]
    fn unprobed_backend_is_always_healthy() {
        let ws = BudgetWorkspace::new(64);
        let log = MemoryLog::new();
        let ctx = ExecCtx::builder(Phase::Recv, &ws, &log).build();
        assert!(Backend::new(desc("b1")).healthy(&ctx));
    }

    #[test]
    fn warm_starts_probing_and_cold_stops_it() {
        let ws = BudgetWorkspace::new(64);
        let log = MemoryLog::new();
        let ctx = ExecCtx::builder(Phase::BackendFetch, &ws, &log).build();

        let probe = ProbeConfig {
            interval: Duration::from_millis(1),
            window: 2,
            threshold: 1,
            initial: 0,
            ..ProbeConfig::default()
        };
        let probes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&probes);
        let b = Backend::new(
            BackendBuilder::new("b1").ipv4("192.0.2.1").probe(probe).build().unwrap(),
        )
        .with_prober(Arc::new(move |_: &ProbeConfig| {
            counter.fetch_add(1, Ordering::SeqCst);
            ProbeOutcome::Pass
        }));

        // Healthy by assumption; nothing probes before warm-up.
        assert!(b.healthy(&ctx));
        assert_eq!(probes.load(Ordering::SeqCst), 0);

        b.event(LifecycleEvent::Warm);
        let deadline = Instant::now() + Duration::from_secs(5);
        while probes.load(Ordering::SeqCst) < 3 {
            assert!(Instant::now() < deadline, "probe task never ran");
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(b.healthy(&ctx));

        b.event(LifecycleEvent::Cold);
        b.event(LifecycleEvent::Cold); // tolerated
        let settled = probes.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(probes.load(Ordering::SeqCst), settled);
    }

    #[test]
    fn clustered_segment_follows_lifecycle() {
        let cluster = Arc::new(StatsCluster::new(64 * 1024));
        let b = Backend::new_clustered(Arc::clone(&cluster) as _, desc("b1")).unwrap();
        assert_eq!(cluster.used(), Backend::stats_need(cluster.as_ref()));

        let id = b.stats_segment().unwrap();
        assert!(!cluster.is_visible(id).unwrap()); // hidden until warm

        b.event(LifecycleEvent::Warm);
        assert!(cluster.is_visible(id).unwrap());

        b.event(LifecycleEvent::Cold);
        assert!(!cluster.is_visible(id).unwrap());

        b.event(LifecycleEvent::Discard);
        assert_eq!(cluster.used(), 0);

        drop(b); // discard already ran; drop must not double-free
        assert_eq!(cluster.used(), 0);
    }

    #[test]
    fn backend_formats_for_diagnostics() {
        let rendered = format!("{:?}", Backend::new(desc("b1")));
        assert!(rendered.contains("b1"));
        assert!(rendered.contains("clustered: false"));
    }

    #[test]
    fn cluster_rejects_duplicate_backend_names() {
        let cluster = Arc::new(StatsCluster::new(64 * 1024));
        let _b1 = Backend::new_clustered(Arc::clone(&cluster) as _, desc("b1")).unwrap();
        let err = Backend::new_clustered(Arc::clone(&cluster) as _, desc("b1")).unwrap_err();
        assert!(matches!(err, BackendError::Stats { .. }));
    }

    #[test]
    fn drop_releases_cluster_space() {
        let cluster = Arc::new(StatsCluster::new(64 * 1024));
        {
            let _b = Backend::new_clustered(Arc::clone(&cluster) as _, desc("b1")).unwrap();
            assert!(cluster.used() > 0);
        }
        assert_eq!(cluster.used(), 0);
    }
}
