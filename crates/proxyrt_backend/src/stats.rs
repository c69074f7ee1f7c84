//! Shared statistics segments.
//!
//! Clustered backends publish their counters into named segments carved
//! out of a shared region sized up front. The region owner implements
//! [`SegmentAllocator`]; [`StatsCluster`] is the in-memory reference
//! implementation used by tests and single-process deployments.
//!
//! Segments can be hidden without being destroyed: a cooling backend hides
//! its segment so consumers stop reading it, and reveals it again on the
//! next warm-up with its counters intact.

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

// ─────────────────────────────────────────────────────────────────────────────
// SegmentAllocator
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to one allocated statistics segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentId(u64);

/// Statistics segment allocation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatsError {
    /// The cluster cannot hold the requested segment.
    #[error("stats cluster full: {needed} bytes requested, {remaining} remaining")]
    ClusterFull {
        /// Bytes the allocation needed, overhead included.
        needed: usize,
        /// Bytes left in the cluster.
        remaining: usize,
    },

    /// The segment id does not name a live segment.
    #[error("unknown stats segment")]
    UnknownSegment,

    /// A live segment with this name already exists.
    #[error("stats segment {0:?} already exists")]
    DuplicateSegment(String),
}

/// Allocator of named statistics segments inside a shared region.
///
/// Consumed by clustered backends; the region itself (shared memory, a
/// file, plain heap) is the implementor's concern.
pub trait SegmentAllocator: Send + Sync {
    /// Allocates a segment of `size` payload bytes under `name`.
    ///
    /// # Errors
    ///
    /// [`StatsError::ClusterFull`] when the region cannot hold the segment
    /// plus its [`overhead`](Self::overhead);
    /// [`StatsError::DuplicateSegment`] when `name` is already live.
    fn alloc(&self, name: &str, size: usize) -> Result<SegmentId, StatsError>;

    /// Releases the segment and its space.
    ///
    /// # Errors
    ///
    /// [`StatsError::UnknownSegment`] for an id that is not live.
    fn destroy(&self, id: SegmentId) -> Result<(), StatsError>;

    /// Makes the segment invisible to consumers without releasing it.
    ///
    /// # Errors
    ///
    /// [`StatsError::UnknownSegment`] for an id that is not live.
    fn hide(&self, id: SegmentId) -> Result<(), StatsError>;

    /// Reverses [`hide`](Self::hide).
    ///
    /// # Errors
    ///
    /// [`StatsError::UnknownSegment`] for an id that is not live.
    fn reveal(&self, id: SegmentId) -> Result<(), StatsError>;

    /// Returns the total bytes a segment of `size` payload bytes occupies.
    ///
    /// Callers sum this over their planned segments to size the region
    /// before creating any of them.
    fn overhead(&self, size: usize) -> usize;
}

// ─────────────────────────────────────────────────────────────────────────────
// StatsCluster
// ─────────────────────────────────────────────────────────────────────────────

/// Per-segment bookkeeping bytes charged on top of the payload.
const SEGMENT_HEADER: usize = 64;

struct Segment {
    name: String,
    charged: usize,
    visible: bool,
}

struct ClusterState {
    segments: HashMap<SegmentId, Segment>,
    used: usize,
}

/// In-memory [`SegmentAllocator`] with a fixed byte capacity.
pub struct StatsCluster {
    capacity: usize,
    next_id: AtomicU64,
    state: Mutex<ClusterState>,
}

impl StatsCluster {
    /// Creates a cluster holding at most `capacity` bytes of segments,
    /// bookkeeping included.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_id: AtomicU64::new(1),
            state: Mutex::new(ClusterState {
                segments: HashMap::new(),
                used: 0,
            }),
        }
    }

    /// Returns the bytes currently allocated, bookkeeping included.
    #[must_use]
    pub fn used(&self) -> usize {
        self.state.lock().used
    }

    /// Returns whether the segment is currently visible to consumers.
    ///
    /// # Errors
    ///
    /// [`StatsError::UnknownSegment`] for an id that is not live.
    pub fn is_visible(&self, id: SegmentId) -> Result<bool, StatsError> {
        let state = self.state.lock();
        state
            .segments
            .get(&id)
            .map(|s| s.visible)
            .ok_or(StatsError::UnknownSegment)
    }
}

impl SegmentAllocator for StatsCluster {
    fn alloc(&self, name: &str, size: usize) -> Result<SegmentId, StatsError> {
        let charged = self.overhead(size);
        let mut state = self.state.lock();
        if state.segments.values().any(|s| s.name == name) {
            return Err(StatsError::DuplicateSegment(name.to_string()));
        }
        let remaining = self.capacity - state.used;
        if charged > remaining {
            return Err(StatsError::ClusterFull {
                needed: charged,
                remaining,
            });
        }
        let id = SegmentId(self.next_id.fetch_add(1, Ordering::Relaxed));
        state.segments.insert(
            id,
            Segment {
                name: name.to_string(),
                charged,
                visible: true,
            },
        );
        state.used += charged;
        tracing::debug!(segment = name, bytes = charged, "stats segment allocated");
        Ok(id)
    }

    fn destroy(&self, id: SegmentId) -> Result<(), StatsError> {
        let mut state = self.state.lock();
        let segment = state
            .segments
            .remove(&id)
            .ok_or(StatsError::UnknownSegment)?;
        state.used -= segment.charged;
        tracing::debug!(segment = %segment.name, "stats segment destroyed");
        Ok(())
    }

    fn hide(&self, id: SegmentId) -> Result<(), StatsError> {
        let mut state = self.state.lock();
        let segment = state
            .segments
            .get_mut(&id)
            .ok_or(StatsError::UnknownSegment)?;
        segment.visible = false;
        Ok(())
    }

    fn reveal(&self, id: SegmentId) -> Result<(), StatsError> {
        let mut state = self.state.lock();
        let segment = state
            .segments
            .get_mut(&id)
            .ok_or(StatsError::UnknownSegment)?;
        segment.visible = true;
        Ok(())
    }

    fn overhead(&self, size: usize) -> usize {
        size + SEGMENT_HEADER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_charges_overhead_and_destroy_releases() {
        let cluster = StatsCluster::new(1024);
        let id = cluster.alloc("b1", 100).unwrap();
        assert_eq!(cluster.used(), cluster.overhead(100));

        cluster.destroy(id).unwrap();
        assert_eq!(cluster.used(), 0);
        assert_eq!(cluster.destroy(id), Err(StatsError::UnknownSegment));
    }

    #[test]
    fn over_capacity_alloc_is_rejected() {
        let cluster = StatsCluster::new(200);
        let id = cluster.alloc("b1", 100).unwrap();

        let err = cluster.alloc("b2", 100).unwrap_err();
        assert!(matches!(err, StatsError::ClusterFull { .. }));

        // Freeing makes room again.
        cluster.destroy(id).unwrap();
        cluster.alloc("b2", 100).unwrap();
    }

    #[test]
    fn duplicate_names_are_rejected_until_destroyed() {
        let cluster = StatsCluster::new(4096);
        let id = cluster.alloc("b1", 16).unwrap();
        assert_eq!(
            cluster.alloc("b1", 16),
            Err(StatsError::DuplicateSegment("b1".to_string()))
        );

        cluster.destroy(id).unwrap();
        cluster.alloc("b1", 16).unwrap();
    }

    #[test]
    fn hide_and_reveal_toggle_visibility() {
        let cluster = StatsCluster::new(4096);
        let id = cluster.alloc("b1", 16).unwrap();
        assert!(cluster.is_visible(id).unwrap());

        cluster.hide(id).unwrap();
        assert!(!cluster.is_visible(id).unwrap());

        cluster.reveal(id).unwrap();
        assert!(cluster.is_visible(id).unwrap());

        cluster.destroy(id).unwrap();
        assert_eq!(cluster.hide(id), Err(StatsError::UnknownSegment));
    }

    #[test]
    fn sizing_query_predicts_capacity() {
        let cluster = StatsCluster::new(2 * (16 + SEGMENT_HEADER));
        assert_eq!(cluster.overhead(16), 16 + SEGMENT_HEADER);

        cluster.alloc("b1", 16).unwrap();
        cluster.alloc("b2", 16).unwrap();
        assert!(matches!(
            cluster.alloc("b3", 16),
            Err(StatsError::ClusterFull { .. })
        ));
    }
}
