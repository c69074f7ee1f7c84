//! Coverage instrumentation for compiled policy programs.
//!
//! The policy compiler emits a table of source coordinates, one per counted
//! location; [`ExecCtx::count`](crate::ctx::ExecCtx::count) bumps the
//! matching counter at run time. Counters only ever feed operator tooling,
//! never behavior.

use std::sync::atomic::{AtomicU64, Ordering};

/// Coordinates of one counted location in the policy-program source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRef {
    /// Index of the source file.
    pub source: u32,
    /// Byte offset into the source file.
    pub offset: u32,
    /// Line number (1-based).
    pub line: u32,
    /// Column position (1-based).
    pub pos: u32,
    /// The token at this location.
    pub token: &'static str,
}

/// Execution counters parallel to a compiled program's source-ref table.
///
/// Counters are relaxed atomics: hooks on many worker threads bump them
/// concurrently and readers only need eventually consistent totals.
pub struct CoverageTable {
    refs: Vec<SourceRef>,
    counters: Box<[AtomicU64]>,
}

impl CoverageTable {
    /// Creates a table with one zeroed counter per source ref.
    #[must_use]
    pub fn new(refs: Vec<SourceRef>) -> Self {
        let counters = (0..refs.len()).map(|_| AtomicU64::new(0)).collect();
        Self { refs, counters }
    }

    /// Bumps the counter for location `idx`.
    ///
    /// Out-of-range indices indicate a compiler/runtime table mismatch and
    /// are ignored outside debug builds.
    pub fn hit(&self, idx: usize) {
        debug_assert!(idx < self.counters.len(), "coverage index out of range");
        if let Some(c) = self.counters.get(idx) {
            c.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns the count for location `idx` (0 for out-of-range).
    #[must_use]
    pub fn hits(&self, idx: usize) -> u64 {
        self.counters
            .get(idx)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Returns the source coordinates for location `idx`.
    #[must_use]
    pub fn source_ref(&self, idx: usize) -> Option<&SourceRef> {
        self.refs.get(idx)
    }

    /// Returns the number of counted locations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// Returns true if the table counts nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs() -> Vec<SourceRef> {
        vec![
            SourceRef {
                source: 0,
                offset: 0,
                line: 1,
                pos: 1,
                token: "sub",
            },
            SourceRef {
                source: 0,
                offset: 24,
                line: 3,
                pos: 9,
                token: "return",
            },
        ]
    }

    #[test]
    fn hits_accumulate_per_location() {
        let table = CoverageTable::new(refs());

        table.hit(0);
        table.hit(1);
        table.hit(1);

        assert_eq!(table.hits(0), 1);
        assert_eq!(table.hits(1), 2);
        assert_eq!(table.source_ref(1).unwrap().token, "return");
    }

    #[test]
    fn out_of_range_reads_zero() {
        let table = CoverageTable::new(refs());
        assert_eq!(table.hits(99), 0);
        assert!(table.source_ref(99).is_none());
    }

    #[test]
    fn concurrent_hits_are_not_lost() {
        use std::sync::Arc;

        let table = Arc::new(CoverageTable::new(refs()));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let t = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    t.hit(0);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(table.hits(0), 4000);
    }
}
