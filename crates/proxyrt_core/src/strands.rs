//! Fragment-list string assembly.
//!
//! Policy programs build strings by concatenation, often repeatedly, inside
//! a bounded per-request scratch workspace. Representing an in-progress
//! string as an ordered list of borrowed fragments avoids the quadratic
//! copy pressure of eager concatenation: fragments are only copied once, at
//! [`materialize`](Strands::materialize) time, when a contiguous buffer
//! must be handed to an external boundary.
//!
//! A `None` fragment means *absence* (an unset value flowing through the
//! program); `Some("")` is a present-but-empty string. The two are distinct
//! values with distinct meaning and every transform preserves the
//! distinction.
//!
//! # Example
//!
//! ```
//! use proxyrt_core::strands::Strands;
//!
//! let frags = [Some("Hello"), None, Some(", "), Some("world")];
//! let s = Strands::bundle(&frags);
//!
//! assert_eq!(s.len(), 12);
//! assert_eq!(s.materialize(), "Hello, world");
//! ```

use crate::collab::{Workspace, WorkspaceOverflow};
use core::cmp::Ordering;
use core::fmt;

// ─────────────────────────────────────────────────────────────────────────────
// Strands
// ─────────────────────────────────────────────────────────────────────────────

/// A string represented as an ordered sequence of borrowed fragments.
///
/// Fragment order is concatenation order. The value owns nothing; both the
/// fragment list and the fragments themselves are borrowed, so bundling is
/// copy-free.
#[derive(Debug, Clone, Copy)]
pub struct Strands<'a> {
    frags: &'a [Option<&'a str>],
}

impl<'a> Strands<'a> {
    /// Collects a fragment list into a strands value without copying.
    ///
    /// Any fragment — including a trailing one a caller appends after fixed
    /// fragments — may be `None`, meaning that position contributes nothing
    /// while remaining distinct from an empty string.
    #[must_use]
    pub fn bundle(frags: &'a [Option<&'a str>]) -> Self {
        Self { frags }
    }

    /// Returns the raw fragment list.
    #[must_use]
    pub fn fragments(&self) -> &'a [Option<&'a str>] {
        self.frags
    }

    /// Returns the number of fragments (present or absent).
    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.frags.len()
    }

    /// Returns the logical byte length of the concatenation.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frags.iter().flatten().map(|s| s.len()).sum()
    }

    /// Returns true if the concatenation is zero bytes long.
    ///
    /// An unset value is also empty; use [`is_unset`](Self::is_unset) to
    /// tell the two apart.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frags.iter().flatten().all(|s| s.is_empty())
    }

    /// Returns true if every fragment is absent.
    ///
    /// Distinct from [`is_empty`](Self::is_empty): a single `Some("")`
    /// fragment makes the value empty but *set*.
    #[must_use]
    pub fn is_unset(&self) -> bool {
        self.frags.iter().all(Option::is_none)
    }

    /// Iterates the present, non-empty fragments as byte chunks.
    fn chunks(&self) -> impl Iterator<Item = &'a [u8]> {
        self.frags
            .iter()
            .flatten()
            .map(|s| s.as_bytes())
            .filter(|c| !c.is_empty())
    }

    /// Compares two strands by their logical concatenation.
    ///
    /// No materialization happens; comparison walks both fragment lists and
    /// is insensitive to how the same bytes are split across fragments.
    /// Absent fragments compare as empty.
    #[must_use]
    pub fn compare(&self, other: &Strands<'_>) -> Ordering {
        let mut ai = self.chunks();
        let mut bi = other.chunks();
        let mut ca: &[u8] = &[];
        let mut cb: &[u8] = &[];
        loop {
            // chunks() never yields empty slices, so an empty current chunk
            // means "fetch the next one" and None means exhausted.
            if ca.is_empty() {
                ca = ai.next().unwrap_or(&[]);
            }
            if cb.is_empty() {
                cb = bi.next().unwrap_or(&[]);
            }
            match (ca.is_empty(), cb.is_empty()) {
                (true, true) => return Ordering::Equal,
                (true, false) => return Ordering::Less,
                (false, true) => return Ordering::Greater,
                (false, false) => {}
            }
            let n = ca.len().min(cb.len());
            match ca[..n].cmp(&cb[..n]) {
                Ordering::Equal => {
                    ca = &ca[n..];
                    cb = &cb[n..];
                }
                ord => return ord,
            }
        }
    }

    /// Copies the concatenation into a contiguous string.
    ///
    /// Exactly one copy pass; absent fragments contribute nothing.
    #[must_use]
    pub fn materialize(&self) -> String {
        let mut out = String::with_capacity(self.len());
        for frag in self.frags.iter().flatten() {
            out.push_str(frag);
        }
        out
    }

    /// Materializes after charging the request's scratch budget.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceOverflow`] without copying anything if the
    /// workspace cannot cover the concatenated length.
    pub fn materialize_in(&self, ws: &dyn Workspace) -> Result<String, WorkspaceOverflow> {
        ws.reserve(self.len())?;
        Ok(self.materialize())
    }
}

impl PartialEq for Strands<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Strands<'_> {}

impl PartialOrd for Strands<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for Strands<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl fmt::Display for Strands<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frag in self.frags.iter().flatten() {
            f.write_str(frag)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::BudgetWorkspace;

    #[test]
    fn materialize_concatenates_in_order() {
        let frags = [Some("a"), Some("b"), Some("c")];
        let s = Strands::bundle(&frags);
        assert_eq!(s.materialize(), "abc");
        assert_eq!(s.to_string(), "abc");
    }

    #[test]
    fn null_fragments_concatenate_as_empty() {
        let frags = [None, Some("left"), None, Some("right"), None];
        let s = Strands::bundle(&frags);
        assert_eq!(s.materialize(), "leftright");
        assert_eq!(s.len(), 9);
        assert_eq!(s.fragment_count(), 5);
    }

    #[test]
    fn unset_and_empty_are_distinct() {
        let unset = Strands::bundle(&[None, None]);
        let empty = Strands::bundle(&[Some("")]);

        assert!(unset.is_unset());
        assert!(unset.is_empty());
        assert!(!empty.is_unset());
        assert!(empty.is_empty());

        // But they concatenate to the same bytes.
        assert_eq!(unset.compare(&empty), Ordering::Equal);
    }

    #[test]
    fn compare_is_split_insensitive() {
        let whole = [Some("abcdef")];
        let split = [Some("ab"), None, Some(""), Some("cd"), Some("ef")];
        let a = Strands::bundle(&whole);
        let b = Strands::bundle(&split);

        assert_eq!(a.compare(&b), Ordering::Equal);
        assert_eq!(a, b);
    }

    #[test]
    fn compare_agrees_with_materialized_order() {
        let cases: &[(&[Option<&str>], &[Option<&str>])] = &[
            (&[Some("abc")], &[Some("abd")]),
            (&[Some("ab")], &[Some("abc")]),
            (&[Some("b")], &[Some("a"), Some("z")]),
            (&[None], &[Some("a")]),
            (&[Some("x"), Some("y")], &[Some("xy"), Some("z")]),
            (&[Some(""), Some("q")], &[Some("q"), Some("")]),
        ];
        for (l, r) in cases {
            let a = Strands::bundle(l);
            let b = Strands::bundle(r);
            assert_eq!(
                a.compare(&b),
                a.materialize().cmp(&b.materialize()),
                "mismatch for {l:?} vs {r:?}"
            );
            assert_eq!(b.compare(&a), a.compare(&b).reverse());
        }
    }

    #[test]
    fn materialize_in_charges_workspace() {
        let ws = BudgetWorkspace::new(10);
        let frags = [Some("12345")];
        let s = Strands::bundle(&frags);

        assert_eq!(s.materialize_in(&ws).unwrap(), "12345");
        assert_eq!(ws.remaining(), 5);

        let big = [Some("123456789")];
        let err = Strands::bundle(&big).materialize_in(&ws).unwrap_err();
        assert_eq!(err.needed, 9);
        assert_eq!(err.remaining, 5);
    }

    #[test]
    fn ordering_trait_matches_compare() {
        let a = Strands::bundle(&[Some("aa")]);
        let b = Strands::bundle(&[Some("ab")]);
        assert!(a < b);
        assert!(b > a);
        assert_eq!(a.cmp(&a), Ordering::Equal);
    }
}
