//! Eviction decisions for full buckets.
//!
//! A bucket evicts its minimum-meta slot to make room for a new key. When
//! the caller lets the table assign metas, every new key gets the next value
//! of the bucket's recency counter, so the minimum is always the oldest entry
//! and it is always evicted. When the caller supplies a meta, the
//! [`Admission`] rule decides whether the candidate may displace the current
//! minimum or is itself discarded.

use crate::element::Meta;

/// Rule comparing a supplied meta against a full bucket's minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Admission {
    /// Admit when `candidate >= min_meta`.
    #[default]
    NotSmaller,
    /// Admit only when `candidate > min_meta`.
    StrictlyLarger,
}

impl Admission {
    /// Whether a candidate with `candidate` meta replaces the slot holding `min_meta`.
    #[inline]
    pub fn admits<M: Meta>(&self, candidate: M, min_meta: M) -> bool {
        match self {
            Self::NotSmaller => candidate >= min_meta,
            Self::StrictlyLarger => candidate > min_meta,
        }
    }
}

/// Outcome of inserting one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStatus {
    /// Stored in a free slot.
    Inserted,
    /// Key existed; value and meta were overwritten.
    Updated,
    /// Stored after evicting the bucket's minimum-meta entry.
    Evicted,
    /// Not stored: the supplied meta lost against the bucket minimum.
    Rejected,
}

impl InsertStatus {
    /// Whether the key is now present with the supplied value.
    #[inline]
    pub fn is_stored(&self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

/// Outcome of erasing one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseStatus {
    /// The key was present and has been removed.
    Removed,
    /// The key was not present.
    NotFound,
}
