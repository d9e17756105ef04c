//! Type-safe identifier wrapper for dots.
//!
//! Dot identifiers are plain unsigned integers in the store. Wrapping them
//! prevents a parent id and a child id from being swapped silently at call
//! sites that take both.

use serde::{Deserialize, Serialize};

/// Identifier of a dot. `0` is the base root dot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DotId(pub u64);

impl DotId {
    /// The base root dot.
    pub const ROOT: Self = Self(0);

    /// Return the inner `u64` value.
    pub const fn into_inner(self) -> u64 {
        self.0
    }

    /// Whether this id denotes the root dot.
    pub const fn is_root(self) -> bool {
        self.0 == 0
    }
}

impl core::fmt::Display for DotId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for DotId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<DotId> for u64 {
    fn from(id: DotId) -> Self {
        id.0
    }
}
