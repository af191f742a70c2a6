//! Group membership models

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Difference between the stored and the current member set of a group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipDiff {
    /// Stored members absent upstream, ascending
    pub left: Vec<i64>,
    /// Upstream members absent from the store, ascending
    pub joined: Vec<i64>,
}

impl MembershipDiff {
    /// Compute `stored - current` and `current - stored`
    ///
    /// Duplicates in either input are ignored.
    pub fn compute(stored: &[i64], current: &[i64]) -> Self {
        let stored: BTreeSet<i64> = stored.iter().copied().collect();
        let current: BTreeSet<i64> = current.iter().copied().collect();

        Self {
            left: stored.difference(&current).copied().collect(),
            joined: current.difference(&stored).copied().collect(),
        }
    }

    /// True when the stored set already matches upstream
    pub fn is_empty(&self) -> bool {
        self.left.is_empty() && self.joined.is_empty()
    }
}
