//! Local/remote set reconciliation.
//!
//! Pure set arithmetic over [`LogicalIdentifier`]s: nothing here performs I/O.
//! The pipeline feeds in the identifiers it derived from the local scan and
//! the identifiers a full remote listing returned.

use serde::Serialize;
use std::collections::BTreeSet;

use crate::models::LogicalIdentifier;

/// Identifiers present locally but absent remotely.
pub fn missing(
    local: &BTreeSet<LogicalIdentifier>,
    remote: &BTreeSet<LogicalIdentifier>,
) -> BTreeSet<LogicalIdentifier> {
    local.difference(remote).cloned().collect()
}

/// Identifiers present remotely but absent locally.
pub fn stale(
    local: &BTreeSet<LogicalIdentifier>,
    remote: &BTreeSet<LogicalIdentifier>,
) -> BTreeSet<LogicalIdentifier> {
    remote.difference(local).cloned().collect()
}

/// Full comparison of one gallery's local and remote identifier sets.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Reconciliation {
    pub missing: BTreeSet<LogicalIdentifier>,
    pub stale: BTreeSet<LogicalIdentifier>,
    /// Identifiers on both sides.
    pub present: BTreeSet<LogicalIdentifier>,
}

impl Reconciliation {
    pub fn compute(
        local: &BTreeSet<LogicalIdentifier>,
        remote: &BTreeSet<LogicalIdentifier>,
    ) -> Self {
        Self {
            missing: missing(local, remote),
            stale: stale(local, remote),
            present: local.intersection(remote).cloned().collect(),
        }
    }

    pub fn is_converged(&self) -> bool {
        self.missing.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> BTreeSet<LogicalIdentifier> {
        ids.iter().map(|s| LogicalIdentifier::from_remote(*s)).collect()
    }

    #[test]
    fn missing_is_local_minus_remote() {
        let m = missing(&set(&["A", "B", "C"]), &set(&["A", "C"]));
        assert_eq!(m, set(&["B"]));
    }

    #[test]
    fn stale_is_remote_minus_local() {
        let s = stale(&set(&["A"]), &set(&["A", "Z"]));
        assert_eq!(s, set(&["Z"]));
    }

    #[test]
    fn empty_sides() {
        assert!(missing(&set(&[]), &set(&["A"])).is_empty());
        assert_eq!(missing(&set(&["A"]), &set(&[])), set(&["A"]));
        assert!(stale(&set(&[]), &set(&[])).is_empty());
    }

    #[test]
    fn compute_partitions_both_sets() {
        let r = Reconciliation::compute(&set(&["A", "B"]), &set(&["B", "C"]));
        assert_eq!(r.missing, set(&["A"]));
        assert_eq!(r.stale, set(&["C"]));
        assert_eq!(r.present, set(&["B"]));
        assert!(!r.is_converged());

        let done = Reconciliation::compute(&set(&["A"]), &set(&["A", "C"]));
        assert!(done.is_converged());
    }
}
