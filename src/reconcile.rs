//! Reconciliation: diff two file-name sets to decide transfer direction
//!
//! Membership is by exact path string only - no timestamp or size
//! comparison. A path present on both sides is assumed synchronized even
//! if content differs; that is an accepted limitation of the protocol, not
//! something this engine may silently second-guess.

use std::collections::BTreeSet;

use crate::protocol::STAGING_SUFFIX;

/// The transfers needed to close the gap between two trees, from the
/// perspective of the side that ran the diff.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Plan {
    /// Paths I have and the peer lacks: push a full chunked transfer.
    pub push: Vec<String>,
    /// Paths the peer has and I lack: send a pull request per path.
    pub pull: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.push.is_empty() && self.pull.is_empty()
    }
}

// Split a raw listing into (real files, staged names). The staged side
// keeps the full suffixed name so lookups are a simple contains().
fn partition(raw: &BTreeSet<String>) -> (BTreeSet<&str>, BTreeSet<&str>) {
    let mut files = BTreeSet::new();
    let mut staged = BTreeSet::new();
    for p in raw {
        if p.ends_with(STAGING_SUFFIX) {
            staged.insert(p.as_str());
        } else {
            files.insert(p.as_str());
        }
    }
    (files, staged)
}

/// Compute the symmetric difference between my listing and the peer's,
/// suppressing paths whose transfer is already in flight (a staging name
/// on the receiving side means that file is already inbound there).
pub fn reconcile(mine: &BTreeSet<String>, theirs: &BTreeSet<String>) -> Plan {
    let (my_files, my_staged) = partition(mine);
    let (their_files, their_staged) = partition(theirs);

    let push = my_files
        .difference(&their_files)
        .filter(|p| !their_staged.contains(format!("{}{}", p, STAGING_SUFFIX).as_str()))
        .map(|p| p.to_string())
        .collect();

    let pull = their_files
        .difference(&my_files)
        .filter(|p| !my_staged.contains(format!("{}{}", p, STAGING_SUFFIX).as_str()))
        .map(|p| p.to_string())
        .collect();

    Plan { push, pull }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn symmetric_difference() {
        let mine = set(&["a", "b", "c"]);
        let theirs = set(&["b", "c", "d"]);
        let plan = reconcile(&mine, &theirs);
        assert_eq!(plan.push, vec!["a".to_string()]);
        assert_eq!(plan.pull, vec!["d".to_string()]);
    }

    #[test]
    fn identical_sets_need_nothing() {
        let both = set(&["x/y.txt", "z.txt"]);
        assert!(reconcile(&both, &both).is_empty());
    }

    #[test]
    fn inbound_staging_on_their_side_suppresses_push() {
        let mine = set(&["a", "b"]);
        let theirs = set(&["a", "b.swizdownload"]);
        let plan = reconcile(&mine, &theirs);
        // b is already on its way to them; pushing again would duplicate it.
        assert!(plan.push.is_empty());
        assert!(plan.pull.is_empty());
    }

    #[test]
    fn inbound_staging_on_my_side_suppresses_pull() {
        let mine = set(&["a", "b.swizdownload"]);
        let theirs = set(&["a", "b"]);
        let plan = reconcile(&mine, &theirs);
        assert!(plan.pull.is_empty());
        assert!(plan.push.is_empty());
    }

    #[test]
    fn staging_names_never_transfer_themselves() {
        let mine = set(&["orphan.swizdownload"]);
        let theirs = set(&[]);
        assert!(reconcile(&mine, &theirs).is_empty());
    }

    #[test]
    fn same_name_both_sides_is_considered_synchronized() {
        // Content is never compared; present-on-both means in sync even if
        // the bytes differ. Accepted protocol limitation.
        let mine = set(&["shared.txt"]);
        let theirs = set(&["shared.txt"]);
        assert!(reconcile(&mine, &theirs).is_empty());
    }
}
