//! Primary merging.
//!
//! When a request bridges two groups, the expanded member set contains more
//! than one primary. The oldest one (earliest `created_at`, lowest id on a
//! tie) stays primary; every other primary is demoted under it and its
//! dependents are re-pointed in the same step, so links stay one hop deep.

use chrono::{DateTime, Utc};

use crate::contact::{Contact, ContactId, ContactPatch};
use crate::storage::{ContactTransaction, StorageError};

/// What a merge changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    /// The surviving primary.
    pub canonical: ContactId,
    /// Former primaries, now secondaries of `canonical`.
    pub demoted: Vec<ContactId>,
    /// Dependents moved from a demoted primary to `canonical`.
    pub relinked: usize,
}

/// The primary that wins a merge.
#[must_use]
pub fn select_canonical<'a>(primaries: &[&'a Contact]) -> Option<&'a Contact> {
    primaries
        .iter()
        .copied()
        .min_by(|a, b| a.chronological_cmp(b))
}

/// Collapses every primary in `group` under the oldest one.
///
/// Returns `None` when the group already has at most one primary.
pub fn merge_primaries(
    tx: &mut dyn ContactTransaction,
    group: &[Contact],
    now: DateTime<Utc>,
) -> Result<Option<MergeReport>, StorageError> {
    let primaries: Vec<&Contact> = group.iter().filter(|c| c.is_primary()).collect();
    if primaries.len() < 2 {
        return Ok(None);
    }
    let Some(canonical) = select_canonical(&primaries) else {
        return Ok(None);
    };
    let canonical = canonical.id;

    let mut demoted = Vec::with_capacity(primaries.len() - 1);
    let mut relinked = 0;
    for primary in primaries.iter().filter(|p| p.id != canonical) {
        tx.update(primary.id, &ContactPatch::demote(canonical, now))?;
        relinked += tx.update_linked_to(primary.id, &ContactPatch::relink(canonical, now))?;
        demoted.push(primary.id);
    }

    Ok(Some(MergeReport {
        canonical,
        demoted,
        relinked,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::contact::{LinkPrecedence, NewContact};
    use crate::storage::{ContactStore, InMemoryContactStore};
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    #[test]
    fn oldest_primary_wins_and_dependents_move() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2023, 4, 1, 0, 0, 0).unwrap()));
        let store = InMemoryContactStore::with_clock(clock.clone());
        let mut tx = store.begin().unwrap();

        let george = tx
            .create(NewContact::primary(Some("george@hillvalley.edu".into()), Some("919191".into())))
            .unwrap();
        clock.advance(Duration::days(1));
        let biff = tx
            .create(NewContact::primary(Some("biffsucks@hillvalley.edu".into()), Some("717171".into())))
            .unwrap();
        clock.advance(Duration::days(1));
        let biff_alt = tx
            .create(NewContact::secondary(Some("biff@hillvalley.edu".into()), Some("717171".into()), biff.id))
            .unwrap();

        let group = tx
            .find_by_roots_or_linked_to(&BTreeSet::from([george.id, biff.id]))
            .unwrap();
        let report = merge_primaries(tx.as_mut(), &group, clock.now()).unwrap().unwrap();
        assert_eq!(report.canonical, george.id);
        assert_eq!(report.demoted, vec![biff.id]);
        assert_eq!(report.relinked, 1);

        let after = tx
            .find_by_roots_or_linked_to(&BTreeSet::from([george.id]))
            .unwrap();
        assert_eq!(after.len(), 3);
        let biff_now = after.iter().find(|c| c.id == biff.id).unwrap();
        assert_eq!(biff_now.link_precedence, LinkPrecedence::Secondary);
        assert_eq!(biff_now.linked_id, Some(george.id));
        let alt_now = after.iter().find(|c| c.id == biff_alt.id).unwrap();
        assert_eq!(alt_now.linked_id, Some(george.id));
        assert_eq!(alt_now.created_at, biff_alt.created_at);
    }

    #[test]
    fn equal_timestamps_fall_back_to_lowest_id() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = InMemoryContactStore::with_clock(clock);
        let mut tx = store.begin().unwrap();
        let first = tx.create(NewContact::primary(Some("a@x.com".into()), None)).unwrap();
        let second = tx.create(NewContact::primary(Some("b@x.com".into()), None)).unwrap();
        assert_eq!(first.created_at, second.created_at);

        let picked = select_canonical(&[&second, &first]).unwrap();
        assert_eq!(picked.id, first.id);
    }

    #[test]
    fn single_primary_is_left_alone() {
        let store = InMemoryContactStore::new();
        let mut tx = store.begin().unwrap();
        let p = tx.create(NewContact::primary(Some("p@x.com".into()), None)).unwrap();
        let report = merge_primaries(tx.as_mut(), &[p], Utc::now()).unwrap();
        assert!(report.is_none());
    }
}
