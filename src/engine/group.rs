//! Group expansion: from a handful of matched contacts to their full groups.

use std::collections::BTreeSet;

use crate::contact::{sort_chronologically, Contact, ContactId};
use crate::storage::{ContactTransaction, StorageError};

/// The distinct primaries the seeds resolve to.
#[must_use]
pub fn root_ids(seeds: &[Contact]) -> BTreeSet<ContactId> {
    seeds.iter().filter_map(Contact::root_id).collect()
}

/// Loads every live member of every group touched by `seeds`, oldest first.
///
/// Usually one group; two when the seeds bridge unrelated groups. A seed set
/// that resolves to no root at all (secondaries with missing links) is
/// returned as-is.
pub fn expand_group(
    tx: &mut dyn ContactTransaction,
    seeds: &[Contact],
) -> Result<Vec<Contact>, StorageError> {
    if seeds.is_empty() {
        return Ok(Vec::new());
    }

    let roots = root_ids(seeds);
    if roots.is_empty() {
        tracing::warn!(
            seeds = ?seeds.iter().map(|c| c.id).collect::<Vec<_>>(),
            "matched contacts resolve to no primary"
        );
        let mut members = seeds.to_vec();
        sort_chronologically(&mut members);
        return Ok(members);
    }

    tx.find_by_roots_or_linked_to(&roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::{LinkPrecedence, NewContact};
    use crate::storage::{ContactStore, InMemoryContactStore};
    use chrono::Utc;

    #[test]
    fn expands_a_secondary_to_its_whole_group() {
        let store = InMemoryContactStore::new();
        let mut tx = store.begin().unwrap();
        let george = tx
            .create(NewContact::primary(Some("george@hillvalley.edu".into()), Some("919191".into())))
            .unwrap();
        let sibling = tx
            .create(NewContact::secondary(Some("g2@hillvalley.edu".into()), Some("919191".into()), george.id))
            .unwrap();
        let other = tx
            .create(NewContact::secondary(Some("g3@hillvalley.edu".into()), None, george.id))
            .unwrap();

        let group = expand_group(tx.as_mut(), std::slice::from_ref(&other)).unwrap();
        let ids: Vec<_> = group.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![george.id, sibling.id, other.id]);
    }

    #[test]
    fn seeds_without_roots_are_returned_unchanged() {
        let now = Utc::now();
        let orphan = Contact {
            id: ContactId::new(9),
            email: Some("orphan@x.com".into()),
            phone_number: None,
            linked_id: None,
            link_precedence: LinkPrecedence::Secondary,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        let store = InMemoryContactStore::new();
        let mut tx = store.begin().unwrap();
        let group = expand_group(tx.as_mut(), std::slice::from_ref(&orphan)).unwrap();
        assert_eq!(group, vec![orphan]);
    }

    #[test]
    fn root_ids_deduplicate() {
        let store = InMemoryContactStore::new();
        let mut tx = store.begin().unwrap();
        let p = tx.create(NewContact::primary(Some("p@x.com".into()), None)).unwrap();
        let s = tx.create(NewContact::secondary(None, Some("1".into()), p.id)).unwrap();
        assert_eq!(root_ids(&[p.clone(), s]), BTreeSet::from([p.id]));
    }
}
