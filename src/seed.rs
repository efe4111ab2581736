//! Demo data: the FluxKart customer story.
//!
//! Four groups. Doc and McFly share a phone, Lorraine hangs off George,
//! Biff stands alone, and Jennifer shares Marty's phone.

use crate::contact::NewContact;
use crate::storage::{ContactStore, StorageError};

struct DemoGroup {
    primary: (&'static str, &'static str),
    secondaries: &'static [(&'static str, &'static str)],
}

const DEMO_GROUPS: &[DemoGroup] = &[
    DemoGroup {
        primary: ("doc@fluxkart.com", "999999"),
        secondaries: &[("mcfly@fluxkart.com", "999999")],
    },
    DemoGroup {
        primary: ("george@hillvalley.edu", "919191"),
        secondaries: &[("lorraine@hillvalley.edu", "123456")],
    },
    DemoGroup {
        primary: ("biff@hillvalley.edu", "717171"),
        secondaries: &[],
    },
    DemoGroup {
        primary: ("marty@fluxkart.com", "555555"),
        secondaries: &[("jennifer@fluxkart.com", "555555")],
    },
];

/// Writes the demo contacts in one transaction and returns how many were
/// created.
///
/// A store that already holds contacts is left untouched and 0 is returned.
///
/// # Errors
/// Any storage failure; nothing is written in that case.
pub fn seed_demo_contacts(store: &dyn ContactStore) -> Result<usize, StorageError> {
    let existing = store.count()?;
    if existing > 0 {
        tracing::info!(existing, "store already populated; skipping demo seed");
        return Ok(0);
    }

    let mut tx = store.begin()?;
    let mut created = 0;
    for group in DEMO_GROUPS {
        let (email, phone) = group.primary;
        let primary = tx.create(NewContact::primary(Some(email.into()), Some(phone.into())))?;
        created += 1;
        for &(email, phone) in group.secondaries {
            tx.create(NewContact::secondary(
                Some(email.into()),
                Some(phone.into()),
                primary.id,
            ))?;
            created += 1;
        }
    }
    tx.commit()?;

    tracing::info!(created, "seeded demo contacts");
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ReconcileEngine;
    use crate::request::IdentifyRequest;
    use crate::storage::InMemoryContactStore;
    use std::sync::Arc;

    #[test]
    fn seeds_four_groups_once() {
        let store = InMemoryContactStore::new();
        assert_eq!(seed_demo_contacts(&store).unwrap(), 7);
        assert_eq!(seed_demo_contacts(&store).unwrap(), 0);
        assert_eq!(store.count().unwrap(), 7);
    }

    #[test]
    fn seeded_groups_resolve() {
        let store = Arc::new(InMemoryContactStore::new());
        seed_demo_contacts(store.as_ref()).unwrap();
        let engine = ReconcileEngine::new(store.clone());

        let request = IdentifyRequest::builder().phone_number("555555").build().unwrap();
        let view = engine.identify(&request).unwrap().contact;
        assert_eq!(view.primary_contact_id.get(), 6);
        assert_eq!(view.emails, vec!["marty@fluxkart.com", "jennifer@fluxkart.com"]);
        assert_eq!(view.secondary_contact_ids.len(), 1);
        assert_eq!(store.count().unwrap(), 7);
    }
}
