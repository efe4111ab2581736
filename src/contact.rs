//! Contact records: the single entity the reconciler works on.
//!
//! A contact is one observed (email, phone) pair. Contacts that belong to the
//! same person form an identity group: one `primary` record plus any number of
//! `secondary` records whose `linked_id` points straight at the primary.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a stored contact.
///
/// Assigned by the repository at creation time; monotonically increasing and
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactId(i64);

impl ContactId {
    /// Wraps a raw identifier.
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Returns the raw integer value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for ContactId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a contact inside its identity group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPrecedence {
    /// Root of the group.
    Primary,
    /// Linked to the group's primary.
    Secondary,
}

impl LinkPrecedence {
    /// Returns true for `Primary`.
    #[must_use]
    pub const fn is_primary(self) -> bool {
        matches!(self, Self::Primary)
    }
}

impl fmt::Display for LinkPrecedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Secondary => f.write_str("secondary"),
        }
    }
}

/// A stored contact record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    /// Repository-assigned identifier.
    pub id: ContactId,
    /// Email address, if the contact was observed with one.
    pub email: Option<String>,
    /// Phone number in its normalized string form.
    pub phone_number: Option<String>,
    /// The group primary this record hangs off. `None` for primaries.
    pub linked_id: Option<ContactId>,
    /// Role inside the identity group.
    pub link_precedence: LinkPrecedence,
    /// Creation time; the ordering key for "oldest wins".
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Soft-deletion marker.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Contact {
    /// Returns true if this record is a group root.
    #[must_use]
    pub const fn is_primary(&self) -> bool {
        self.link_precedence.is_primary()
    }

    /// Returns true if the record has been soft-deleted.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// The primary this record resolves to: itself when primary, otherwise its link.
    ///
    /// `None` only for a corrupt secondary that lost its link.
    #[must_use]
    pub const fn root_id(&self) -> Option<ContactId> {
        if self.is_primary() {
            Some(self.id)
        } else {
            self.linked_id
        }
    }

    /// Exact comparison of both identifiers, where absent only equals absent.
    #[must_use]
    pub fn has_identifiers(&self, email: Option<&str>, phone_number: Option<&str>) -> bool {
        self.email.as_deref() == email && self.phone_number.as_deref() == phone_number
    }

    /// Chronological order: `created_at`, then ascending `id`.
    #[must_use]
    pub fn chronological_cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Sorts contacts into chronological order in place.
pub fn sort_chronologically(contacts: &mut [Contact]) {
    contacts.sort_by(Contact::chronological_cmp);
}

/// Insert shape for a contact. The repository assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContact {
    /// Email address.
    pub email: Option<String>,
    /// Normalized phone number.
    pub phone_number: Option<String>,
    /// Primary to link to; required for secondaries, forbidden for primaries.
    pub linked_id: Option<ContactId>,
    /// Role of the new record.
    pub link_precedence: LinkPrecedence,
}

impl NewContact {
    /// A fresh group root.
    #[must_use]
    pub fn primary(email: Option<String>, phone_number: Option<String>) -> Self {
        Self {
            email,
            phone_number,
            linked_id: None,
            link_precedence: LinkPrecedence::Primary,
        }
    }

    /// A record linked to an existing primary.
    #[must_use]
    pub fn secondary(
        email: Option<String>,
        phone_number: Option<String>,
        primary: ContactId,
    ) -> Self {
        Self {
            email,
            phone_number,
            linked_id: Some(primary),
            link_precedence: LinkPrecedence::Secondary,
        }
    }
}

/// Update shape for a contact.
///
/// Only the link, the precedence and `updated_at` are mutable; identifiers and
/// `created_at` are not representable here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactPatch {
    /// New link target, if changing.
    pub linked_id: Option<ContactId>,
    /// New precedence, if changing.
    pub link_precedence: Option<LinkPrecedence>,
    /// Mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl ContactPatch {
    /// Turns a primary into a secondary of `primary`.
    #[must_use]
    pub const fn demote(primary: ContactId, now: DateTime<Utc>) -> Self {
        Self {
            linked_id: Some(primary),
            link_precedence: Some(LinkPrecedence::Secondary),
            updated_at: now,
        }
    }

    /// Re-points a secondary at `primary`.
    #[must_use]
    pub const fn relink(primary: ContactId, now: DateTime<Utc>) -> Self {
        Self {
            linked_id: Some(primary),
            link_precedence: None,
            updated_at: now,
        }
    }

    /// Applies the patch to a record.
    pub fn apply(&self, contact: &mut Contact) {
        if let Some(linked_id) = self.linked_id {
            contact.linked_id = Some(linked_id);
        }
        if let Some(precedence) = self.link_precedence {
            contact.link_precedence = precedence;
        }
        contact.updated_at = self.updated_at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn contact(id: i64, secs: i64, precedence: LinkPrecedence) -> Contact {
        let at = Utc.timestamp_opt(secs, 0).single().unwrap();
        Contact {
            id: ContactId::new(id),
            email: Some(format!("c{id}@example.com")),
            phone_number: None,
            linked_id: None,
            link_precedence: precedence,
            created_at: at,
            updated_at: at,
            deleted_at: None,
        }
    }

    #[test]
    fn chronological_order_breaks_ties_by_id() {
        let mut contacts = vec![
            contact(3, 10, LinkPrecedence::Primary),
            contact(2, 10, LinkPrecedence::Primary),
            contact(1, 20, LinkPrecedence::Primary),
        ];
        sort_chronologically(&mut contacts);
        let ids: Vec<i64> = contacts.iter().map(|c| c.id.get()).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn root_id_follows_link_for_secondaries() {
        let primary = contact(1, 0, LinkPrecedence::Primary);
        assert_eq!(primary.root_id(), Some(ContactId::new(1)));

        let mut secondary = contact(2, 1, LinkPrecedence::Secondary);
        assert_eq!(secondary.root_id(), None);
        secondary.linked_id = Some(ContactId::new(1));
        assert_eq!(secondary.root_id(), Some(ContactId::new(1)));
    }

    #[test]
    fn has_identifiers_treats_absent_as_a_value() {
        let mut c = contact(1, 0, LinkPrecedence::Primary);
        c.phone_number = None;
        assert!(c.has_identifiers(Some("c1@example.com"), None));
        assert!(!c.has_identifiers(Some("c1@example.com"), Some("123")));
        assert!(!c.has_identifiers(None, None));
    }

    #[test]
    fn demote_patch_rewrites_link_and_precedence() {
        let mut c = contact(5, 0, LinkPrecedence::Primary);
        let now = Utc.timestamp_opt(100, 0).single().unwrap();
        ContactPatch::demote(ContactId::new(1), now).apply(&mut c);
        assert_eq!(c.link_precedence, LinkPrecedence::Secondary);
        assert_eq!(c.linked_id, Some(ContactId::new(1)));
        assert_eq!(c.updated_at, now);
        assert_eq!(c.created_at, Utc.timestamp_opt(0, 0).single().unwrap());
    }

    #[test]
    fn serializes_with_camel_case_columns() {
        let c = contact(7, 0, LinkPrecedence::Secondary);
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["linkPrecedence"], "secondary");
        assert!(json.get("phoneNumber").is_some());
        assert!(json.get("linkedId").is_some());
    }
}
