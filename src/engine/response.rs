//! The consolidated identity view returned by identify.

use serde::{Deserialize, Serialize};

use crate::contact::{Contact, ContactId};
use crate::error::InvariantViolation;

/// Response envelope: `{ "contact": { ... } }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyResponse {
    /// The reconciled identity.
    pub contact: IdentityView,
}

/// One identity group, flattened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityView {
    /// Id of the group primary.
    pub primary_contact_id: ContactId,
    /// Distinct emails, primary's first.
    pub emails: Vec<String>,
    /// Distinct phone numbers, primary's first.
    pub phone_numbers: Vec<String>,
    /// Secondary ids, oldest first.
    pub secondary_contact_ids: Vec<ContactId>,
}

/// The single primary of a member set.
///
/// # Errors
/// `EmptyGroup`, `NoPrimary` or `MultiplePrimaries` when the set is not a
/// well-formed group.
pub fn single_primary(members: &[Contact]) -> Result<&Contact, InvariantViolation> {
    if members.is_empty() {
        return Err(InvariantViolation::EmptyGroup);
    }
    let primaries: Vec<&Contact> = members.iter().filter(|c| c.is_primary()).collect();
    match primaries.as_slice() {
        [primary] => Ok(*primary),
        [] => Err(InvariantViolation::NoPrimary {
            members: members.iter().map(|c| c.id).collect(),
        }),
        many => Err(InvariantViolation::MultiplePrimaries {
            primaries: many.iter().map(|c| c.id).collect(),
        }),
    }
}

fn push_distinct(out: &mut Vec<String>, value: Option<&String>) {
    if let Some(value) = value {
        if !out.contains(value) {
            out.push(value.clone());
        }
    }
}

/// Builds the view for a post-merge, post-creation member set.
///
/// # Errors
/// Fails with an [`InvariantViolation`] unless exactly one primary is present.
pub fn build_response(members: &[Contact]) -> Result<IdentifyResponse, InvariantViolation> {
    let primary = single_primary(members)?;

    let mut secondaries: Vec<&Contact> = members.iter().filter(|c| !c.is_primary()).collect();
    secondaries.sort_by(|a, b| a.chronological_cmp(b));

    let mut emails = Vec::new();
    let mut phone_numbers = Vec::new();
    push_distinct(&mut emails, primary.email.as_ref());
    push_distinct(&mut phone_numbers, primary.phone_number.as_ref());
    for secondary in &secondaries {
        push_distinct(&mut emails, secondary.email.as_ref());
        push_distinct(&mut phone_numbers, secondary.phone_number.as_ref());
    }

    Ok(IdentifyResponse {
        contact: IdentityView {
            primary_contact_id: primary.id,
            emails,
            phone_numbers,
            secondary_contact_ids: secondaries.iter().map(|c| c.id).collect(),
        },
    })
}
