//! Whether a request adds information worth a new secondary record.

use crate::contact::Contact;

/// Outcome of the secondary-record policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondaryDecision {
    /// A member already carries exactly this (email, phone) pair.
    ExactMatch,
    /// Both identifiers are present and at least one is new to the group.
    NewInformation,
    /// Nothing new, or only one identifier was supplied.
    LookupOnly,
}

impl SecondaryDecision {
    /// Returns true if a secondary should be created.
    #[must_use]
    pub const fn creates_record(self) -> bool {
        matches!(self, Self::NewInformation)
    }
}

/// Applies the policy to a (possibly just merged) group.
#[must_use]
pub fn decide(
    members: &[Contact],
    email: Option<&str>,
    phone_number: Option<&str>,
) -> SecondaryDecision {
    if members.iter().any(|c| c.has_identifiers(email, phone_number)) {
        return SecondaryDecision::ExactMatch;
    }

    let (Some(email), Some(phone)) = (email, phone_number) else {
        return SecondaryDecision::LookupOnly;
    };

    let email_known = members.iter().any(|c| c.email.as_deref() == Some(email));
    let phone_known = members.iter().any(|c| c.phone_number.as_deref() == Some(phone));
    if email_known && phone_known {
        SecondaryDecision::LookupOnly
    } else {
        SecondaryDecision::NewInformation
    }
}
