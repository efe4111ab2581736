//! Match finding: which stored contacts share an identifier with the request.

use crate::contact::Contact;
use crate::storage::{ContactTransaction, StorageError};

/// Returns every live contact whose email equals `email` or whose phone equals
/// `phone_number`, oldest first.
///
/// Matching is exact string equality on either field. With neither
/// identifier the result is empty.
pub fn find_matches(
    tx: &mut dyn ContactTransaction,
    email: Option<&str>,
    phone_number: Option<&str>,
) -> Result<Vec<Contact>, StorageError> {
    if email.is_none() && phone_number.is_none() {
        return Ok(Vec::new());
    }
    tx.find_by_email_or_phone(email, phone_number)
}
