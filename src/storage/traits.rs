//! Abstract storage traits for contact reconciliation.
//!
//! The engine depends only on these traits. A backend hands out
//! [`ContactTransaction`]s; every identify request runs its whole
//! read-modify-write sequence inside one of them and commits at the end.
//! Backends must give transactions serializable semantics and report a lost
//! race as [`StorageError::Conflict`], which the engine retries.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::contact::{Contact, ContactId, ContactPatch, NewContact};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Contact not found.
    #[error("Contact not found: {0}")]
    ContactNotFound(ContactId),

    /// A concurrent transaction committed a conflicting write.
    #[error("Serialization conflict: {0}")]
    Conflict(String),

    /// The write would break a group invariant.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl StorageError {
    /// Returns true for transient serialization conflicts.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// A contact repository.
///
/// # Safety Considerations
/// - Implementations must be safe to share across threads
/// - Transactions may run concurrently; isolation is the backend's job
pub trait ContactStore: Send + Sync {
    /// Opens a transaction over a consistent view of the table.
    fn begin(&self) -> Result<Box<dyn ContactTransaction + '_>, StorageError>;

    /// Reads a single contact outside any transaction, including soft-deleted ones.
    fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError>;

    /// Number of stored contacts, including soft-deleted ones.
    fn count(&self) -> Result<usize, StorageError>;

    /// Bulk-loads fully formed records (fixtures, migrations).
    ///
    /// Ids are taken as given; an id that already exists is a `DuplicateKey`.
    /// Later creates are assigned ids above every imported one.
    fn import(&self, contacts: Vec<Contact>) -> Result<(), StorageError>;
}

/// A unit of work against the contact table.
///
/// Reads observe the transaction's own writes. Dropping a transaction without
/// calling [`commit`](ContactTransaction::commit) discards every write.
pub trait ContactTransaction {
    /// Non-deleted contacts whose email equals `email` or whose phone equals
    /// `phone_number`, oldest first. Empty when both are `None`.
    fn find_by_email_or_phone(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, StorageError>;

    /// Non-deleted contacts whose id is in `ids` or whose link points into
    /// `ids`, oldest first.
    fn find_by_roots_or_linked_to(
        &mut self,
        ids: &BTreeSet<ContactId>,
    ) -> Result<Vec<Contact>, StorageError>;

    /// Inserts a contact; assigns its id and timestamps.
    fn create(&mut self, contact: NewContact) -> Result<Contact, StorageError>;

    /// Applies `patch` to one contact.
    fn update(&mut self, id: ContactId, patch: &ContactPatch) -> Result<Contact, StorageError>;

    /// Applies `patch` to every non-deleted contact linked to `linked_id`.
    /// Returns how many were changed.
    fn update_linked_to(
        &mut self,
        linked_id: ContactId,
        patch: &ContactPatch,
    ) -> Result<usize, StorageError>;

    /// Makes every write visible atomically, or fails with `Conflict` and
    /// applies nothing.
    fn commit(self: Box<Self>) -> Result<(), StorageError>;
}
