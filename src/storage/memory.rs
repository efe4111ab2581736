//! In-memory storage backend.
//!
//! This module provides a thread-safe in-memory contact table with
//! serializable transactions. It is intended for embedded usage, tests, and as
//! the state engine underneath the persistent backend.
//!
//! Transactions run optimistically: each one works on an immutable snapshot
//! of the table plus a private write set, and records every predicate it read
//! (emails, phones, ids/links). At commit the transaction is checked against
//! every batch committed since its snapshot; if any of those rows matched one
//! of its read predicates, before or after the change, the commit fails with
//! [`StorageError::Conflict`] and nothing is applied.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::contact::{sort_chronologically, Contact, ContactId, ContactPatch, NewContact};
use crate::storage::traits::{ContactStore, ContactTransaction, StorageError};

/// Default number of committed batches kept for conflict validation.
pub const DEFAULT_COMMIT_HISTORY: usize = 4096;

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// The rows written by one committed transaction, as after-images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitBatch {
    /// Commit sequence number; strictly increasing.
    pub sequence: u64,
    /// When the batch was committed.
    pub committed_at: DateTime<Utc>,
    /// Every created or updated contact, in id order.
    pub contacts: Vec<Contact>,
}

/// Receives each batch before it becomes visible.
///
/// Called with the table write lock held, so batches arrive in commit order.
/// An error aborts the commit.
pub trait CommitJournal: Send + Sync {
    /// Durably records `batch`.
    fn record(&self, batch: &CommitBatch) -> Result<(), StorageError>;
}

/// The contact table with its secondary indexes.
#[derive(Debug, Clone, Default)]
pub struct ContactTable {
    rows: BTreeMap<ContactId, Contact>,
    by_email: HashMap<String, BTreeSet<ContactId>>,
    by_phone: HashMap<String, BTreeSet<ContactId>>,
    by_linked: HashMap<ContactId, BTreeSet<ContactId>>,
}

impl ContactTable {
    /// Builds a table from a set of rows.
    #[must_use]
    pub fn from_contacts(contacts: impl IntoIterator<Item = Contact>) -> Self {
        let mut table = Self::default();
        for contact in contacts {
            table.upsert(contact);
        }
        table
    }

    /// Looks up a row by id.
    #[must_use]
    pub fn get(&self, id: ContactId) -> Option<&Contact> {
        self.rows.get(&id)
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the table holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// All rows in id order.
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.rows.values()
    }

    /// Highest id in the table.
    #[must_use]
    pub fn max_id(&self) -> Option<ContactId> {
        self.rows.keys().next_back().copied()
    }

    fn upsert(&mut self, contact: Contact) {
        if let Some(previous) = self.rows.remove(&contact.id) {
            self.unindex(&previous);
        }
        self.index(&contact);
        self.rows.insert(contact.id, contact);
    }

    fn index(&mut self, contact: &Contact) {
        if let Some(email) = &contact.email {
            self.by_email.entry(email.clone()).or_default().insert(contact.id);
        }
        if let Some(phone) = &contact.phone_number {
            self.by_phone.entry(phone.clone()).or_default().insert(contact.id);
        }
        if let Some(linked) = contact.linked_id {
            self.by_linked.entry(linked).or_default().insert(contact.id);
        }
    }

    fn unindex(&mut self, contact: &Contact) {
        fn remove<K: std::hash::Hash + Eq>(
            index: &mut HashMap<K, BTreeSet<ContactId>>,
            key: &K,
            id: ContactId,
        ) {
            if let Some(ids) = index.get_mut(key) {
                ids.remove(&id);
                if ids.is_empty() {
                    index.remove(key);
                }
            }
        }

        if let Some(email) = &contact.email {
            remove(&mut self.by_email, email, contact.id);
        }
        if let Some(phone) = &contact.phone_number {
            remove(&mut self.by_phone, phone, contact.id);
        }
        if let Some(linked) = contact.linked_id {
            remove(&mut self.by_linked, &linked, contact.id);
        }
    }

    fn ids_with_email(&self, email: &str) -> impl Iterator<Item = ContactId> + '_ {
        self.by_email.get(email).into_iter().flatten().copied()
    }

    fn ids_with_phone(&self, phone: &str) -> impl Iterator<Item = ContactId> + '_ {
        self.by_phone.get(phone).into_iter().flatten().copied()
    }

    fn ids_linked_to(&self, id: ContactId) -> impl Iterator<Item = ContactId> + '_ {
        self.by_linked.get(&id).into_iter().flatten().copied()
    }
}

#[derive(Debug)]
struct CommittedChange {
    sequence: u64,
    ids: Vec<ContactId>,
}

#[derive(Debug, Default)]
struct TableState {
    table: Arc<ContactTable>,
    sequence: u64,
    commit_log: VecDeque<CommittedChange>,
}

impl TableState {
    fn install(&mut self, batch: CommitBatch, history: usize) {
        let ids = batch.contacts.iter().map(|c| c.id).collect();
        let table = Arc::make_mut(&mut self.table);
        for contact in batch.contacts {
            table.upsert(contact);
        }
        self.sequence = batch.sequence;
        self.commit_log.push_back(CommittedChange {
            sequence: batch.sequence,
            ids,
        });
        while self.commit_log.len() > history {
            self.commit_log.pop_front();
        }
    }
}

/// Thread-safe in-memory contact store.
pub struct InMemoryContactStore {
    state: RwLock<TableState>,
    next_id: AtomicI64,
    clock: Arc<dyn Clock>,
    journal: Option<Arc<dyn CommitJournal>>,
    history: usize,
}

impl fmt::Debug for InMemoryContactStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryContactStore")
            .field("next_id", &self.next_id)
            .field("journaled", &self.journal.is_some())
            .field("history", &self.history)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryContactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryContactStore {
    /// Creates an empty store on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store on the given clock.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(TableState::default()),
            next_id: AtomicI64::new(1),
            clock,
            journal: None,
            history: DEFAULT_COMMIT_HISTORY,
        }
    }

    /// Sets how many committed batches are retained for validation.
    ///
    /// A transaction whose snapshot predates the retained history cannot be
    /// validated and fails with a conflict.
    #[must_use]
    pub fn with_commit_history(mut self, batches: usize) -> Self {
        self.history = batches.max(1);
        self
    }

    pub(crate) fn attach_journal(&mut self, journal: Arc<dyn CommitJournal>) {
        self.journal = Some(journal);
    }

    /// Sequence number of the last committed batch.
    pub fn sequence(&self) -> Result<u64, StorageError> {
        Ok(self.state.read().map_err(|_| lock_err("contacts.sequence"))?.sequence)
    }

    /// Every committed row in id order, soft-deleted ones included.
    ///
    /// Ids burned by aborted transactions leave gaps, so `count()` is not an
    /// upper bound for ids.
    pub fn contacts(&self) -> Result<Vec<Contact>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("contacts.list"))?;
        Ok(state.table.contacts().cloned().collect())
    }

    /// Re-applies a recovered batch. Batches at or below the current sequence
    /// are skipped; returns whether the batch was applied.
    pub(crate) fn replay(&self, batch: CommitBatch) -> Result<bool, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("contacts.replay"))?;
        if batch.sequence <= state.sequence {
            return Ok(false);
        }
        for contact in &batch.contacts {
            self.reserve_past(contact.id);
        }
        state.install(batch, self.history);
        Ok(true)
    }

    /// Replaces the whole table, e.g. from a snapshot file.
    pub(crate) fn load(&self, sequence: u64, contacts: Vec<Contact>) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("contacts.load"))?;
        for contact in &contacts {
            self.reserve_past(contact.id);
        }
        state.table = Arc::new(ContactTable::from_contacts(contacts));
        state.sequence = sequence;
        state.commit_log.clear();
        Ok(())
    }

    /// Runs `f` against the committed table while holding off all commits.
    pub(crate) fn quiesced<R>(
        &self,
        f: impl FnOnce(&ContactTable, u64) -> R,
    ) -> Result<R, StorageError> {
        let state = self.state.write().map_err(|_| lock_err("contacts.quiesce"))?;
        Ok(f(&state.table, state.sequence))
    }

    fn reserve_past(&self, id: ContactId) {
        self.next_id.fetch_max(id.get().saturating_add(1), Ordering::SeqCst);
    }

    fn allocate_id(&self) -> ContactId {
        ContactId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn publish(&self, state: &mut TableState, contacts: Vec<Contact>) -> Result<u64, StorageError> {
        let batch = CommitBatch {
            sequence: state.sequence + 1,
            committed_at: self.clock.now(),
            contacts,
        };
        if let Some(journal) = &self.journal {
            journal.record(&batch)?;
        }
        let sequence = batch.sequence;
        state.install(batch, self.history);
        Ok(sequence)
    }
}

impl ContactStore for InMemoryContactStore {
    fn begin(&self) -> Result<Box<dyn ContactTransaction + '_>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("contacts.begin"))?;
        Ok(Box::new(MemoryTransaction {
            store: self,
            snapshot: Arc::clone(&state.table),
            snapshot_seq: state.sequence,
            writes: BTreeMap::new(),
            reads: ReadSet::default(),
        }))
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("contacts.get"))?;
        Ok(state.table.get(id).cloned())
    }

    fn count(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("contacts.count"))?;
        Ok(state.table.len())
    }

    fn import(&self, contacts: Vec<Contact>) -> Result<(), StorageError> {
        if contacts.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().map_err(|_| lock_err("contacts.import"))?;
        let mut seen = HashSet::with_capacity(contacts.len());
        for contact in &contacts {
            if state.table.get(contact.id).is_some() || !seen.insert(contact.id) {
                return Err(StorageError::DuplicateKey(format!("contact {}", contact.id)));
            }
        }
        for contact in &contacts {
            self.reserve_past(contact.id);
        }
        let count = contacts.len();
        let sequence = self.publish(&mut state, contacts)?;
        tracing::debug!(sequence, count, "imported contacts");
        Ok(())
    }
}

/// Predicates a transaction has read through.
#[derive(Debug, Default)]
struct ReadSet {
    emails: HashSet<String>,
    phones: HashSet<String>,
    ids: HashSet<ContactId>,
}

impl ReadSet {
    fn covers(&self, contact: &Contact) -> bool {
        contact.email.as_ref().is_some_and(|e| self.emails.contains(e))
            || contact.phone_number.as_ref().is_some_and(|p| self.phones.contains(p))
            || self.ids.contains(&contact.id)
            || contact.linked_id.is_some_and(|l| self.ids.contains(&l))
    }
}

struct MemoryTransaction<'a> {
    store: &'a InMemoryContactStore,
    snapshot: Arc<ContactTable>,
    snapshot_seq: u64,
    writes: BTreeMap<ContactId, Contact>,
    reads: ReadSet,
}

impl MemoryTransaction<'_> {
    fn visible(&self, id: ContactId) -> Option<&Contact> {
        self.writes
            .get(&id)
            .or_else(|| self.snapshot.get(id))
            .filter(|c| !c.is_deleted())
    }

    // Candidates come from the snapshot indexes; rows this transaction wrote
    // are always re-checked because their links may have moved.
    fn select(
        &self,
        mut candidates: BTreeSet<ContactId>,
        keep: impl Fn(&Contact) -> bool,
    ) -> Vec<Contact> {
        candidates.extend(self.writes.keys().copied());
        let mut out: Vec<Contact> = candidates
            .into_iter()
            .filter_map(|id| self.visible(id))
            .filter(|c| keep(c))
            .cloned()
            .collect();
        sort_chronologically(&mut out);
        out
    }

    fn require_primary(&mut self, id: ContactId, context: &str) -> Result<(), StorageError> {
        self.reads.ids.insert(id);
        match self.visible(id) {
            Some(target) if target.is_primary() => Ok(()),
            Some(_) => Err(StorageError::ConstraintViolation(format!(
                "{context}: contact {id} is not a primary"
            ))),
            None => Err(StorageError::ContactNotFound(id)),
        }
    }

    fn check_patch(&self, contact: &Contact, patch: &ContactPatch) -> Result<(), StorageError> {
        if patch.link_precedence.is_some_and(|p| p.is_primary()) && !contact.is_primary() {
            return Err(StorageError::ConstraintViolation(format!(
                "contact {} cannot be promoted back to primary",
                contact.id
            )));
        }
        if patch.linked_id == Some(contact.id) {
            return Err(StorageError::ConstraintViolation(format!(
                "contact {} cannot link to itself",
                contact.id
            )));
        }
        Ok(())
    }

    fn validate(&self, state: &TableState) -> Result<(), StorageError> {
        if state.sequence == self.snapshot_seq {
            return Ok(());
        }
        let oldest = state.commit_log.front().map(|c| c.sequence);
        if oldest.map_or(true, |s| s > self.snapshot_seq + 1) {
            return Err(StorageError::Conflict(format!(
                "snapshot at sequence {} predates retained commit history",
                self.snapshot_seq
            )));
        }

        for change in state.commit_log.iter().filter(|c| c.sequence > self.snapshot_seq) {
            for &id in &change.ids {
                if self.writes.contains_key(&id) {
                    return Err(StorageError::Conflict(format!(
                        "contact {id} was written by commit {}",
                        change.sequence
                    )));
                }
                let before = self.snapshot.get(id);
                let after = state.table.get(id);
                if before.is_some_and(|c| self.reads.covers(c))
                    || after.is_some_and(|c| self.reads.covers(c))
                {
                    return Err(StorageError::Conflict(format!(
                        "contact {id} changed under a read by commit {}",
                        change.sequence
                    )));
                }
            }
        }
        Ok(())
    }
}

impl ContactTransaction for MemoryTransaction<'_> {
    fn find_by_email_or_phone(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, StorageError> {
        if email.is_none() && phone_number.is_none() {
            return Ok(Vec::new());
        }

        let mut candidates = BTreeSet::new();
        if let Some(email) = email {
            self.reads.emails.insert(email.to_string());
            candidates.extend(self.snapshot.ids_with_email(email));
        }
        if let Some(phone) = phone_number {
            self.reads.phones.insert(phone.to_string());
            candidates.extend(self.snapshot.ids_with_phone(phone));
        }

        Ok(self.select(candidates, |c| {
            (email.is_some() && c.email.as_deref() == email)
                || (phone_number.is_some() && c.phone_number.as_deref() == phone_number)
        }))
    }

    fn find_by_roots_or_linked_to(
        &mut self,
        ids: &BTreeSet<ContactId>,
    ) -> Result<Vec<Contact>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut candidates = BTreeSet::new();
        for &id in ids {
            self.reads.ids.insert(id);
            candidates.insert(id);
            candidates.extend(self.snapshot.ids_linked_to(id));
        }

        Ok(self.select(candidates, |c| {
            ids.contains(&c.id) || c.linked_id.is_some_and(|l| ids.contains(&l))
        }))
    }

    fn create(&mut self, contact: NewContact) -> Result<Contact, StorageError> {
        match (contact.link_precedence.is_primary(), contact.linked_id) {
            (true, Some(linked)) => {
                return Err(StorageError::ConstraintViolation(format!(
                    "a primary cannot link to contact {linked}"
                )));
            }
            (false, None) => {
                return Err(StorageError::ConstraintViolation(
                    "a secondary must link to a primary".to_string(),
                ));
            }
            (false, Some(linked)) => self.require_primary(linked, "create")?,
            (true, None) => {}
        }

        let now = self.store.clock.now();
        let created = Contact {
            id: self.store.allocate_id(),
            email: contact.email,
            phone_number: contact.phone_number,
            linked_id: contact.linked_id,
            link_precedence: contact.link_precedence,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.writes.insert(created.id, created.clone());
        Ok(created)
    }

    fn update(&mut self, id: ContactId, patch: &ContactPatch) -> Result<Contact, StorageError> {
        self.reads.ids.insert(id);
        let mut contact = self
            .visible(id)
            .cloned()
            .ok_or(StorageError::ContactNotFound(id))?;
        self.check_patch(&contact, patch)?;
        if let Some(target) = patch.linked_id {
            self.require_primary(target, "update")?;
        }

        patch.apply(&mut contact);
        self.writes.insert(id, contact.clone());
        Ok(contact)
    }

    fn update_linked_to(
        &mut self,
        linked_id: ContactId,
        patch: &ContactPatch,
    ) -> Result<usize, StorageError> {
        self.reads.ids.insert(linked_id);
        if let Some(target) = patch.linked_id {
            self.require_primary(target, "update_linked_to")?;
        }

        let candidates = self.snapshot.ids_linked_to(linked_id).collect();
        let dependents = self.select(candidates, |c| c.linked_id == Some(linked_id));
        for mut contact in dependents.iter().cloned() {
            self.check_patch(&contact, patch)?;
            patch.apply(&mut contact);
            self.writes.insert(contact.id, contact);
        }
        Ok(dependents.len())
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        if self.writes.is_empty() {
            return Ok(());
        }

        let store = self.store;
        let mut state = store.state.write().map_err(|_| lock_err("contacts.commit"))?;
        if let Err(err) = self.validate(&state) {
            tracing::debug!(snapshot = self.snapshot_seq, head = state.sequence, %err, "commit rejected");
            return Err(err);
        }

        let MemoryTransaction { snapshot, writes, .. } = *self;
        // Release the snapshot so the table is only cloned when other
        // transactions still hold it.
        drop(snapshot);

        let count = writes.len();
        let sequence = store.publish(&mut state, writes.into_values().collect())?;
        tracing::debug!(sequence, count, "committed contact batch");
        Ok(())
    }
}
