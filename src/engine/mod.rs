//! Reconciliation engine.
//!
//! [`ReconcileEngine::identify`] runs the full pipeline for one request inside
//! a single repository transaction:
//!
//! ```text
//! match ──► expand ──► (merge ──► re-match ──► re-expand) ──► decide ──► (create) ──► respond
//! ```
//!
//! A serialization conflict anywhere in the pipeline, including at commit,
//! discards the transaction and restarts from the top under the configured
//! [`RetryPolicy`](crate::config::RetryPolicy).

pub mod group;
pub mod matching;
pub mod merge;
pub mod policy;
pub mod response;

/// Bounded worker runtime for identify requests.
pub mod runtime;

use std::sync::Arc;
use std::thread;

use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, RetryPolicy};
use crate::contact::{Contact, NewContact};
use crate::error::{ExecutionError, InvariantViolation, ReconcileResult};
use crate::request::IdentifyRequest;
use crate::storage::{ContactStore, ContactTransaction};

pub use group::expand_group;
pub use matching::find_matches;
pub use merge::{merge_primaries, MergeReport};
pub use policy::{decide, SecondaryDecision};
pub use response::{build_response, IdentifyResponse, IdentityView};

/// The result of one identify call, with what it changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// The consolidated view returned to the caller.
    pub response: IdentifyResponse,
    /// The contact created by this call, if any.
    pub created: Option<Contact>,
    /// The merge performed by this call, if any.
    pub merge: Option<MergeReport>,
    /// The secondary-record decision; `None` when a new primary was created.
    pub decision: Option<SecondaryDecision>,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// Synchronous identify executor over a pluggable contact store.
#[derive(Clone)]
pub struct ReconcileEngine {
    store: Arc<dyn ContactStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl ReconcileEngine {
    /// Creates an engine with default settings.
    pub fn new(store: Arc<dyn ContactStore>) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    /// Creates an engine with explicit settings.
    pub fn with_config(store: Arc<dyn ContactStore>, config: EngineConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            retry: config.retry,
        }
    }

    /// Replaces the clock used for merge timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ContactStore> {
        &self.store
    }

    /// Reconciles the request and returns the consolidated identity.
    ///
    /// # Errors
    /// - `Invariant` if the stored group is malformed
    /// - `Execution(ContentionExhausted)` if every attempt lost a race
    /// - `Storage` for any other repository failure
    pub fn identify(&self, request: &IdentifyRequest) -> ReconcileResult<IdentifyResponse> {
        self.identify_detailed(request).map(|r| r.response)
    }

    /// Like [`identify`](Self::identify), also reporting what changed.
    ///
    /// # Errors
    /// Same as [`identify`](Self::identify).
    pub fn identify_detailed(&self, request: &IdentifyRequest) -> ReconcileResult<Reconciliation> {
        let span = tracing::info_span!(
            "identify",
            has_email = request.email().is_some(),
            has_phone = request.phone_number().is_some(),
        );
        let _guard = span.enter();

        let mut attempt = 1;
        loop {
            match self.attempt(request) {
                Ok(mut outcome) => {
                    outcome.attempts = attempt;
                    return Ok(outcome);
                }
                Err(err) if err.is_conflict() => {
                    if !self.retry.should_retry(attempt) {
                        tracing::warn!(attempts = attempt, %err, "giving up after repeated conflicts");
                        return Err(ExecutionError::ContentionExhausted { attempts: attempt }.into());
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    tracing::debug!(attempt, delay_us = delay.as_micros(), %err, "conflict, retrying");
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_invariant() {
                        tracing::error!(%err, "identity group invariant violated");
                    }
                    return Err(err);
                }
            }
        }
    }

    fn attempt(&self, request: &IdentifyRequest) -> ReconcileResult<Reconciliation> {
        let mut tx = self.store.begin()?;
        let outcome = self.reconcile(tx.as_mut(), request)?;
        tx.commit()?;
        Ok(outcome)
    }

    fn reconcile(
        &self,
        tx: &mut dyn ContactTransaction,
        request: &IdentifyRequest,
    ) -> ReconcileResult<Reconciliation> {
        let email = request.email();
        let phone = request.phone_number();

        let matches = find_matches(tx, email, phone)?;
        if matches.is_empty() {
            let created = tx.create(NewContact::primary(
                email.map(str::to_owned),
                phone.map(str::to_owned),
            ))?;
            tracing::info!(contact_id = %created.id, "created primary contact");
            let response = build_response(std::slice::from_ref(&created))?;
            return Ok(Reconciliation {
                response,
                created: Some(created),
                merge: None,
                decision: None,
                attempts: 1,
            });
        }

        let mut group = expand_group(tx, &matches)?;

        let merge = merge_primaries(tx, &group, self.clock.now())?;
        if let Some(report) = &merge {
            tracing::info!(
                canonical = %report.canonical,
                demoted = ?report.demoted,
                relinked = report.relinked,
                "merged identity groups"
            );
            let matches = find_matches(tx, email, phone)?;
            group = expand_group(tx, &matches)?;
            let primaries: Vec<_> = group.iter().filter(|c| c.is_primary()).map(|c| c.id).collect();
            if primaries.len() > 1 {
                return Err(InvariantViolation::MultiplePrimaries { primaries }.into());
            }
        }

        let decision = decide(&group, email, phone);
        let created = if decision.creates_record() {
            let primary = response::single_primary(&group)?.id;
            let contact = tx.create(NewContact::secondary(
                email.map(str::to_owned),
                phone.map(str::to_owned),
                primary,
            ))?;
            tracing::info!(contact_id = %contact.id, primary = %primary, "created secondary contact");
            group.push(contact.clone());
            Some(contact)
        } else {
            tracing::debug!(?decision, members = group.len(), "no new contact");
            None
        };

        let response = build_response(&group)?;
        Ok(Reconciliation {
            response,
            created,
            merge,
            decision: Some(decision),
            attempts: 1,
        })
    }
}
