//! # contact-reconcile
//!
//! Identity reconciliation for customer contact records. Purchases arrive
//! with an email, a phone number, or both; this crate links every record
//! sharing either identifier into one identity group with a single primary
//! contact and answers with the consolidated view of that group.
//!
//! ## Core Concepts
//!
//! - **Contact**: one stored record; either the group's `primary` or a
//!   `secondary` pointing straight at it
//! - **Identity group**: a primary plus every record linked to it
//! - **Merge**: when a request bridges two groups, the older primary wins and
//!   the other group is re-pointed at it
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use contact_reconcile::{IdentifyRequest, InMemoryContactStore, ReconcileEngine};
//!
//! let engine = ReconcileEngine::new(Arc::new(InMemoryContactStore::new()));
//! let request = IdentifyRequest::builder()
//!     .email("doc@fluxkart.com")
//!     .phone_number("999999")
//!     .build()?;
//!
//! let response = engine.identify(&request)?;
//! assert_eq!(response.contact.emails, vec!["doc@fluxkart.com"]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod clock;
pub mod config;
pub mod contact;
pub mod error;
pub mod request;

// Storage and the reconciliation pipeline
pub mod engine;
pub mod storage;

pub mod seed;

#[cfg(feature = "transport-http")]
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig, RetryPolicy, ServerConfig};
pub use contact::{Contact, ContactId, ContactPatch, LinkPrecedence, NewContact};
pub use engine::runtime::{IdentifyHandle, ReconcileRuntime, ReconcileRuntimeConfig};
pub use engine::{
    IdentifyResponse, IdentityView, MergeReport, ReconcileEngine, Reconciliation,
    SecondaryDecision,
};
pub use error::{
    ExecutionError, InvariantViolation, ReconcileError, ReconcileResult, ValidationError,
};
pub use request::{IdentifyRequest, IdentifyRequestBuilder, PhoneNumberInput};
pub use storage::{ContactStore, ContactTransaction, InMemoryContactStore, StorageError};
