//! Migration engine that relocates blob-store objects from the flat
//! `receipts/{item_id}/...` convention to the owner-scoped
//! `users/{owner_id}/receipts/{item_id}/...` convention while the store stays
//! live. The engine only talks to capability traits ([`store::ObjectStore`],
//! [`store::OwnerLookup`], [`store::PointerSink`]); hosts plug in their own
//! backends and drive runs through [`orchestrator::Orchestrator`].

pub mod backup;
pub mod discovery;
pub mod error;
pub mod keys;
pub mod logging;
pub mod orchestrator;
pub mod processor;
pub mod retry;
pub mod store;
pub mod tracker;
pub mod validate;

pub use error::{codes, AppError, AppResult};
pub use orchestrator::{Orchestrator, RunOptions, RunSummary};
pub use tracker::{ItemStatus, MigrationItem, MigrationRun, MigrationTracker, Progress, RunStatus};
