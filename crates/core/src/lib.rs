//! # Relay Core
//!
//! Workflow logic for the HL7 relay.
//!
//! This crate contains the ingestion workflow and everything it is configured with:
//! - [`Pipeline`]: batch and single-file operations over the pipeline folders
//! - [`RecordCollaborator`]: the narrow seam to the record persistence system
//! - [`LocalRecordStore`]: a filesystem-backed collaborator with sharded JSON storage
//! - [`RelayConfig`]: runtime configuration, resolved once at startup
//!
//! **No transport or API concerns**: sockets, TLS and framing live in `relay-transport`; HTTP
//! servers belong in `api-rest`.

pub mod collaborator;
pub mod config;
pub mod constants;
mod error;
mod outcome;
pub mod store;
mod workflow;

pub use collaborator::{MessageKind, RecordCollaborator};
pub use config::{Endpoints, ForwardMode, RelayConfig, Timing};
pub use error::{CollaboratorError, CollaboratorResult, WorkflowError, WorkflowResult};
pub use outcome::Outcome;
pub use store::{LocalRecordStore, PatientRecord};
pub use workflow::{BatchReport, DocumentIntake, DocumentReport, Pipeline};
