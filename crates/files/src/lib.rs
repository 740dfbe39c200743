//! Relay File Storage
//!
//! This crate provides the durable, file-per-unit-of-work storage used by the relay.
//!
//! ## Design Principles
//!
//! - Directory membership *is* the processing state of a unit of work
//! - The only mutation primitive is a rename between directories on one volume
//! - A rename is atomic for any concurrent observer: a unit is never in two folders at once
//! - Claiming a unit is itself a rename, so two workers can never hold the same unit
//! - Destination folders are created on demand and nothing is ever overwritten
//!
//! ## Layout
//!
//! ```text
//! <root>/
//! ├── Work/               # intake for generated documents
//! ├── Import/             # intake for externally dropped documents and messages
//! ├── UploadedPatients/   # documents that were forwarded and persisted
//! ├── FailedPatients/     # documents that failed at any stage
//! ├── HL7gen/             # generated outbound messages awaiting dispatch
//! ├── SentHL7/            # messages acknowledged by every hop
//! ├── UnsentHL7/          # messages that failed at any stage
//! └── Processing/         # claimed units, one subfolder per source
//!     └── Work/
//!         └── patient.json
//! ```
//!
//! Raw payloads received by transport hops are kept separately by [`ScratchStore`] so a crash
//! mid-processing leaves recoverable evidence.
//!
//! ## Example Usage
//!
//! ```no_run
//! use relay_files::{Folder, PipelineStore};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PipelineStore::new(Path::new("relay_data"))?;
//! for name in store.list(Folder::Work, Some("json"))? {
//!     if let Some(unit) = store.claim(Folder::Work, &name)? {
//!         let _contents = unit.read_to_string()?;
//!         store.place(unit, Folder::Uploaded)?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod constants;
mod scratch;
mod store;

pub use constants::*;
pub use relay_types::ArtifactName;
pub use scratch::{ScratchRecord, ScratchStore};
pub use store::{ClaimSource, ClaimedUnit, Folder, PipelineStore};

/// Errors that can occur during folder store operations
#[derive(Debug, thiserror::Error)]
pub enum FilesError {
    /// Root directory exists but is not a directory, or cannot be created
    #[error("Invalid root directory: {0}")]
    InvalidRootDirectory(String),

    /// A file name is not usable as a unit of work name
    #[error("Invalid artifact name: {0}")]
    InvalidName(#[from] relay_types::TextError),

    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for Results that can fail with a [`FilesError`].
pub type FilesResult<T> = Result<T, FilesError>;

/// Wraps an I/O error with the operation and path that produced it.
pub(crate) fn io_context(e: std::io::Error, what: impl std::fmt::Display) -> FilesError {
    FilesError::Io(std::io::Error::new(e.kind(), format!("{}: {}", what, e)))
}
