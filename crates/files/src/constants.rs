//! Folder names used by the pipeline store.
//!
//! Names are part of the on-disk contract with external producers (generators drop files into
//! `Work` and `Import`) and must not change.

/// Intake folder for locally generated documents.
pub const WORK_DIR_NAME: &str = "Work";

/// Intake folder for externally dropped documents and messages.
pub const IMPORT_DIR_NAME: &str = "Import";

/// Terminal folder for documents that were forwarded and persisted.
pub const UPLOADED_DIR_NAME: &str = "UploadedPatients";

/// Terminal folder for documents that failed at any stage.
pub const FAILED_DIR_NAME: &str = "FailedPatients";

/// Folder for generated outbound messages awaiting dispatch.
pub const GENERATED_DIR_NAME: &str = "HL7gen";

/// Terminal folder for messages acknowledged by every hop.
pub const SENT_DIR_NAME: &str = "SentHL7";

/// Terminal folder for messages that failed at any stage.
pub const UNSENT_DIR_NAME: &str = "UnsentHL7";

/// Folder holding claimed units, one subfolder per source folder.
pub const CLAIMS_DIR_NAME: &str = "Processing";

/// Claim subfolder for units claimed from outside the store (manual single-file operations).
pub const EXTERNAL_CLAIMS_DIR_NAME: &str = "External";

/// Default scratch folder for raw payloads received by transport hops.
pub const DEFAULT_SCRATCH_DIR_NAME: &str = "Scratch";
