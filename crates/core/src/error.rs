/// Errors raised by a record collaborator.
///
/// The workflow never propagates these; each one is mapped to an [`crate::Outcome`] for the
/// stage that raised it.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("failed to read record: {0}")]
    FileRead(std::io::Error),
    #[error("failed to write record: {0}")]
    FileWrite(std::io::Error),
    #[error("failed to serialize record: {0}")]
    Serialization(serde_json::Error),
    #[error("failed to deserialize record: {0}")]
    Deserialization(serde_json::Error),
    #[error("HL7 error: {0}")]
    Hl7(#[from] relay_hl7::Hl7Error),
}

pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("folder store error: {0}")]
    Files(#[from] relay_files::FilesError),
    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),
}

pub type WorkflowResult<T> = std::result::Result<T, WorkflowError>;
