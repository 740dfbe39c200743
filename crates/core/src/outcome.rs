//! Result of running one unit of work through a pipeline.

use std::fmt;

/// How a pipeline stage ended.
///
/// The workflow switches on this to choose a terminal folder: only [`Outcome::Ok`] routes to the
/// success folder. Every other variant carries the detail that is logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    /// The document or message is malformed or could not be turned into a record or message.
    StructuralInvalid(String),
    /// The record is too large for the persistence store.
    SizeExceeded(String),
    /// The record already exists.
    Conflict(String),
    /// A downstream hop or the persistence store answered with a non-success status.
    DownstreamRejected(u16),
    /// The message type has no update handler, or the file type has no pipeline.
    Unsupported(String),
    /// No usable answer from a hop or the collaborator: connect failure, timeout, decode error.
    TransportError(String),
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok)
    }

    /// Short, stable name of the variant.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Ok => "Ok",
            Outcome::StructuralInvalid(_) => "StructuralInvalid",
            Outcome::SizeExceeded(_) => "SizeExceeded",
            Outcome::Conflict(_) => "Conflict",
            Outcome::DownstreamRejected(_) => "DownstreamRejected",
            Outcome::Unsupported(_) => "Unsupported",
            Outcome::TransportError(_) => "TransportError",
        }
    }

    /// Detail text for negative acknowledgments and logs.
    pub fn detail(&self) -> Option<String> {
        match self {
            Outcome::Ok => None,
            Outcome::DownstreamRejected(status) => {
                Some(format!("downstream rejected with status {}", status))
            }
            Outcome::StructuralInvalid(d)
            | Outcome::SizeExceeded(d)
            | Outcome::Conflict(d)
            | Outcome::Unsupported(d)
            | Outcome::TransportError(d) => Some(d.clone()),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.detail() {
            Some(detail) => write!(f, "{}: {}", self.label(), detail),
            None => f.write_str(self.label()),
        }
    }
}
