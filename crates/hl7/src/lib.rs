//! # Relay HL7
//!
//! HL7v2 message handling for the relay.
//!
//! This crate contains the protocol half of the system and nothing else:
//! - an immutable message model ([`Message`], [`Segment`], [`Encoding`]) with exact
//!   parse/serialise behaviour
//! - the shallow structural validator ([`validate`])
//! - the acknowledgment generator ([`generate_ack`])
//! - a plain-text rendering used for diagnostics
//!
//! **No transport or storage concerns**: framing, TLS and folders live in `relay-transport` and
//! `relay-files`.
//!
//! ## Wire form
//!
//! A message on the wire is each segment rendered with the message's own field separator,
//! segments joined by a carriage return, with no trailing delimiter:
//!
//! ```text
//! MSH|^~\&|HIS|RIH|ADT|RIH|20230523102000||ADT^A31|123456|P|2.4\rEVN|A31|20230523102000
//! ```

mod ack;
mod message;
pub mod plain_text;
mod validate;

pub use ack::{generate_ack, generate_ack_at, AckCode, Acknowledgment};
pub use message::{Encoding, Message, MessageType, Segment};
pub use validate::validate;

/// Segment delimiter used when serialising a message.
pub const SEGMENT_DELIMITER: char = '\r';

/// Minimum number of segments in a well-formed message.
pub const MIN_SEGMENTS: usize = 2;

/// Minimum number of `|`-delimited tokens in the MSH segment, segment tag included.
pub const MIN_MSH_TOKENS: usize = 12;

/// Version id used in acknowledgments when the inbound MSH-12 is absent.
pub const DEFAULT_VERSION: &str = "2.4";

/// Processing id used in acknowledgments when the inbound MSH-11 is absent.
pub const DEFAULT_PROCESSING_ID: &str = "P";

/// Structural reasons a message is rejected by [`validate`].
///
/// The display strings are the rejection reasons carried in negative acknowledgments.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StructuralError {
    #[error("not enough segments")]
    NotEnoughSegments,
    #[error("missing MSH segment")]
    MissingMsh,
    #[error("MSH segment does not contain enough fields")]
    MshTooShort,
}

/// Errors raised while constructing or parsing messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Hl7Error {
    #[error("message is empty")]
    Empty,
    #[error("invalid segment: {0}")]
    InvalidSegment(String),
    #[error("invalid encoding characters: {0}")]
    InvalidEncoding(String),
    #[error("{segment} field {index} contains a delimiter: {value:?}")]
    DelimiterInField {
        segment: String,
        index: usize,
        value: String,
    },
}

/// Errors raised by the acknowledgment generator and by [`Acknowledgment::try_from`].
///
/// These are caller errors: the inbound message does not carry what an acknowledgment needs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AckError {
    #[error("message has no MSH segment")]
    MissingMsh,
    #[error("invalid MSH segment: not enough fields to extract message control ID")]
    MissingControlId,
    #[error("acknowledgment has no MSA segment")]
    MissingMsa,
    #[error("unknown acknowledgment code: {0}")]
    UnknownCode(String),
}

/// Type alias for Results that can fail with an [`Hl7Error`].
pub type Hl7Result<T> = Result<T, Hl7Error>;
