//! Acknowledgment generation.
//!
//! An acknowledgment is derived from the inbound message alone; it says nothing about what any
//! downstream hop later does with the message. Apart from the embedded timestamp the output is
//! a pure function of the input, see [`generate_ack_at`].

use crate::{AckError, Encoding, Message, Segment, DEFAULT_PROCESSING_ID, DEFAULT_VERSION};
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// MSA-1 acknowledgment code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckCode {
    /// Application accept.
    Accept,
    /// Application error.
    Error,
    /// Application reject.
    Reject,
}

impl AckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckCode::Accept => "AA",
            AckCode::Error => "AE",
            AckCode::Reject => "AR",
        }
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckCode {
    type Err = AckError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AA" => Ok(AckCode::Accept),
            "AE" => Ok(AckCode::Error),
            "AR" => Ok(AckCode::Reject),
            other => Err(AckError::UnknownCode(other.to_owned())),
        }
    }
}

/// A two-segment `MSH` + `MSA` message correlated to an inbound message by control id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgment {
    message: Message,
    code: AckCode,
    /// Position of the MSA segment in `message`.
    msa: usize,
}

impl Acknowledgment {
    pub fn code(&self) -> AckCode {
        self.code
    }

    pub fn is_accept(&self) -> bool {
        self.code == AckCode::Accept
    }

    /// MSA-2, the echoed control id of the acknowledged message.
    pub fn control_id(&self) -> &str {
        self.msa().field(2).unwrap_or_default()
    }

    /// MSA-3, present only on negative acknowledgments that carry a reason.
    pub fn error_detail(&self) -> Option<&str> {
        self.msa().field(3)
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    fn msa(&self) -> &Segment {
        &self.message.segments()[self.msa]
    }
}

impl TryFrom<Message> for Acknowledgment {
    type Error = AckError;

    /// Interprets a received message as an acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns `AckError::MissingMsh`/`AckError::MissingMsa` when either segment is absent and
    /// `AckError::UnknownCode` when MSA-1 is not one of `AA`, `AE`, `AR`.
    fn try_from(message: Message) -> Result<Self, Self::Error> {
        if message.msh().is_none() {
            return Err(AckError::MissingMsh);
        }
        let msa = message
            .segments()
            .iter()
            .position(|s| s.kind() == "MSA")
            .ok_or(AckError::MissingMsa)?;
        let code = message.segments()[msa].field(1).unwrap_or_default().parse()?;
        Ok(Self { message, code, msa })
    }
}

impl fmt::Display for Acknowledgment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.message, f)
    }
}

/// Generates an acknowledgment for `message`, stamped with the current UTC time.
///
/// See [`generate_ack_at`] for the construction rules.
///
/// # Errors
///
/// Returns `AckError::MissingMsh` or `AckError::MissingControlId` when the inbound MSH is too
/// short to correlate a reply. This is a caller error, not a data condition.
pub fn generate_ack(
    message: &Message,
    code: AckCode,
    error_detail: Option<&str>,
) -> Result<Acknowledgment, AckError> {
    generate_ack_at(message, code, error_detail, Utc::now())
}

/// Generates an acknowledgment for `message` with an explicit timestamp.
///
/// The new MSH reverses the roles of the inbound message: the inbound receiving
/// application/facility (MSH-5/6) become the sender (MSH-3/4) and vice versa. The message type is
/// `ACK`, the control id is echoed, MSH-11/12 are echoed with defaults when absent. The MSA
/// carries `code`, the control id and, for any code other than `AA`, the escaped
/// `error_detail` when one is supplied.
///
/// # Arguments
///
/// * `message` - The inbound message being acknowledged
/// * `code` - MSA-1 acknowledgment code
/// * `error_detail` - Optional reason text for negative acknowledgments
/// * `at` - Timestamp written to MSH-7
///
/// # Errors
///
/// Same as [`generate_ack`].
pub fn generate_ack_at(
    message: &Message,
    code: AckCode,
    error_detail: Option<&str>,
    at: DateTime<Utc>,
) -> Result<Acknowledgment, AckError> {
    let control_id = message.require_control_id()?.to_owned();
    let msh = message.msh().ok_or(AckError::MissingMsh)?;
    let field = |n: usize| msh.field(n).unwrap_or_default().to_owned();
    let non_empty_or = |n: usize, default: &str| {
        msh.field(n)
            .filter(|v| !v.is_empty())
            .unwrap_or(default)
            .to_owned()
    };

    let encoding: Encoding = *message.encoding();
    let ack_msh = Segment::msh(
        &encoding,
        vec![
            field(5),
            field(6),
            field(3),
            field(4),
            at.format("%Y%m%d%H%M%S").to_string(),
            String::new(),
            "ACK".into(),
            control_id.clone(),
            non_empty_or(11, DEFAULT_PROCESSING_ID),
            non_empty_or(12, DEFAULT_VERSION),
        ],
    );

    let mut msa_fields = vec![code.as_str().to_owned(), control_id];
    if code != AckCode::Accept {
        if let Some(detail) = error_detail.filter(|d| !d.trim().is_empty()) {
            msa_fields.push(encoding.escape_text(detail));
        }
    }
    let msa = Segment {
        kind: "MSA".into(),
        fields: msa_fields,
    };

    // Fields are copied from a parsed MSH or escaped.
    let message = Message {
        encoding,
        segments: vec![ack_msh, msa],
    };
    Ok(Acknowledgment {
        message,
        code,
        msa: 1,
    })
}
