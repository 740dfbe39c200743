//! Shallow structural validation of raw message text.
//!
//! This is a deliberately syntactic check, not a conformance validator: no segment ordering
//! rules and no trigger-event specific required segments.

use crate::message::{detect_field_separator, split_segments};
use crate::{StructuralError, MIN_MSH_TOKENS, MIN_SEGMENTS};

/// Classifies raw message text as acceptable or rejected.
///
/// Rules are applied in order and the first failure wins:
/// 1. fewer than two segments: [`StructuralError::NotEnoughSegments`]
/// 2. first segment is not `MSH`: [`StructuralError::MissingMsh`]
/// 3. MSH has fewer than twelve tokens: [`StructuralError::MshTooShort`]
///
/// Works on text that may not parse as a [`crate::Message`] at all, which is what a hop
/// receives from the network.
pub fn validate(raw: &str) -> Result<(), StructuralError> {
    let segments = split_segments(raw);
    if segments.len() < MIN_SEGMENTS {
        return Err(StructuralError::NotEnoughSegments);
    }

    let first = segments[0];
    let separator = detect_field_separator(first);
    let mut tokens = first.split(separator);
    if tokens.next() != Some("MSH") {
        return Err(StructuralError::MissingMsh);
    }
    if tokens.count() + 1 < MIN_MSH_TOKENS {
        return Err(StructuralError::MshTooShort);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;

    const VALID: &str = "MSH|^~\\&|HIS|RIH|ADT|RIH|20230523102000||ADT^A01|CTRL123|P|2.4\rPID|1||123";

    #[test]
    fn test_valid_message() {
        assert_eq!(validate(VALID), Ok(()));
    }

    #[test]
    fn test_single_segment_is_rejected() {
        let msh_only = "MSH|^~\\&|HIS|RIH|ADT|RIH|20230523102000||ADT^A01|CTRL123|P|2.4";
        let err = validate(msh_only).unwrap_err();
        assert_eq!(err, StructuralError::NotEnoughSegments);
        assert_eq!(err.to_string(), "not enough segments");
    }

    #[test]
    fn test_blank_lines_do_not_count_as_segments() {
        let padded = "MSH|^~\\&|HIS|RIH|ADT|RIH|20230523102000||ADT^A01|CTRL123|P|2.4\r\n\r\n";
        assert_eq!(validate(padded), Err(StructuralError::NotEnoughSegments));
        assert_eq!(validate(""), Err(StructuralError::NotEnoughSegments));
    }

    #[test]
    fn test_missing_msh() {
        let err = validate("EVN|A01|20240101\rPID|1").unwrap_err();
        assert_eq!(err, StructuralError::MissingMsh);
        assert_eq!(err.to_string(), "missing MSH segment");
        assert_eq!(
            validate("PID|1\rMSH|^~\\&|A|B|C|D|E||ADT^A01|1|P|2.4"),
            Err(StructuralError::MissingMsh)
        );
    }

    #[test]
    fn test_msh_with_eleven_tokens_is_too_short() {
        let eleven = "MSH|^~\\&|HIS|RIH|ADT|RIH|20230523102000||ADT^A01|CTRL123|P\rPID|1";
        let err = validate(eleven).unwrap_err();
        assert_eq!(err, StructuralError::MshTooShort);
        assert_eq!(err.to_string(), "MSH segment does not contain enough fields");
    }

    #[test]
    fn test_twelve_tokens_with_empty_fields_is_enough() {
        assert_eq!(validate("MSH|||||||||||\rZZZ"), Ok(()));
    }

    #[test]
    fn test_raw_and_parsed_validation_agree() {
        let cases = [
            VALID,
            "MSH|^~\\&|HIS|RIH|ADT|RIH|20230523102000||ADT^A01|CTRL123|P|2.4",
            "EVN|A01\rPID|1",
            "MSH|^~\\&|A|B\rPID|1",
        ];
        for raw in cases {
            let parsed = Message::parse(raw).unwrap();
            assert_eq!(validate(raw), parsed.validate(), "case: {raw:?}");
        }
    }
}
