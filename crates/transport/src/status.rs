//! Mapping hop replies to a status code.

use relay_hl7::{Acknowledgment, Message};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of one hop, as an HTTP-style status code.
///
/// Only [`HopStatus::OK`] is success. Used for branching, not for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HopStatus(pub u16);

impl HopStatus {
    pub const OK: HopStatus = HopStatus(200);
    pub const FAILURE: HopStatus = HopStatus(400);

    pub fn code(&self) -> u16 {
        self.0
    }

    pub fn is_success(&self) -> bool {
        *self == Self::OK
    }

    /// Interprets the raw reply of any hop.
    ///
    /// | Reply | Status |
    /// |---|---|
    /// | empty | 400 |
    /// | a number, e.g. `"200"` | that number |
    /// | an HL7 ACK | 200 iff MSA-1 is `AA` |
    /// | JSON with a `status` field | that status |
    /// | relay JSON (`ack` + `downstream`) | 200 iff the ack is `AA` and `downstream` maps to 200 |
    /// | anything else | 400 |
    pub fn from_reply(reply: &str) -> HopStatus {
        let reply = reply.trim();
        if reply.is_empty() {
            return Self::FAILURE;
        }
        if let Ok(code) = reply.parse::<u16>() {
            return HopStatus(code);
        }
        if reply.starts_with("MSH") {
            return Self::from_ack(reply);
        }

        let Ok(value) = serde_json::from_str::<serde_json::Value>(reply) else {
            return Self::FAILURE;
        };
        if let Some(status) = value.get("status") {
            return status_value(status).unwrap_or(Self::FAILURE);
        }
        match serde_json::from_value::<RelayReply>(value) {
            Ok(relay) => relay.status(),
            Err(_) => Self::FAILURE,
        }
    }

    fn from_ack(reply: &str) -> HopStatus {
        let accepted = Message::parse(reply)
            .ok()
            .and_then(|m| Acknowledgment::try_from(m).ok())
            .is_some_and(|ack| ack.is_accept());
        if accepted {
            Self::OK
        } else {
            Self::FAILURE
        }
    }
}

fn status_value(value: &serde_json::Value) -> Option<HopStatus> {
    let code = match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    code.map(HopStatus)
}

impl fmt::Display for HopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reply of a relay hop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayReply {
    /// The relay's own acknowledgment of the inbound message, in wire form.
    pub ack: String,
    /// Raw reply of the next hop, absent when the message was not forwarded.
    #[serde(default)]
    pub downstream: Option<String>,
    /// Why the message was not forwarded, or why forwarding failed.
    #[serde(default)]
    pub error: Option<String>,
}

impl RelayReply {
    /// 200 iff this relay accepted the message and everything after it succeeded.
    pub fn status(&self) -> HopStatus {
        if !HopStatus::from_ack(&self.ack).is_success() {
            return HopStatus::FAILURE;
        }
        match &self.downstream {
            Some(downstream) => HopStatus::from_reply(downstream),
            None => HopStatus::FAILURE,
        }
    }

    pub fn to_json(&self) -> String {
        // Plain string fields always serialise.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_hl7::{generate_ack, AckCode};

    const ADT: &str = "MSH|^~\\&|HIS|RIH|ADT|RIH|20230523102000||ADT^A01|CTRL123|P|2.4\rPID|1";

    fn ack(code: AckCode) -> String {
        let message = Message::parse(ADT).unwrap();
        generate_ack(&message, code, Some("reason")).unwrap().to_string()
    }

    #[test]
    fn test_numeric_and_empty_replies() {
        assert_eq!(HopStatus::from_reply("200"), HopStatus::OK);
        assert_eq!(HopStatus::from_reply(" 400\n"), HopStatus::FAILURE);
        assert_eq!(HopStatus::from_reply("503"), HopStatus(503));
        assert_eq!(HopStatus::from_reply(""), HopStatus::FAILURE);
        assert_eq!(HopStatus::from_reply("   "), HopStatus::FAILURE);
    }

    #[test]
    fn test_ack_replies() {
        assert_eq!(HopStatus::from_reply(&ack(AckCode::Accept)), HopStatus::OK);
        assert_eq!(HopStatus::from_reply(&ack(AckCode::Error)), HopStatus::FAILURE);
        assert_eq!(HopStatus::from_reply(&ack(AckCode::Reject)), HopStatus::FAILURE);
        assert_eq!(HopStatus::from_reply(ADT), HopStatus::FAILURE);
    }

    #[test]
    fn test_json_status_replies() {
        assert_eq!(HopStatus::from_reply(r#"{"status": 200}"#), HopStatus::OK);
        assert_eq!(HopStatus::from_reply(r#"{"status": "200"}"#), HopStatus::OK);
        assert_eq!(
            HopStatus::from_reply(r#"{"status": 422, "data": "x"}"#),
            HopStatus(422)
        );
        assert_eq!(HopStatus::from_reply(r#"{"status": null}"#), HopStatus::FAILURE);
        assert_eq!(HopStatus::from_reply(r#"{"other": 1}"#), HopStatus::FAILURE);
    }

    #[test]
    fn test_relay_replies_compose() {
        let terminal = RelayReply {
            ack: ack(AckCode::Accept),
            downstream: Some("200".into()),
            error: None,
        };
        assert_eq!(HopStatus::from_reply(&terminal.to_json()), HopStatus::OK);

        let chained = RelayReply {
            ack: ack(AckCode::Accept),
            downstream: Some(terminal.to_json()),
            error: None,
        };
        assert_eq!(HopStatus::from_reply(&chained.to_json()), HopStatus::OK);

        let rejected_far_away = RelayReply {
            ack: ack(AckCode::Accept),
            downstream: Some(
                RelayReply {
                    ack: ack(AckCode::Accept),
                    downstream: Some("400".into()),
                    error: None,
                }
                .to_json(),
            ),
            error: None,
        };
        assert_eq!(
            HopStatus::from_reply(&rejected_far_away.to_json()),
            HopStatus::FAILURE
        );
    }

    #[test]
    fn test_relay_without_downstream_or_with_negative_ack_fails() {
        let unreachable = RelayReply {
            ack: ack(AckCode::Accept),
            downstream: None,
            error: Some("connection refused".into()),
        };
        assert_eq!(unreachable.status(), HopStatus::FAILURE);

        let invalid = RelayReply {
            ack: ack(AckCode::Error),
            downstream: Some("200".into()),
            error: None,
        };
        assert_eq!(invalid.status(), HopStatus::FAILURE);
    }

    #[test]
    fn test_garbage_is_failure() {
        assert_eq!(HopStatus::from_reply("Error processing message"), HopStatus::FAILURE);
        assert_eq!(HopStatus::from_reply("{not json"), HopStatus::FAILURE);
        assert!(!HopStatus(201).is_success());
    }
}
