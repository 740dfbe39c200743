//! The seam between the workflow and the record persistence system.
//!
//! The workflow knows nothing about how documents are parsed or how records are stored. It calls
//! a [`RecordCollaborator`], passed in as `Arc<C>`, and maps every answer or failure onto an
//! [`crate::Outcome`].

use crate::CollaboratorResult;
use async_trait::async_trait;
use relay_hl7::{Message, MessageType};
use std::fmt;

/// Message kinds the relay builds or dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// `ADT^A01`, admit/visit notification, built for every uploaded document.
    AdtA01,
    /// `ORM^O01`, order message.
    OrmO01,
    /// `ORU^R01`, unsolicited observation result.
    OruR01,
}

impl MessageKind {
    pub fn code(&self) -> &'static str {
        match self {
            MessageKind::AdtA01 => "ADT",
            MessageKind::OrmO01 => "ORM",
            MessageKind::OruR01 => "ORU",
        }
    }

    pub fn trigger(&self) -> &'static str {
        match self {
            MessageKind::AdtA01 => "A01",
            MessageKind::OrmO01 => "O01",
            MessageKind::OruR01 => "R01",
        }
    }

    /// Maps MSH-9 onto a known kind; anything else is `None`.
    pub fn from_message_type(message_type: &MessageType) -> Option<Self> {
        [MessageKind::AdtA01, MessageKind::OrmO01, MessageKind::OruR01]
            .into_iter()
            .find(|kind| message_type.is(kind.code(), kind.trigger()))
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}^{}", self.code(), self.trigger())
    }
}

/// Everything the workflow needs from the record system.
///
/// Status-returning methods answer with an HTTP-style code: `200` means the change was applied,
/// anything else is a rejection the workflow reports as `DownstreamRejected`. An `Err` means no
/// usable answer was obtained.
#[async_trait]
pub trait RecordCollaborator: Send + Sync {
    /// The collaborator's in-memory form of a patient record.
    type Record: Send + Sync;

    /// Parses an inbound document into a record.
    async fn parse(&self, document: &str) -> CollaboratorResult<Self::Record>;

    /// Whether the record is small enough to be stored.
    async fn size_ok(&self, record: &Self::Record) -> CollaboratorResult<bool>;

    /// Whether a record with the same identity is already stored.
    async fn exists(&self, record: &Self::Record) -> CollaboratorResult<bool>;

    /// Stores the record. With `is_update` false an existing record is not replaced.
    async fn persist(&self, record: &Self::Record, is_update: bool) -> CollaboratorResult<u16>;

    /// Builds the outbound message announcing `record`.
    async fn build_outbound_message(
        &self,
        record: &Self::Record,
        kind: MessageKind,
    ) -> CollaboratorResult<Message>;

    /// Extracts a record from a received message.
    async fn record_from_message(&self, message: &Message) -> CollaboratorResult<Self::Record>;

    /// Applies the order carried by an `ORM^O01` to the stored record.
    async fn update_following_order(&self, record: &Self::Record) -> CollaboratorResult<u16>;

    /// Applies the results carried by an `ORU^R01` to the stored record.
    async fn update_following_result(&self, record: &Self::Record) -> CollaboratorResult<u16>;
}
