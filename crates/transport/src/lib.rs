//! Relay Transport
//!
//! Moves HL7 messages between hops and turns each hop's reply into a [`HopStatus`].
//!
//! ## Bindings
//!
//! - [`TcpHop`]: one MLLP-framed request/response exchange per connection over mutual TLS.
//!   Both sides present certificates issued by the same private CA.
//! - [`HttpHop`]: a `text/plain` POST whose JSON reply carries a `status`.
//!
//! ## Hop roles
//!
//! [`HopServer`] accepts TCP connections and answers according to its [`HopRole`]:
//!
//! ```text
//! producer ──► Relay ──► Relay ──► Terminal
//!           ◄── {"ack", "downstream"} ◄── ... ◄── "200"
//! ```
//!
//! Every hop records the raw payload in its scratch store before doing anything else, and always
//! replies to its caller once a payload has been read.

mod framing;
mod http;
mod server;
mod status;
mod tcp;
mod tls;

pub use framing::{read_frame, write_frame, DEFAULT_MAX_FRAME_BYTES};
pub use http::HttpHop;
pub use server::{HopRole, HopServer, HopServerConfig};
pub use status::{HopStatus, RelayReply};
pub use tcp::{TcpHop, TcpHopConfig};
pub use tls::{client_config, server_config, TlsPaths};

use async_trait::async_trait;
use relay_hl7::Message;
use std::time::Duration;

/// Default bound on establishing a connection and completing the TLS handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on waiting for a reply.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur while reading or writing an MLLP frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame exceeds the maximum payload size of {limit} bytes")]
    TooLarge { limit: usize },

    #[error("frame does not start with the MLLP start block (got 0x{0:02x})")]
    MissingStartBlock(u8),

    #[error("connection closed before the end of the frame")]
    Truncated,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while exchanging a message with another hop.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("No response from {0}")]
    NoResponse(String),

    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Scratch store error: {0}")]
    Scratch(#[from] relay_files::FilesError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for Results that can fail with a [`TransportError`].
pub type TransportResult<T> = Result<T, TransportError>;

/// The next hop a message is handed to.
///
/// Implementations carry one exchange per call and keep no connection state between calls.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Short description of the destination for logs.
    fn describe(&self) -> String;

    /// Sends `payload` and returns the raw reply text.
    async fn exchange(&self, payload: &str) -> TransportResult<String>;

    /// Sends `message` and maps the reply with [`HopStatus::from_reply`].
    ///
    /// # Errors
    ///
    /// Returns a `TransportError` when no reply could be obtained at all. A reply that signals
    /// failure is not an error; it is a non-success [`HopStatus`].
    async fn forward(&self, message: &Message) -> TransportResult<HopStatus> {
        let reply = self.exchange(&message.to_string()).await?;
        Ok(HopStatus::from_reply(&reply))
    }

    /// Like [`Forwarder::forward`] but reports transport errors as [`HopStatus::FAILURE`].
    async fn forward_status(&self, message: &Message) -> HopStatus {
        match self.forward(message).await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(hop = %self.describe(), error = %e, "forward failed");
                HopStatus::FAILURE
            }
        }
    }
}
