use crate::framing::{read_frame, write_frame, DEFAULT_MAX_FRAME_BYTES};
use crate::tls::{server_config, TlsPaths};
use crate::{
    FrameError, Forwarder, HopStatus, RelayReply, TransportResult, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_READ_TIMEOUT,
};
use relay_files::ScratchStore;
use relay_hl7::plain_text::to_plain_text;
use relay_hl7::{generate_ack, validate, AckCode, Acknowledgment, Message, StructuralError};
use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

/// What a hop does with a message it has received.
pub enum HopRole {
    /// Replies with an HL7 ACK: `AA` for a structurally valid message, `AE` with the reason
    /// otherwise.
    Acknowledger,
    /// Last hop of a chain. Replies `"200"` for a structurally valid message, `"400"` otherwise.
    Terminal,
    /// Acknowledges the message, forwards valid messages to `next`, and replies with a
    /// [`RelayReply`] carrying both its own ACK and the raw downstream reply.
    Relay { next: Arc<dyn Forwarder> },
}

impl HopRole {
    pub fn name(&self) -> &'static str {
        match self {
            HopRole::Acknowledger => "acknowledger",
            HopRole::Terminal => "terminal",
            HopRole::Relay { .. } => "relay",
        }
    }

    /// Builds the reply for one received payload. Never fails: internal errors become the
    /// role's error reply.
    pub async fn respond(&self, raw: &str) -> String {
        let verdict = validate(raw);
        match self {
            HopRole::Terminal => {
                if tracing::enabled!(tracing::Level::DEBUG) {
                    if let Ok(message) = Message::parse(raw) {
                        tracing::debug!(rendered = %to_plain_text(&message), "terminal received");
                    }
                }
                match verdict {
                    Ok(()) => HopStatus::OK.to_string(),
                    Err(e) => {
                        tracing::warn!(reason = %e, "terminal rejected message");
                        HopStatus::FAILURE.to_string()
                    }
                }
            }
            HopRole::Acknowledger => match acknowledge(raw, &verdict) {
                Ok(ack) => ack.to_string(),
                Err(e) => self.error_reply(&e),
            },
            HopRole::Relay { next } => {
                let ack = match acknowledge(raw, &verdict) {
                    Ok(ack) => ack,
                    Err(e) => return self.error_reply(&e),
                };
                let mut reply = RelayReply {
                    ack: ack.to_string(),
                    ..RelayReply::default()
                };
                match verdict {
                    Err(e) => {
                        tracing::warn!(reason = %e, "relay did not forward invalid message");
                        reply.error = Some(e.to_string());
                    }
                    Ok(()) => match next.exchange(raw).await {
                        Ok(downstream) => reply.downstream = Some(downstream),
                        Err(e) => {
                            tracing::error!(hop = %next.describe(), error = %e, "forward failed");
                            reply.error = Some(e.to_string());
                        }
                    },
                }
                reply.to_json()
            }
        }
    }

    /// Reply sent when the payload could not be handled at all.
    pub fn error_reply(&self, detail: &str) -> String {
        match self {
            HopRole::Acknowledger => format!("Error processing message: {}", detail),
            HopRole::Terminal => HopStatus::FAILURE.to_string(),
            HopRole::Relay { .. } => RelayReply {
                error: Some(detail.to_owned()),
                ..RelayReply::default()
            }
            .to_json(),
        }
    }
}

fn acknowledge(
    raw: &str,
    verdict: &Result<(), StructuralError>,
) -> Result<Acknowledgment, String> {
    let message = Message::parse(raw).map_err(|e| e.to_string())?;
    let ack = match verdict {
        Ok(()) => generate_ack(&message, AckCode::Accept, None),
        Err(e) => generate_ack(&message, AckCode::Error, Some(&e.to_string())),
    };
    ack.map_err(|e| e.to_string())
}

/// TCP hop server configuration
#[derive(Debug, Clone)]
pub struct HopServerConfig {
    /// Listen address, e.g. `0.0.0.0:8081`
    pub bind: String,
    /// Server certificate, key and the CA client certificates must chain to
    pub tls: TlsPaths,
    /// Where raw payloads are recorded
    pub scratch_dir: PathBuf,
    pub handshake_timeout: Duration,
    pub read_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl HopServerConfig {
    pub fn new(bind: impl Into<String>, tls: TlsPaths, scratch_dir: PathBuf) -> Self {
        Self {
            bind: bind.into(),
            tls,
            scratch_dir,
            handshake_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

struct Handler {
    config: HopServerConfig,
    role: HopRole,
    scratch: ScratchStore,
}

/// Mutual TLS TCP server for one hop.
pub struct HopServer {
    listener: TcpListener,
    handler: Arc<Handler>,
}

impl HopServer {
    /// Binds the listener and opens the scratch store.
    ///
    /// TLS material is not read here; it is loaded for every accepted connection.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Io` if the address cannot be bound and
    /// `TransportError::Scratch` if the scratch directory cannot be created.
    pub async fn bind(config: HopServerConfig, role: HopRole) -> TransportResult<Self> {
        let scratch = ScratchStore::new(&config.scratch_dir)?;
        let listener = TcpListener::bind(&config.bind).await?;
        tracing::info!(
            addr = %listener.local_addr()?,
            role = role.name(),
            "hop server listening"
        );
        Ok(Self {
            listener,
            handler: Arc::new(Handler {
                config,
                role,
                scratch,
            }),
        })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves connections until the process exits.
    pub async fn run(self) -> TransportResult<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serves connections until `shutdown` completes. Each connection runs on its own task, so
    /// a failing handler never stops the accept loop.
    pub async fn run_until<F>(self, shutdown: F) -> TransportResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(role = self.handler.role.name(), "hop server stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = Arc::clone(&self.handler);
                        tokio::spawn(async move { handler.handle(stream, peer).await });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
            }
        }
    }
}

impl Handler {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        let tls = match server_config(&self.config.tls) {
            Ok(tls) => tls,
            Err(e) => {
                tracing::error!(%peer, error = %e, "cannot load TLS material, dropping connection");
                return;
            }
        };

        let mut stream = match timeout(
            self.config.handshake_timeout,
            TlsAcceptor::from(tls).accept(stream),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(%peer, error = %e, "TLS handshake failed");
                return;
            }
            Err(_) => {
                tracing::warn!(%peer, "TLS handshake timed out");
                return;
            }
        };

        let read = timeout(
            self.config.read_timeout,
            read_frame(&mut stream, self.config.max_frame_bytes),
        )
        .await;
        let payload = match read {
            Ok(Ok(Some(payload))) => payload,
            Ok(Ok(None)) => {
                tracing::info!(%peer, "no data detected, closing connection");
                return;
            }
            Ok(Err(FrameError::Io(e))) if is_disconnect(&e) => {
                tracing::info!(%peer, "connection reset, closing connection");
                return;
            }
            Ok(Err(FrameError::Truncated)) => {
                tracing::warn!(%peer, "peer closed mid-frame");
                return;
            }
            Ok(Err(e)) => {
                tracing::warn!(%peer, error = %e, "unreadable frame");
                let reply = self.role.error_reply(&e.to_string());
                self.reply(&mut stream, peer, &reply).await;
                return;
            }
            Err(_) => {
                tracing::info!(%peer, "no data before timeout, closing connection");
                return;
            }
        };

        if let Err(detail) = self.record(&payload).await {
            tracing::error!(%peer, error = %detail, "failed to record payload");
            let reply = self.role.error_reply(&detail);
            self.reply(&mut stream, peer, &reply).await;
            return;
        }

        let raw = String::from_utf8_lossy(&payload);
        tracing::info!(%peer, role = self.role.name(), bytes = payload.len(), "received message");
        let reply = self.role.respond(&raw).await;
        self.reply(&mut stream, peer, &reply).await;
    }

    async fn record(&self, payload: &[u8]) -> Result<(), String> {
        let scratch = self.scratch.clone();
        let payload = payload.to_vec();
        match tokio::task::spawn_blocking(move || scratch.record(&payload)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn reply<S>(&self, stream: &mut S, peer: SocketAddr, reply: &str)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Err(e) = write_frame(stream, reply.as_bytes()).await {
            tracing::warn!(%peer, error = %e, "failed to send reply");
            return;
        }
        let _ = stream.shutdown().await;
    }
}

fn is_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
    )
}
