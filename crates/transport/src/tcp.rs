use crate::framing::{read_frame, write_frame, DEFAULT_MAX_FRAME_BYTES};
use crate::tls::{client_config, TlsPaths};
use crate::{
    Forwarder, TransportError, TransportResult, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT,
};
use async_trait::async_trait;
use rustls_pki_types::ServerName;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

/// TCP hop client configuration
#[derive(Debug, Clone)]
pub struct TcpHopConfig {
    /// Remote `host:port`
    pub address: String,
    /// Name the server certificate must be valid for
    pub server_name: String,
    /// Client certificate, key and trusted CA
    pub tls: TlsPaths,
    /// Bound on TCP connect and, separately, on the TLS handshake
    pub connect_timeout: Duration,
    /// Bound on waiting for the reply
    pub read_timeout: Duration,
    /// Maximum reply payload size
    pub max_frame_bytes: usize,
}

impl TcpHopConfig {
    /// Configuration with default timeouts and frame limit.
    pub fn new(address: impl Into<String>, server_name: impl Into<String>, tls: TlsPaths) -> Self {
        Self {
            address: address.into(),
            server_name: server_name.into(),
            tls,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Mutual TLS client for one remote hop.
///
/// Each exchange opens a fresh connection, sends one frame, reads one frame and closes.
#[derive(Debug, Clone)]
pub struct TcpHop {
    config: TcpHopConfig,
}

impl TcpHop {
    pub fn new(config: TcpHopConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TcpHopConfig {
        &self.config
    }
}

#[async_trait]
impl Forwarder for TcpHop {
    fn describe(&self) -> String {
        format!("tcp://{}", self.config.address)
    }

    async fn exchange(&self, payload: &str) -> TransportResult<String> {
        let config = &self.config;
        let tls = client_config(&config.tls)?;
        let server_name = ServerName::try_from(config.server_name.clone())
            .map_err(|e| TransportError::Tls(format!("{}: {}", config.server_name, e)))?;

        let tcp = timeout(config.connect_timeout, TcpStream::connect(&config.address))
            .await
            .map_err(|_| TransportError::Timeout("connect"))?
            .map_err(|source| TransportError::Connect {
                addr: config.address.clone(),
                source,
            })?;

        let mut stream = timeout(
            config.connect_timeout,
            TlsConnector::from(tls).connect(server_name, tcp),
        )
        .await
        .map_err(|_| TransportError::Timeout("TLS handshake"))??;

        write_frame(&mut stream, payload.as_bytes()).await?;
        tracing::debug!(hop = %self.describe(), bytes = payload.len(), "sent frame");

        let reply = timeout(
            config.read_timeout,
            read_frame(&mut stream, config.max_frame_bytes),
        )
        .await
        .map_err(|_| TransportError::Timeout("read"))??
        .ok_or_else(|| TransportError::NoResponse(config.address.clone()))?;

        if let Err(e) = stream.shutdown().await {
            tracing::debug!(hop = %self.describe(), error = %e, "shutdown after exchange failed");
        }

        Ok(String::from_utf8_lossy(&reply).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::server_config;
    use crate::HopStatus;
    use relay_certificates::write_tls_bundle;
    use relay_hl7::Message;
    use std::net::SocketAddr;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    const ADT: &str = "MSH|^~\\&|HIS|RIH|ADT|RIH|20230523102000||ADT^A01|CTRL123|P|2.4\r\
PID|1||12345678^^^RIH^MR||Doe^John^A||19800101|M";

    /// Completes the TLS handshake on every connection and then never answers.
    async fn silent_peer(certs: &Path) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = TlsAcceptor::from(server_config(&TlsPaths::server_in(certs)).unwrap());
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(stream) = acceptor.accept(stream).await {
                    held.push(stream);
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_silent_peer_is_a_read_timeout() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let certs = temp_dir.path().join("certs");
        write_tls_bundle(&certs).unwrap();
        let addr = silent_peer(&certs).await;

        let mut config = TcpHopConfig::new(addr.to_string(), "localhost", TlsPaths::client_in(&certs));
        config.read_timeout = Duration::from_millis(200);
        let hop = TcpHop::new(config);
        let message = Message::parse(ADT).unwrap();

        assert!(matches!(
            hop.forward(&message).await,
            Err(TransportError::Timeout("read"))
        ));
        assert_eq!(hop.forward_status(&message).await, HopStatus::FAILURE);
    }

    #[tokio::test]
    async fn test_missing_tls_material_fails_before_connecting() {
        let temp_dir = TempDir::new().unwrap();
        let hop = TcpHop::new(TcpHopConfig::new(
            "127.0.0.1:9",
            "localhost",
            TlsPaths::client_in(temp_dir.path()),
        ));
        assert!(matches!(hop.exchange(ADT).await, Err(TransportError::Tls(_))));
        assert_eq!(hop.describe(), "tcp://127.0.0.1:9");
    }
}
