//! QUIC transport for the relay.
//!
//! Each participant holds one QUIC connection and opens a single
//! bidirectional stream on it. Frames travel in order on that stream in both
//! directions, which gives the relay the reliable, message-oriented channel
//! the room protocol assumes.
//!
//! # Security
//!
//! TLS 1.3 via `rustls`, ALPN `relaydrop/1`. Room membership is not
//! authenticated beyond knowledge of the room code; TLS only protects the
//! channel. Self-signed certificates are for local use only.

use std::{net::SocketAddr, path::Path, sync::Arc};

use quinn::{Endpoint, RecvStream, SendStream, ServerConfig};
use relaydrop_proto::ALPN_PROTOCOL;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::error::ServerError;

/// QUIC endpoint accepting participant connections.
pub struct QuinnTransport {
    endpoint: Endpoint,
}

impl QuinnTransport {
    /// Create and bind a new QUIC transport.
    ///
    /// Uses the PEM certificate and key when both paths are given, otherwise
    /// generates a self-signed certificate for `localhost`.
    pub fn bind(
        address: &str,
        cert_path: Option<&Path>,
        key_path: Option<&Path>,
    ) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid bind address '{address}': {e}")))?;

        let server_config = match (cert_path, key_path) {
            (Some(cert), Some(key)) => load_tls_config(cert, key)?,
            (None, None) => generate_self_signed_config()?,
            _ => {
                return Err(ServerError::Config(
                    "certificate and key must be given together".to_string(),
                ));
            },
        };

        let endpoint = Endpoint::server(server_config, addr)
            .map_err(|e| ServerError::Transport(format!("failed to create endpoint: {e}")))?;

        tracing::info!(%addr, "QUIC transport bound");

        Ok(Self { endpoint })
    }

    /// Accept the next QUIC connection.
    ///
    /// # Errors
    ///
    /// `ServerError::Transport` if the endpoint is closed or the handshake
    /// fails. A failed handshake affects only that connection.
    pub async fn accept(&self) -> Result<QuinnConnection, ServerError> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| ServerError::Transport("endpoint closed".to_string()))?;

        let connection = incoming
            .await
            .map_err(|e| ServerError::Transport(format!("connection failed: {e}")))?;

        Ok(QuinnConnection { connection })
    }

    /// Local address the transport is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.endpoint
            .local_addr()
            .map_err(|e| ServerError::Transport(format!("failed to get local address: {e}")))
    }
}

/// One participant's QUIC connection.
///
/// Clones share the underlying connection.
#[derive(Clone)]
pub struct QuinnConnection {
    connection: quinn::Connection,
}

impl QuinnConnection {
    /// Accept the participant's frame stream.
    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), ServerError> {
        self.connection
            .accept_bi()
            .await
            .map_err(|e| ServerError::Transport(format!("accept_bi failed: {e}")))
    }

    /// Remote peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Close the connection with an application reason.
    pub fn close(&self, reason: &str) {
        self.connection.close(quinn::VarInt::from_u32(0), reason.as_bytes());
    }
}

fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, ServerError> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        ServerError::Config(format!("failed to read cert '{}': {e}", cert_path.display()))
    })?;

    let key_pem = std::fs::read(key_path).map_err(|e| {
        ServerError::Config(format!("failed to read key '{}': {e}", key_path.display()))
    })?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Config(format!("failed to parse certificates: {e}")))?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| ServerError::Config(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| ServerError::Config("no private key found".to_string()))?;

    quic_server_config(certs, key)
}

fn generate_self_signed_config() -> Result<ServerConfig, ServerError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| ServerError::Config(format!("failed to generate self-signed cert: {e}")))?;

    let cert_der = cert.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    tracing::warn!("using self-signed certificate, not for production use");

    quic_server_config(vec![cert_der], key.into())
}

fn quic_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, ServerError> {
    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Config(format!("invalid TLS config: {e}")))?;

    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
        .map_err(|e| ServerError::Config(format!("QUIC config error: {e}")))?;

    Ok(ServerConfig::with_crypto(Arc::new(crypto)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transport_binds_with_self_signed() {
        let transport = QuinnTransport::bind("127.0.0.1:0", None, None).unwrap();
        let addr = transport.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn transport_rejects_invalid_address() {
        assert!(matches!(
            QuinnTransport::bind("invalid:address:format", None, None),
            Err(ServerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn transport_rejects_cert_without_key() {
        let result = QuinnTransport::bind("127.0.0.1:0", Some(Path::new("cert.pem")), None);
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn transport_reports_missing_cert_file() {
        let result = QuinnTransport::bind(
            "127.0.0.1:0",
            Some(Path::new("/nonexistent/cert.pem")),
            Some(Path::new("/nonexistent/key.pem")),
        );
        assert!(matches!(result, Err(ServerError::Config(msg)) if msg.contains("failed to read cert")));
    }
}
