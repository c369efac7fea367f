//! QUIC transport for the client.
//!
//! Provides [`ConnectedClient`], a thin bridge between channels and one QUIC
//! bidirectional stream. Protocol logic stays in the Sans-IO [`crate::Client`].
//!
//! Every frame in both directions travels on the single stream the client
//! opens, so the relay sees frames in exactly the order they were queued.
//!
//! Both queues are bounded. Flushes are reported as a running byte total on a
//! watch channel, so the writer never waits on the session to report one.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::BytesMut;
use quinn::{ClientConfig, Endpoint, RecvStream, SendStream};
use relaydrop_proto::{ALPN_PROTOCOL, Frame, FrameHeader};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// QUIC idle timeout. Longer than the heartbeat interval.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Inbound channel capacity.
const INBOUND_CAPACITY: usize = 64;

/// Outbound channel capacity. The session waits for room when it is full.
const OUTBOUND_CAPACITY: usize = 32;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Stream error.
    #[error("stream error: {0}")]
    Stream(String),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Frame queued for the relay.
#[derive(Debug)]
pub enum Outbound {
    /// Control frame.
    Control(Frame),
    /// Chunk frame; its `bytes` are added to [`ConnectedClient::flushed`]
    /// once written.
    Chunk {
        /// Chunk frame
        frame: Frame,
        /// Window bytes reported back on flush
        bytes: u64,
    },
}

/// Something that happened on the connection.
#[derive(Debug)]
pub enum Inbound {
    /// Frame from the relay.
    Frame(Frame),
    /// The connection ended.
    Closed {
        /// Why
        reason: String,
    },
}

/// Handle to a connected relay.
///
/// Frames are sent through `to_server` and everything from the connection
/// arrives on `from_server`. Internal tasks do the QUIC I/O.
pub struct ConnectedClient {
    /// Send frames to the relay.
    pub to_server: mpsc::Sender<Outbound>,
    /// Frames and closure from the relay.
    pub from_server: mpsc::Receiver<Inbound>,
    /// Chunk bytes written to the stream since connecting.
    pub flushed: watch::Receiver<u64>,
    connection: quinn::Connection,
    tasks: [tokio::task::AbortHandle; 2],
}

impl ConnectedClient {
    /// Relay address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Close the connection and stop the I/O tasks.
    pub fn close(&self, reason: &str) {
        self.connection.close(0u32.into(), reason.as_bytes());
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ConnectedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedClient").field("remote", &self.remote_addr()).finish_non_exhaustive()
    }
}

/// Connect to a RelayDrop relay via QUIC.
///
/// The relay certificate is not verified (self-signed development relays).
pub async fn connect(server_addr: &str) -> Result<ConnectedClient, TransportError> {
    let addr: SocketAddr = server_addr
        .parse()
        .map_err(|e| TransportError::Connection(format!("invalid address: {e}")))?;

    let bind: SocketAddr = if addr.is_ipv6() {
        SocketAddr::from(([0u16; 8], 0))
    } else {
        SocketAddr::from(([0u8; 4], 0))
    };

    let mut endpoint = Endpoint::client(bind)
        .map_err(|e| TransportError::Connection(format!("endpoint creation failed: {e}")))?;
    endpoint.set_default_client_config(insecure_client_config()?);

    let connection = endpoint
        .connect(addr, "localhost")
        .map_err(|e| TransportError::Connection(format!("connect failed: {e}")))?
        .await
        .map_err(|e| TransportError::Connection(format!("connection failed: {e}")))?;

    let (send, recv) = connection
        .open_bi()
        .await
        .map_err(|e| TransportError::Stream(format!("open stream failed: {e}")))?;

    let (to_server_tx, to_server_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let (from_server_tx, from_server_rx) = mpsc::channel(INBOUND_CAPACITY);
    let (flushed_tx, flushed_rx) = watch::channel(0);

    let writer = tokio::spawn(write_frames(send, to_server_rx, flushed_tx, from_server_tx.clone()));
    let reader = tokio::spawn(read_frames(recv, from_server_tx));

    tracing::debug!(%addr, "connected to relay");

    Ok(ConnectedClient {
        to_server: to_server_tx,
        from_server: from_server_rx,
        flushed: flushed_rx,
        connection,
        tasks: [writer.abort_handle(), reader.abort_handle()],
    })
}

/// Write queued frames until the queue closes or a write fails.
async fn write_frames(
    mut send: SendStream,
    mut queue: mpsc::Receiver<Outbound>,
    flushed: watch::Sender<u64>,
    events: mpsc::Sender<Inbound>,
) {
    while let Some(outbound) = queue.recv().await {
        let (frame, chunk_bytes) = match outbound {
            Outbound::Control(frame) => (frame, None),
            Outbound::Chunk { frame, bytes } => (frame, Some(bytes)),
        };

        if let Err(e) = send_frame(&mut send, &frame).await {
            // Fail pending sends first; the session may be waiting on a full
            // queue and not reading events.
            queue.close();
            let _ = events.send(Inbound::Closed { reason: e.to_string() }).await;
            return;
        }

        if let Some(bytes) = chunk_bytes {
            flushed.send_modify(|total| *total += bytes);
        }
    }

    if let Err(e) = send.finish() {
        tracing::debug!("finish failed: {e}");
    }
}

/// Read frames until the stream ends, then report why.
async fn read_frames(mut recv: RecvStream, events: mpsc::Sender<Inbound>) {
    let reason = loop {
        match read_frame(&mut recv).await {
            Ok(frame) => {
                if events.send(Inbound::Frame(frame)).await.is_err() {
                    return;
                }
            },
            Err(e) => break e.to_string(),
        }
    };

    let _ = events.send(Inbound::Closed { reason }).await;
}

async fn read_frame(recv: &mut RecvStream) -> Result<Frame, TransportError> {
    let mut buf = BytesMut::zeroed(FrameHeader::SIZE);
    recv.read_exact(&mut buf[..])
        .await
        .map_err(|e| TransportError::Stream(format!("header read failed: {e}")))?;

    let payload_size = FrameHeader::from_bytes(&buf)
        .map_err(|e| TransportError::Protocol(format!("invalid header: {e}")))?
        .payload_size() as usize;

    if payload_size > 0 {
        buf.resize(FrameHeader::SIZE + payload_size, 0);
        recv.read_exact(&mut buf[FrameHeader::SIZE..])
            .await
            .map_err(|e| TransportError::Stream(format!("payload read failed: {e}")))?;
    }

    Frame::decode(&buf).map_err(|e| TransportError::Protocol(format!("frame decode failed: {e}")))
}

async fn send_frame(send: &mut SendStream, frame: &Frame) -> Result<(), TransportError> {
    let buf = frame.to_vec().map_err(|e| TransportError::Protocol(format!("encode failed: {e}")))?;
    send.write_all(&buf).await.map_err(|e| TransportError::Stream(format!("write failed: {e}")))
}

/// Create an insecure client config that accepts any certificate.
///
/// WARNING: Development only. Production should verify certificates.
fn insecure_client_config() -> Result<ClientConfig, TransportError> {
    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier))
        .with_no_client_auth();

    // Must match the relay's ALPN protocol
    crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let quic = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| TransportError::Connection(format!("invalid TLS config: {e}")))?;
    let mut config = ClientConfig::new(Arc::new(quic));

    let idle = IDLE_TIMEOUT
        .try_into()
        .map_err(|e| TransportError::Connection(format!("invalid idle timeout: {e}")))?;
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(idle));
    transport.keep_alive_interval(Some(IDLE_TIMEOUT / 3));
    config.transport_config(Arc::new(transport));

    Ok(config)
}

/// Certificate verifier that accepts any certificate (insecure, for
/// development).
#[derive(Debug)]
struct InsecureCertVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_address_is_rejected() {
        let result = connect("not an address").await;
        assert!(matches!(result, Err(TransportError::Connection(msg)) if msg.contains("invalid address")));
    }

    #[test]
    fn client_config_builds() {
        assert!(insecure_client_config().is_ok());
    }
}
