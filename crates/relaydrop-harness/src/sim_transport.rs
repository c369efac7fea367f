//! Frame I/O over simulated byte streams.
//!
//! Turmoil exposes TCP streams, so the simulated relay and clients write
//! frames back to back on one stream per connection, the same way the QUIC
//! runtime does on its bidirectional stream.

use std::io::{self, ErrorKind};

use relaydrop_proto::{Frame, FrameHeader};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one frame.
///
/// Returns `UnexpectedEof` when the peer closed the stream between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Frame> {
    let mut buf = vec![0u8; FrameHeader::SIZE];
    reader.read_exact(&mut buf).await?;

    let payload_size = FrameHeader::from_bytes(&buf)
        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?
        .payload_size() as usize;

    buf.resize(FrameHeader::SIZE + payload_size, 0);
    reader.read_exact(&mut buf[FrameHeader::SIZE..]).await?;

    Frame::decode(&buf).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    let mut buf = Vec::with_capacity(frame.encoded_len());
    frame.encode(&mut buf).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
    writer.write_all(&buf).await?;
    writer.flush().await
}
