//! RTMP version-3 "simple" handshake.
//!
//! Exactly 1 + 1536 + 1536 + 1536 bytes flow in each direction. Every read
//! carries a 5s deadline; a timeout or a non-`0x03` C0 is fatal to the
//! connection.

use std::time::Duration;

use rand::RngCore;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

const HANDSHAKE_SIZE: usize = 1536;
const RTMP_VERSION: u8 = 0x03;
const STEP_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unsupported handshake version: {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("peer closed the connection during the handshake")]
    ClosedEarly,
    #[error("handshake step timed out")]
    Timeout,
    #[error("io error during handshake: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio::time::error::Elapsed> for HandshakeError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        HandshakeError::Timeout
    }
}

async fn read_exact_deadline<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut [u8],
) -> Result<(), HandshakeError> {
    timeout(STEP_DEADLINE, async {
        stream.read_exact(buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                HandshakeError::ClosedEarly
            } else {
                HandshakeError::Io(e)
            }
        })
    })
    .await??;
    Ok(())
}

/// Performs the server side of the handshake: C0/C1 in, S0/S1/S2 out, C2 in.
///
/// S0+S1+S2 are written as a single concatenated buffer — some clients
/// refuse a partial S0/S1 followed by a delayed S2. C2's content is not
/// validated against S1; real-world clients vary.
pub async fn server_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
) -> Result<(), HandshakeError> {
    let mut c0 = [0u8; 1];
    read_exact_deadline(stream, &mut c0).await?;
    if c0[0] != RTMP_VERSION {
        return Err(HandshakeError::UnsupportedVersion(c0[0]));
    }

    let mut c1 = [0u8; HANDSHAKE_SIZE];
    read_exact_deadline(stream, &mut c1).await?;

    let mut response = Vec::with_capacity(1 + HANDSHAKE_SIZE * 2);
    response.push(RTMP_VERSION);

    let mut s1 = [0u8; HANDSHAKE_SIZE];
    s1[..4].copy_from_slice(&0u32.to_be_bytes());
    s1[4..8].copy_from_slice(&[0u8; 4]);
    rand::thread_rng().fill_bytes(&mut s1[8..]);
    response.extend_from_slice(&s1);

    // S2 is a byte-for-byte echo of C1.
    response.extend_from_slice(&c1);

    timeout(STEP_DEADLINE, async {
        stream.write_all(&response).await?;
        stream.flush().await
    })
    .await??;

    let mut c2 = [0u8; HANDSHAKE_SIZE];
    read_exact_deadline(stream, &mut c2).await?;
    // C2 is intentionally not compared against S1 — real clients vary.

    Ok(())
}

/// Performs the client side of the handshake: C0+C1 out, S0+S1 in, C2 out.
/// Reading S2 is optional and skipped here — nothing needs to validate it
/// against the C1 that was sent.
pub async fn client_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
) -> Result<(), HandshakeError> {
    let mut c1 = [0u8; HANDSHAKE_SIZE];
    rand::thread_rng().fill_bytes(&mut c1);

    let mut request = Vec::with_capacity(1 + HANDSHAKE_SIZE);
    request.push(RTMP_VERSION);
    request.extend_from_slice(&c1);
    timeout(STEP_DEADLINE, async {
        stream.write_all(&request).await?;
        stream.flush().await
    })
    .await??;

    let mut s0 = [0u8; 1];
    read_exact_deadline(stream, &mut s0).await?;
    if s0[0] != RTMP_VERSION {
        return Err(HandshakeError::UnsupportedVersion(s0[0]));
    }

    let mut s1 = [0u8; HANDSHAKE_SIZE];
    read_exact_deadline(stream, &mut s1).await?;

    // C2 echoes S1, per the simple handshake's echo semantics.
    timeout(STEP_DEADLINE, async {
        stream.write_all(&s1).await?;
        stream.flush().await
    })
    .await??;

    Ok(())
}
