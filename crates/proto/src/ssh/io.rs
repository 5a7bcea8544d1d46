//! Tokio driver for [`SshTransport`].
//!
//! The transport is sans-IO; these functions pump bytes between it and an
//! async stream until one side closes.
//!
//! # Example
//!
//! ```rust,no_run
//! use kiln_proto::ssh::config::TransportConfig;
//! use kiln_proto::ssh::io;
//! use kiln_proto::ssh::transport::{LoggingHandler, SshTransport};
//! use std::sync::Arc;
//! use tokio::net::TcpStream;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = TcpStream::connect("127.0.0.1:22").await?;
//! let mut transport = SshTransport::client(
//!     Arc::new(TransportConfig::default()),
//!     Box::new(LoggingHandler),
//! );
//! io::run_tcp(&mut transport, stream).await?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::transport::SshTransport;
use kiln_platform::{KilnError, KilnResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Drives `transport` over `stream` until the connection ends.
///
/// Returns `Ok(())` when the transport closed the connection or the peer
/// reached end of stream; [`SshTransport::closed_cause`] tells which.
///
/// # Errors
///
/// Returns [`KilnError::Io`] if reading or writing the stream fails. The
/// transport has been told about the loss by then.
pub async fn run<S>(transport: &mut SshTransport, mut stream: S) -> KilnResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    transport.connection_made(None, None);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        if let Err(err) = flush(transport, &mut stream).await {
            transport.connection_lost(Some(&err.to_string()));
            return Err(KilnError::Io(err));
        }
        if transport.wants_close() {
            debug!("transport closed, shutting down stream");
            // The peer may already be gone.
            let _ = stream.shutdown().await;
            return Ok(());
        }

        let n = match stream.read(&mut buf).await {
            Ok(n) => n,
            Err(err) => {
                transport.connection_lost(Some(&err.to_string()));
                return Err(KilnError::Io(err));
            }
        };
        if n == 0 {
            debug!("end of stream");
            transport.connection_lost(Some("end of stream"));
            return Ok(());
        }
        trace!(len = n, "read from stream");
        transport.data_received(&buf[..n]);
    }
}

/// Drives `transport` over a TCP connection, recording both socket addresses.
pub async fn run_tcp(transport: &mut SshTransport, stream: TcpStream) -> KilnResult<()> {
    let local = stream.local_addr().ok();
    let peer = stream.peer_addr().ok();
    transport.connection_made(local, peer);
    run(transport, stream).await
}

async fn flush<S>(transport: &mut SshTransport, stream: &mut S) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    if !transport.has_outgoing() {
        return Ok(());
    }
    let bytes = transport.take_outgoing();
    trace!(len = bytes.len(), "writing to stream");
    stream.write_all(&bytes).await?;
    stream.flush().await
}
