//! Line-oriented TCP front end.
//!
//! Each connection carries any number of requests, one per line; every
//! request gets exactly one reply line. A line longer than
//! [`MAX_LINE_LEN`] is answered with a protocol error and skipped.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use netschedule_core::{ErrorCode, MAX_LINE_LEN, ProtocolError, Reply};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::service::QueueService;

/// Accept connections until `shutdown` fires.
pub async fn serve(listener: TcpListener, service: Arc<QueueService>, shutdown: CancellationToken) {
    match listener.local_addr() {
        Ok(addr) => tracing::info!(%addr, "Accepting queue requests"),
        Err(e) => tracing::warn!(error = %e, "Listener has no local address"),
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let service = service.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, service, shutdown).await {
                            tracing::warn!(%peer, error = %e, "Connection closed with error");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            },
            _ = shutdown.cancelled() => {
                tracing::info!("Queue front end received shutdown signal");
                break;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    service: Arc<QueueService>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    tracing::debug!(%peer, "Connection opened");
    let (reader, mut writer) = stream.into_split();
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    loop {
        let next = tokio::select! {
            next = lines.next() => next,
            _ = shutdown.cancelled() => break,
        };
        let mut reply = match next {
            None => break,
            Some(Ok(line)) if line.trim().is_empty() => continue,
            Some(Ok(line)) => service.execute(peer.ip(), &line).await,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                tracing::warn!(%peer, max = MAX_LINE_LEN, "Request line too long");
                Reply::Error {
                    code: ErrorCode::Protocol,
                    message: ProtocolError::LineTooLong { max: MAX_LINE_LEN }.to_string(),
                }
                .encode()
            }
            Some(Err(LinesCodecError::Io(e))) => return Err(e),
        };
        reply.push('\n');
        writer.write_all(reply.as_bytes()).await?;
    }

    tracing::debug!(%peer, "Connection closed");
    Ok(())
}
