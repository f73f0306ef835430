//! Request transport and server discovery.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use netschedule_core::{Command, MAX_LINE_LEN, ProtocolError, Reply, ServerAddress};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::error::{ClientError, RpcError};

pub type RpcFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RpcError>> + Send + 'a>>;

pub type DiscoveryFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<ServerAddress>, ClientError>> + Send + 'a>>;

/// Sends one command to one server and returns its reply.
///
/// Unreachable servers must surface as [`RpcError::ConnectionFailure`];
/// timelines drop such servers until the next discovery.
pub trait JobChannel: Send + Sync + 'static {
    fn execute<'a>(&'a self, server: &'a ServerAddress, command: &'a Command)
    -> RpcFuture<'a, Reply>;
}

/// Execute `command` and turn error replies into [`RpcError::Server`].
pub async fn call(
    channel: &dyn JobChannel,
    server: &ServerAddress,
    command: &Command,
) -> Result<Reply, RpcError> {
    match channel.execute(server, command).await? {
        Reply::Error { code, message } => Err(RpcError::Server { code, message }),
        reply => Ok(reply),
    }
}

/// Enumerates the queue servers currently serving a queue.
pub trait ServiceDiscovery: Send + Sync + 'static {
    fn discover(&self) -> DiscoveryFuture<'_>;
}

/// Fixed server list that can be swapped at runtime.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    servers: Mutex<Vec<ServerAddress>>,
}

impl StaticDiscovery {
    pub fn new(servers: Vec<ServerAddress>) -> Self {
        Self {
            servers: Mutex::new(servers),
        }
    }

    pub fn set(&self, servers: Vec<ServerAddress>) {
        *self.servers.lock().unwrap_or_else(PoisonError::into_inner) = servers;
    }
}

impl ServiceDiscovery for StaticDiscovery {
    fn discover(&self) -> DiscoveryFuture<'_> {
        let servers = self
            .servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Box::pin(async move { Ok(servers) })
    }
}

/// One TCP connection per request.
#[derive(Debug, Clone)]
pub struct TcpChannel {
    timeout: Duration,
    max_line_len: usize,
}

impl TcpChannel {
    /// `timeout` bounds connect, send and receive of each request.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            max_line_len: MAX_LINE_LEN,
        }
    }

    /// Reject reply lines longer than `max` bytes.
    pub fn with_max_line_len(mut self, max: usize) -> Self {
        self.max_line_len = max;
        self
    }

    async fn round_trip(&self, server: &ServerAddress, line: String) -> Result<String, RpcError> {
        let failure = |e: std::io::Error| RpcError::ConnectionFailure(format!("{}: {}", server, e));

        let stream = TcpStream::connect((server.host.as_str(), server.port))
            .await
            .map_err(failure)?;
        let (reader, mut writer) = stream.into_split();
        writer.write_all(line.as_bytes()).await.map_err(failure)?;
        writer.write_all(b"\n").await.map_err(failure)?;

        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(self.max_line_len));
        match lines.next().await {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                Err(RpcError::Protocol(ProtocolError::LineTooLong {
                    max: self.max_line_len,
                }))
            }
            Some(Err(LinesCodecError::Io(e))) => Err(failure(e)),
            None => Err(RpcError::ConnectionFailure(format!(
                "{}: connection closed before reply",
                server
            ))),
        }
    }
}

impl Default for TcpChannel {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl JobChannel for TcpChannel {
    fn execute<'a>(
        &'a self,
        server: &'a ServerAddress,
        command: &'a Command,
    ) -> RpcFuture<'a, Reply> {
        Box::pin(async move {
            let line = command.encode();
            let reply = tokio::time::timeout(self.timeout, self.round_trip(server, line))
                .await
                .map_err(|_| RpcError::ConnectionFailure(format!("{}: timed out", server)))??;
            Ok(Reply::parse(&reply)?)
        })
    }
}

#[cfg(test)]
mod tests {
    use netschedule_core::{ErrorCode, JobId};
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn tcp_channel_reads_one_reply_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut line = String::new();
            BufReader::new(reader).read_line(&mut line).await.unwrap();
            assert!(line.starts_with("STATUS "));
            writer.write_all(b"ERR:eJobNotFound:job not found: 4\n").await.unwrap();
        });

        let channel = TcpChannel::default();
        let server = ServerAddress::new("127.0.0.1", addr.port());
        let command = Command::Status {
            queue: "q".into(),
            job: JobId(4),
        };
        let err = call(&channel, &server, &command).await.unwrap_err();
        assert_eq!(
            err,
            RpcError::Server {
                code: ErrorCode::JobNotFound,
                message: "job not found: 4".into()
            }
        );
    }

    #[tokio::test]
    async fn over_long_reply_is_a_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut line = String::new();
            BufReader::new(reader).read_line(&mut line).await.unwrap();
            let reply = format!("OK:{}", "x".repeat(100));
            // No newline: the limit must trip before the line ends.
            writer.write_all(reply.as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let channel = TcpChannel::new(Duration::from_secs(2)).with_max_line_len(16);
        let server = ServerAddress::new("127.0.0.1", addr.port());
        let err = channel
            .execute(&server, &Command::Stat { queue: "q".into() })
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::Protocol(ProtocolError::LineTooLong { max: 16 }));
    }

    #[tokio::test]
    async fn refused_connection_is_a_connection_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let channel = TcpChannel::new(Duration::from_secs(2));
        let command = Command::Stat { queue: "q".into() };
        let err = channel
            .execute(&ServerAddress::new("127.0.0.1", port), &command)
            .await
            .unwrap_err();
        assert!(err.is_connection_failure());
    }

    #[tokio::test]
    async fn static_discovery_can_change() {
        let a = ServerAddress::new("a", 1);
        let discovery = StaticDiscovery::new(vec![a.clone()]);
        assert_eq!(discovery.discover().await.unwrap(), vec![a]);
        discovery.set(Vec::new());
        assert!(discovery.discover().await.unwrap().is_empty());
    }
}
