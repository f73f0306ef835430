//! Outgoing UDP notifications to worker nodes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use netschedule_core::Notification;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::listeners::ListenerKey;

/// Best-effort delivery of notifications; must not block the caller.
pub trait NotificationSink: Send + Sync + 'static {
    fn notify(&self, target: &ListenerKey, notification: &Notification);
}

/// Sink that drops everything, for queues nobody listens to.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl NotificationSink for NullNotifier {
    fn notify(&self, _target: &ListenerKey, _notification: &Notification) {}
}

struct Outgoing {
    target: String,
    payload: Vec<u8>,
}

/// Datagrams waiting for the sender task before new ones are dropped.
pub const NOTIFY_BACKLOG: usize = 1024;

/// Sends datagrams from a background task that owns the socket.
#[derive(Debug, Clone)]
pub struct UdpNotifier {
    tx: mpsc::Sender<Outgoing>,
    local_addr: SocketAddr,
    dropped: Arc<AtomicU64>,
}

impl std::fmt::Debug for Outgoing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outgoing")
            .field("target", &self.target)
            .field("len", &self.payload.len())
            .finish()
    }
}

impl UdpNotifier {
    /// Bind the sending socket and start the sender task.
    pub async fn bind(addr: &str, shutdown: CancellationToken) -> std::io::Result<Self> {
        Self::bind_with_backlog(addr, NOTIFY_BACKLOG, shutdown).await
    }

    pub async fn bind_with_backlog(
        addr: &str,
        backlog: usize,
        shutdown: CancellationToken,
    ) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (tx, rx) = mpsc::channel(backlog.max(1));

        tokio::spawn(run_sender(socket, rx, shutdown));

        tracing::info!(%local_addr, backlog, "UDP notifier started");
        Ok(Self {
            tx,
            local_addr,
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Notifications dropped because the backlog was full or the sender stopped.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl NotificationSink for UdpNotifier {
    fn notify(&self, target: &ListenerKey, notification: &Notification) {
        let outgoing = Outgoing {
            target: target.to_string(),
            payload: notification.encode(),
        };
        match self.tx.try_send(outgoing) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(listener = %target, "Notification backlog full, dropping notification");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(listener = %target, "Notifier stopped, dropping notification");
            }
        }
    }
}

async fn run_sender(
    socket: Arc<UdpSocket>,
    mut rx: mpsc::Receiver<Outgoing>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => {
                let Some(outgoing) = next else { break };
                match socket.send_to(&outgoing.payload, outgoing.target.as_str()).await {
                    Ok(sent) => {
                        tracing::trace!(listener = %outgoing.target, bytes = sent, "Notification sent");
                    }
                    Err(e) => {
                        tracing::warn!(listener = %outgoing.target, error = %e, "Failed to send notification");
                    }
                }
            }
        }
    }
    tracing::info!("UDP notifier stopped");
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use netschedule_core::{NotificationKind, ServerAddress};

    use super::*;

    #[tokio::test]
    async fn datagrams_reach_the_listener() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let shutdown = CancellationToken::new();
        let notifier = UdpNotifier::bind("127.0.0.1:0", shutdown.clone()).await.unwrap();

        let notification = Notification::new(
            NotificationKind::Get,
            "render",
            ServerAddress::new("127.0.0.1", 9100),
        );
        notifier.notify(&ListenerKey::new("127.0.0.1", port), &notification);

        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), receiver.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Notification::parse(&buf[..len]).unwrap(), notification);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn full_backlog_drops_instead_of_growing() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let shutdown = CancellationToken::new();
        let notifier = UdpNotifier::bind_with_backlog("127.0.0.1:0", 1, shutdown.clone())
            .await
            .unwrap();

        let target = ListenerKey::new("127.0.0.1", port);
        let notification = Notification::new(
            NotificationKind::Read,
            "render",
            ServerAddress::new("127.0.0.1", 9100),
        );
        // The sender task cannot run before the first await below.
        for _ in 0..3 {
            notifier.notify(&target, &notification);
        }
        assert_eq!(notifier.dropped(), 2);

        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), receiver.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Notification::parse(&buf[..len]).unwrap(), notification);

        shutdown.cancel();
    }
}
