//! Background receiver for server notification datagrams.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use netschedule_core::{MAX_DATAGRAM_LEN, Notification, NotificationKind, ServerAddress};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::notifications::ServerNotifications;

#[derive(Debug)]
struct Subscriber {
    kind: NotificationKind,
    ready: Weak<ServerNotifications>,
}

#[derive(Debug, Default)]
struct Subscribers(Mutex<Vec<Subscriber>>);

impl Subscribers {
    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, kind: NotificationKind) -> Arc<ServerNotifications> {
        let ready = Arc::new(ServerNotifications::new());
        let mut subscribers = self.lock();
        subscribers.retain(|s| s.ready.strong_count() > 0);
        subscribers.push(Subscriber {
            kind,
            ready: Arc::downgrade(&ready),
        });
        ready
    }

    /// Push `server` to every live subscriber of `kind`; returns how many.
    fn publish(&self, kind: NotificationKind, server: &ServerAddress) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|s| s.ready.strong_count() > 0);
        subscribers
            .iter()
            .filter(|s| s.kind == kind)
            .filter_map(|s| s.ready.upgrade())
            .map(|ready| ready.push(server.clone()))
            .count()
    }

    fn len(&self) -> usize {
        self.lock()
            .iter()
            .filter(|s| s.ready.strong_count() > 0)
            .count()
    }
}

/// Owns the UDP socket and one receiver task.
///
/// Every executor or reader subscribes for its own ready set; a
/// notification for `queue` is copied into each set of its kind.
/// Datagrams for other queues and malformed ones are dropped.
#[derive(Debug)]
pub struct NotificationListener {
    local_addr: SocketAddr,
    subscribers: Arc<Subscribers>,
    shutdown: CancellationToken,
}

impl NotificationListener {
    pub async fn bind(addr: &str, queue: impl Into<String>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let subscribers = Arc::new(Subscribers::default());
        let shutdown = CancellationToken::new();

        tokio::spawn(receive_loop(
            socket,
            queue.into(),
            subscribers.clone(),
            shutdown.clone(),
        ));

        tracing::info!(%local_addr, "Notification listener started");
        Ok(Self {
            local_addr,
            subscribers,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Port servers are asked to notify.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// A fresh ready set fed with every notification of `kind`.
    ///
    /// The subscription ends when the returned set is dropped.
    pub fn subscribe(&self, kind: NotificationKind) -> Arc<ServerNotifications> {
        self.subscribers.add(kind)
    }

    /// Live subscriptions of either kind.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for NotificationListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn receive_loop(
    socket: UdpSocket,
    queue: String,
    subscribers: Arc<Subscribers>,
    shutdown: CancellationToken,
) {
    let mut buf = [0u8; MAX_DATAGRAM_LEN];
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        match received {
            Ok((len, sender)) => match Notification::parse(&buf[..len]) {
                Ok(notification) if notification.queue == queue => {
                    let delivered = subscribers.publish(notification.kind, &notification.server);
                    tracing::trace!(
                        server = %notification.server,
                        kind = notification.kind.as_str(),
                        delivered,
                        "Notification received"
                    );
                }
                Ok(notification) => {
                    tracing::trace!(queue = %notification.queue, "Ignoring notification for another queue");
                }
                Err(e) => {
                    tracing::trace!(%sender, error = %e, "Dropping malformed datagram");
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Failed to receive notification");
            }
        }
    }
    tracing::info!("Notification listener stopped");
}
