//! NetSchedule queue server.
//!
//! # Architecture
//!
//! - `Queue` - per-named-queue aggregate: status tracker, affinity index,
//!   listener registry and run-timeout timeline, each behind its own lock
//! - `QueueRegistry` - live queues by name, read by request handlers
//! - `Supervisor` - ractor actor owning queue lifecycle and housekeeping
//! - `QueueService` - turns request lines into queue calls
//! - `transport` - line-oriented TCP front end
//!
//! # Usage
//!
//! ```ignore
//! use netschedule_server::{ServerConfig, start};
//! use tokio_util::sync::CancellationToken;
//!
//! let shutdown = CancellationToken::new();
//! let server = start(ServerConfig::default(), shutdown.clone()).await?;
//! println!("listening on {}", server.local_addr());
//! shutdown.cancel();
//! server.stopped().await?;
//! ```

mod affinity;
mod config;
mod listeners;
mod messages;
mod notifier;
mod queue;
mod registry;
mod run_timeout;
mod service;
mod supervisor;
mod tracker;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use db::{MemoryJobStore, SurrealJobStore};
use netschedule_core::{JobStore, ServerAddress};
use ractor::ActorRef;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use affinity::{AffinityDictionary, AffinityId, AffinityIndex, WorkerAffinityMap};
pub use config::{QueueConfig, ServerConfig, StoreConfig};
pub use listeners::{GetInterest, Listener, ListenerKey, ListenerRegistry};
pub use messages::{ServerError, SupervisorMessage};
pub use notifier::{NOTIFY_BACKLOG, NotificationSink, NullNotifier, UdpNotifier};
pub use queue::{HousekeepingReport, JobFilter, Queue, QueueContext};
pub use registry::QueueRegistry;
pub use run_timeout::RunTimeline;
pub use service::QueueService;
pub use supervisor::{
    StaticQueue, Supervisor, SupervisorArgs, create_queue, delete_queue, list_queues,
    reconfigure_queue, start_supervisor,
};
pub use tracker::JobStatusTracker;

/// Re-export ractor types for convenience.
pub use ractor::{Actor, RpcReplyPort};

/// A started server.
pub struct RunningServer {
    local_addr: SocketAddr,
    node: ServerAddress,
    registry: Arc<QueueRegistry>,
    supervisor: ActorRef<SupervisorMessage>,
    supervisor_handle: JoinHandle<()>,
    front_end: JoinHandle<()>,
}

impl RunningServer {
    /// Address the TCP front end is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Identity carried in notifications.
    pub fn node(&self) -> &ServerAddress {
        &self.node
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &ActorRef<SupervisorMessage> {
        &self.supervisor
    }

    /// Wait for the front end to stop, then flush and stop the supervisor.
    pub async fn stopped(self) -> Result<(), ServerError> {
        self.front_end
            .await
            .map_err(|e| ServerError::Actor(e.to_string()))?;
        self.supervisor
            .send_message(SupervisorMessage::Shutdown)
            .map_err(|e| ServerError::Actor(e.to_string()))?;
        self.supervisor_handle
            .await
            .map_err(|e| ServerError::Actor(e.to_string()))?;
        tracing::info!("Server stopped");
        Ok(())
    }
}

async fn open_store(config: &StoreConfig) -> Result<Arc<dyn JobStore>, ServerError> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryJobStore::new())),
        StoreConfig::Surreal(db_config) => {
            db::init(db_config.clone()).await?;
            Ok(Arc::new(SurrealJobStore::new()))
        }
    }
}

/// Bind sockets, open static queues and start serving requests.
pub async fn start(
    config: ServerConfig,
    shutdown: CancellationToken,
) -> Result<RunningServer, ServerError> {
    let store = open_store(&config.store).await?;
    let listener = TcpListener::bind(&config.listen).await?;
    let local_addr = listener.local_addr()?;
    let node = match config.advertise {
        Some(_) => config.node_address()?,
        None => ServerAddress::new(local_addr.ip().to_string(), local_addr.port()),
    };
    let notifier = UdpNotifier::bind(&config.udp_bind, shutdown.clone()).await?;

    let registry = Arc::new(QueueRegistry::new());
    let args = SupervisorArgs {
        registry: registry.clone(),
        context: QueueContext {
            store,
            notifier: Arc::new(notifier),
            server: node.clone(),
        },
        classes: config.classes.clone().into_iter().collect(),
        queues: config.static_queues()?,
        tick_interval: config.housekeeping_interval.max(Duration::from_millis(10)),
        purge_batch: config.purge_batch,
    };
    let (supervisor, supervisor_handle) = start_supervisor(args).await?;

    let service = Arc::new(QueueService::new(registry.clone(), Some(supervisor.clone())));
    let front_end = tokio::spawn(transport::serve(listener, service, shutdown));

    tracing::info!(%local_addr, %node, "Server started");
    Ok(RunningServer {
        local_addr,
        node,
        registry,
        supervisor,
        supervisor_handle,
        front_end,
    })
}

/// Run until `shutdown` fires.
pub async fn run(config: ServerConfig, shutdown: CancellationToken) -> Result<(), ServerError> {
    start(config, shutdown).await?.stopped().await
}
