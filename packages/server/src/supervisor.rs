//! Supervisor actor owning queue lifecycle and periodic housekeeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use netschedule_core::{QueueError, QueueInfo, QueueKind, QueueParams, validate_token};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::task::JoinHandle;

use crate::messages::{ServerError, SupervisorMessage};
use crate::queue::{Queue, QueueContext};
use crate::registry::QueueRegistry;

/// A queue that exists for the whole life of the server.
#[derive(Debug, Clone)]
pub struct StaticQueue {
    pub name: String,
    /// Saved to the store when given; stored parameters apply otherwise.
    pub params: Option<QueueParams>,
}

/// Arguments for spawning the supervisor.
pub struct SupervisorArgs {
    pub registry: Arc<QueueRegistry>,
    pub context: QueueContext,
    pub classes: HashMap<String, QueueParams>,
    pub queues: Vec<StaticQueue>,
    pub tick_interval: Duration,
    pub purge_batch: usize,
}

/// State for the supervisor actor.
pub struct SupervisorState {
    registry: Arc<QueueRegistry>,
    context: QueueContext,
    purge_batch: usize,
    ticker: JoinHandle<()>,
}

impl SupervisorState {
    async fn create_queue(
        &self,
        name: String,
        class: Option<String>,
        params: Option<QueueParams>,
    ) -> Result<QueueInfo, QueueError> {
        validate_token("queue", &name)?;
        if self.registry.contains(&name) {
            return Err(QueueError::QueueExists(name));
        }

        let (kind, params) = match class {
            Some(class) => {
                let class_params = self
                    .registry
                    .class(&class)
                    .ok_or_else(|| QueueError::validation("class", &class, "unknown queue class"))?;
                (QueueKind::Dynamic { class }, Some(params.unwrap_or(class_params)))
            }
            None => (QueueKind::Static, params),
        };

        let queue = Queue::open(&name, kind, params, self.context.clone()).await?;
        let info = queue.info();
        self.registry.insert(Arc::new(queue))?;

        tracing::info!(queue = %name, kind = ?info.kind, "Queue created");
        Ok(info)
    }

    async fn delete_queue(&self, name: &str) -> Result<(), QueueError> {
        let queue = self.registry.get(name)?;
        if !queue.kind().is_dynamic() {
            return Err(QueueError::validation(
                "queue",
                name,
                "static queues cannot be deleted",
            ));
        }
        self.registry.remove(name);
        queue.close();

        let marked = queue.clear();
        let batch = self.purge_batch.max(1);
        while queue.purge(batch).await > 0 {}
        queue.flush_deleted_vectors().await?;

        tracing::info!(queue = %name, jobs = marked, "Queue deleted");
        Ok(())
    }

    async fn reconfigure_queue(
        &self,
        name: &str,
        params: QueueParams,
    ) -> Result<QueueInfo, QueueError> {
        let old = self.registry.get(name)?;
        let queue = old.reconfigure(params).await?;
        let info = queue.info();
        self.registry.replace(Arc::new(queue));
        old.close();

        tracing::info!(queue = %name, id = %info.id, "Queue reconfigured");
        Ok(info)
    }

    async fn tick(&self) {
        let now = Utc::now();
        for queue in self.registry.list() {
            let report = queue.housekeeping(now, self.purge_batch).await;
            if report != Default::default() {
                tracing::debug!(queue = %queue.name(), ?report, "Housekeeping pass");
            }
            if queue.is_expired(now)
                && let Err(e) = self.delete_queue(queue.name()).await
            {
                tracing::warn!(queue = %queue.name(), error = %e, "Failed to delete expired queue");
            }
        }
    }

    async fn flush_all(&self) {
        for queue in self.registry.list() {
            if let Err(e) = queue.flush_deleted_vectors().await {
                tracing::warn!(queue = %queue.name(), error = %e, "Failed to flush deleted vectors");
            }
        }
    }
}

/// Supervisor actor that manages all queues.
pub struct Supervisor;

impl Actor for Supervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(queues = args.queues.len(), "Starting queue supervisor");

        for (name, params) in args.classes {
            args.registry.set_class(&name, params);
        }

        // Periodic housekeeping tick
        let period = args.tick_interval;
        let ticker = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                if myself.send_message(SupervisorMessage::Tick).is_err() {
                    break;
                }
            }
        });

        let state = SupervisorState {
            registry: args.registry,
            context: args.context,
            purge_batch: args.purge_batch,
            ticker,
        };

        for spec in args.queues {
            state
                .create_queue(spec.name, None, spec.params)
                .await
                .map_err(|e| ActorProcessingErr::from(format!("Failed to open queue: {}", e)))?;
        }

        Ok(state)
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.ticker.abort();
        tracing::info!("Queue supervisor stopped");
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::CreateQueue {
                name,
                class,
                params,
                reply,
            } => {
                let _ = reply.send(state.create_queue(name, class, params).await);
            }

            SupervisorMessage::DeleteQueue { name, reply } => {
                let _ = reply.send(state.delete_queue(&name).await);
            }

            SupervisorMessage::ReconfigureQueue {
                name,
                params,
                reply,
            } => {
                let _ = reply.send(state.reconfigure_queue(&name, params).await);
            }

            SupervisorMessage::ListQueues { reply } => {
                let queues = state.registry.list().iter().map(|q| q.info()).collect();
                let _ = reply.send(queues);
            }

            SupervisorMessage::Tick => state.tick().await,

            SupervisorMessage::Shutdown => {
                tracing::info!("Shutting down queue supervisor");
                state.flush_all().await;
                myself.stop(None);
            }
        }

        Ok(())
    }
}

/// Spawn the supervisor; static queues are open once this returns.
pub async fn start_supervisor(
    args: SupervisorArgs,
) -> Result<(ActorRef<SupervisorMessage>, JoinHandle<()>), ServerError> {
    let (actor, handle) = Actor::spawn(None, Supervisor, args).await?;
    Ok((actor, handle))
}

pub async fn create_queue(
    supervisor: &ActorRef<SupervisorMessage>,
    name: &str,
    class: Option<&str>,
    params: Option<QueueParams>,
) -> Result<QueueInfo, ServerError> {
    let (tx, rx) = ractor::concurrency::oneshot();
    supervisor
        .send_message(SupervisorMessage::CreateQueue {
            name: name.to_string(),
            class: class.map(str::to_string),
            params,
            reply: tx.into(),
        })
        .map_err(|e| ServerError::Actor(e.to_string()))?;
    Ok(rx.await.map_err(|e| ServerError::Actor(e.to_string()))??)
}

pub async fn delete_queue(
    supervisor: &ActorRef<SupervisorMessage>,
    name: &str,
) -> Result<(), ServerError> {
    let (tx, rx) = ractor::concurrency::oneshot();
    supervisor
        .send_message(SupervisorMessage::DeleteQueue {
            name: name.to_string(),
            reply: tx.into(),
        })
        .map_err(|e| ServerError::Actor(e.to_string()))?;
    Ok(rx.await.map_err(|e| ServerError::Actor(e.to_string()))??)
}

pub async fn reconfigure_queue(
    supervisor: &ActorRef<SupervisorMessage>,
    name: &str,
    params: QueueParams,
) -> Result<QueueInfo, ServerError> {
    let (tx, rx) = ractor::concurrency::oneshot();
    supervisor
        .send_message(SupervisorMessage::ReconfigureQueue {
            name: name.to_string(),
            params,
            reply: tx.into(),
        })
        .map_err(|e| ServerError::Actor(e.to_string()))?;
    Ok(rx.await.map_err(|e| ServerError::Actor(e.to_string()))??)
}

pub async fn list_queues(
    supervisor: &ActorRef<SupervisorMessage>,
) -> Result<Vec<QueueInfo>, ServerError> {
    let (tx, rx) = ractor::concurrency::oneshot();
    supervisor
        .send_message(SupervisorMessage::ListQueues { reply: tx.into() })
        .map_err(|e| ServerError::Actor(e.to_string()))?;
    rx.await.map_err(|e| ServerError::Actor(e.to_string()))
}
