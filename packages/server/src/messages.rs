//! Message types for the supervisor actor.

use netschedule_core::{QueueError, QueueInfo, QueueParams};
use ractor::RpcReplyPort;

/// Messages for the Supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Create a queue, dynamic when `class` is given.
    CreateQueue {
        name: String,
        class: Option<String>,
        params: Option<QueueParams>,
        reply: RpcReplyPort<Result<QueueInfo, QueueError>>,
    },

    /// Delete a dynamic queue and all its jobs.
    DeleteQueue {
        name: String,
        reply: RpcReplyPort<Result<(), QueueError>>,
    },

    /// Replace a queue instance with one using new parameters.
    ReconfigureQueue {
        name: String,
        params: QueueParams,
        reply: RpcReplyPort<Result<QueueInfo, QueueError>>,
    },

    /// List all queues.
    ListQueues { reply: RpcReplyPort<Vec<QueueInfo>> },

    /// Periodic tick for housekeeping.
    Tick,

    /// Flush every queue and stop.
    Shutdown,
}

/// Errors raised while running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Actor error: {0}")]
    Actor(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn actor: {0}")]
    Spawn(#[from] ractor::SpawnErr),

    #[error("Database error: {0}")]
    Database(#[from] db::DbError),
}
