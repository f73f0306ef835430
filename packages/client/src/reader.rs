//! Reader side: collect results of finished jobs.

use std::sync::Arc;
use std::time::Duration;

use netschedule_core::{Command, JobId, Reply, ServerAddress, WorkerId};
use tokio::time::Instant;

use crate::channel::{JobChannel, call};
use crate::error::ClientError;
use crate::modes::ReadMode;
use crate::timeline::{Outcome, Timeline, TimelineControl};

pub struct JobReader {
    queue: String,
    client: WorkerId,
    channel: Arc<dyn JobChannel>,
    timeline: Timeline<ReadMode>,
}

impl JobReader {
    pub(crate) fn new(
        queue: String,
        client: WorkerId,
        channel: Arc<dyn JobChannel>,
        timeline: Timeline<ReadMode>,
    ) -> Self {
        Self {
            queue,
            client,
            channel,
            timeline,
        }
    }

    /// Wait up to `timeout` for a Done job; the job carries its output.
    pub async fn read_job(&mut self, timeout: Duration) -> Result<Outcome, ClientError> {
        self.timeline.get_job(Instant::now() + timeout).await
    }

    pub async fn confirm(&self, server: &ServerAddress, job: JobId) -> Result<(), ClientError> {
        let command = Command::Confirm {
            queue: self.queue.clone(),
            client: self.client.clone(),
            job,
        };
        self.acknowledge(server, &command).await
    }

    pub async fn read_failed(
        &self,
        server: &ServerAddress,
        job: JobId,
        error: impl Into<String>,
    ) -> Result<(), ClientError> {
        let command = Command::ReadFail {
            queue: self.queue.clone(),
            client: self.client.clone(),
            job,
            error: error.into(),
        };
        self.acknowledge(server, &command).await
    }

    pub fn control(&self) -> TimelineControl {
        self.timeline.control()
    }

    async fn acknowledge(&self, server: &ServerAddress, command: &Command) -> Result<(), ClientError> {
        match call(self.channel.as_ref(), server, command).await? {
            Reply::Ok => Ok(()),
            reply => Err(ClientError::unexpected(&reply)),
        }
    }
}
