//! Worker side: take jobs, run them elsewhere, report back.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use netschedule_core::{Command, JobId, Reply, ServerAddress, WorkerId};
use tokio::time::Instant;

use crate::affinity::AffinityPreferences;
use crate::channel::{JobChannel, call};
use crate::error::ClientError;
use crate::modes::GetMode;
use crate::timeline::{Outcome, Timeline, TimelineControl};

/// Pulls Pending jobs from every discovered server.
///
/// Completion, failure and return go to the server that handed the job
/// out, which is carried in [`Outcome::Job`].
pub struct JobExecutor {
    queue: String,
    client: WorkerId,
    channel: Arc<dyn JobChannel>,
    affinities: Arc<Mutex<AffinityPreferences>>,
    timeline: Timeline<GetMode>,
}

impl JobExecutor {
    pub(crate) fn new(
        queue: String,
        client: WorkerId,
        channel: Arc<dyn JobChannel>,
        affinities: Arc<Mutex<AffinityPreferences>>,
        timeline: Timeline<GetMode>,
    ) -> Self {
        Self {
            queue,
            client,
            channel,
            affinities,
            timeline,
        }
    }

    /// Wait up to `timeout` for a job.
    pub async fn get_job(&mut self, timeout: Duration) -> Result<Outcome, ClientError> {
        self.timeline.get_job(Instant::now() + timeout).await
    }

    pub async fn put_result(
        &self,
        server: &ServerAddress,
        job: JobId,
        output: impl Into<String>,
    ) -> Result<(), ClientError> {
        let command = Command::Put {
            queue: self.queue.clone(),
            client: self.client.clone(),
            job,
            output: output.into(),
        };
        self.acknowledge(server, &command).await
    }

    /// Report a failed run; the server decides whether it is retried.
    pub async fn fail_job(
        &self,
        server: &ServerAddress,
        job: JobId,
        error: impl Into<String>,
    ) -> Result<(), ClientError> {
        let command = Command::Fail {
            queue: self.queue.clone(),
            client: self.client.clone(),
            job,
            error: error.into(),
        };
        self.acknowledge(server, &command).await
    }

    /// Hand a job back unrun.
    pub async fn return_job(&self, server: &ServerAddress, job: JobId) -> Result<(), ClientError> {
        let command = Command::Return {
            queue: self.queue.clone(),
            client: self.client.clone(),
            job,
        };
        self.acknowledge(server, &command).await
    }

    /// Prefer jobs with `token`. Servers learn about it before their next poll.
    pub fn claim_affinity(&self, token: &str) -> Result<bool, ClientError> {
        Ok(self.preferences().claim(token)?)
    }

    pub fn release_affinity(&self, token: &str) -> bool {
        self.preferences().release(token)
    }

    pub fn affinities(&self) -> Vec<String> {
        self.preferences().claimed().map(str::to_string).collect()
    }

    pub fn control(&self) -> TimelineControl {
        self.timeline.control()
    }

    pub fn timeline(&self) -> &Timeline<GetMode> {
        &self.timeline
    }

    fn preferences(&self) -> std::sync::MutexGuard<'_, AffinityPreferences> {
        self.affinities.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn acknowledge(&self, server: &ServerAddress, command: &Command) -> Result<(), ClientError> {
        match call(self.channel.as_ref(), server, command).await? {
            Reply::Ok => Ok(()),
            reply => Err(ClientError::unexpected(&reply)),
        }
    }
}
