//! Entry point of the client API.

use std::sync::{Arc, Mutex};

use netschedule_core::{Command, JobId, JobSpec, JobStatus, QueueStats, Reply, ServerAddress};

use crate::affinity::AffinityPreferences;
use crate::channel::{JobChannel, ServiceDiscovery, TcpChannel, call};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::executor::JobExecutor;
use crate::listener::NotificationListener;
use crate::modes::{GetMode, PollMode, ReadMode};
use crate::reader::JobReader;
use crate::timeline::Timeline;

/// One queue, seen from a submitter, worker or reader.
///
/// Owns the notification listener; every executor and reader created
/// from it shares that socket but waits on a ready set of its own.
pub struct NetScheduleClient {
    config: ClientConfig,
    channel: Arc<dyn JobChannel>,
    discovery: Arc<dyn ServiceDiscovery>,
    listener: NotificationListener,
}

impl NetScheduleClient {
    /// Client talking TCP, with the configured receive timeout.
    pub async fn connect(
        config: ClientConfig,
        discovery: Arc<dyn ServiceDiscovery>,
    ) -> Result<Self, ClientError> {
        let channel = Arc::new(TcpChannel::new(config.receive_timeout));
        Self::new(config, channel, discovery).await
    }

    pub async fn new(
        config: ClientConfig,
        channel: Arc<dyn JobChannel>,
        discovery: Arc<dyn ServiceDiscovery>,
    ) -> Result<Self, ClientError> {
        netschedule_core::validate_token("queue", &config.queue)?;
        let listener =
            NotificationListener::bind(&config.notification_bind, config.queue.clone()).await?;
        Ok(Self {
            config,
            channel,
            discovery,
            listener,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn listener(&self) -> &NotificationListener {
        &self.listener
    }

    pub fn executor(&self) -> JobExecutor {
        let affinities = Arc::new(Mutex::new(AffinityPreferences::new(
            self.config.queue.clone(),
            self.config.client.clone(),
        )));
        let mode = GetMode::new(
            self.config.queue.clone(),
            self.config.client.clone(),
            affinities.clone(),
        );
        let timeline = self.timeline(mode);
        JobExecutor::new(
            self.config.queue.clone(),
            self.config.client.clone(),
            self.channel.clone(),
            affinities,
            timeline,
        )
    }

    pub fn reader(&self) -> JobReader {
        let mode = ReadMode::new(self.config.queue.clone(), self.config.client.clone());
        let timeline = self.timeline(mode);
        JobReader::new(
            self.config.queue.clone(),
            self.config.client.clone(),
            self.channel.clone(),
            timeline,
        )
    }

    fn timeline<M: PollMode>(&self, mode: M) -> Timeline<M> {
        let notifications = self.listener.subscribe(mode.kind());
        Timeline::new(
            mode,
            self.channel.clone(),
            self.discovery.clone(),
            notifications,
            self.config.timeline.clone(),
        )
        .with_wait_port(self.listener.port())
    }

    /// Submit to one server; tokens are checked before anything is sent.
    pub async fn submit(&self, server: &ServerAddress, spec: JobSpec) -> Result<JobId, ClientError> {
        spec.validate()?;
        let command = Command::Submit {
            queue: self.config.queue.clone(),
            spec,
        };
        match call(self.channel.as_ref(), server, &command).await? {
            Reply::Submitted(id) => {
                tracing::debug!(%server, job_id = %id, "Job submitted");
                Ok(id)
            }
            reply => Err(ClientError::unexpected(&reply)),
        }
    }

    pub async fn status(&self, server: &ServerAddress, job: JobId) -> Result<JobStatus, ClientError> {
        let command = Command::Status {
            queue: self.config.queue.clone(),
            job,
        };
        match call(self.channel.as_ref(), server, &command).await? {
            Reply::Status(status) => Ok(status),
            reply => Err(ClientError::unexpected(&reply)),
        }
    }

    pub async fn cancel(&self, server: &ServerAddress, job: JobId) -> Result<(), ClientError> {
        let command = Command::Cancel {
            queue: self.config.queue.clone(),
            job,
        };
        match call(self.channel.as_ref(), server, &command).await? {
            Reply::Ok => Ok(()),
            reply => Err(ClientError::unexpected(&reply)),
        }
    }

    pub async fn stats(&self, server: &ServerAddress) -> Result<QueueStats, ClientError> {
        let command = Command::Stat {
            queue: self.config.queue.clone(),
        };
        match call(self.channel.as_ref(), server, &command).await? {
            Reply::Stats(stats) => Ok(stats),
            reply => Err(ClientError::unexpected(&reply)),
        }
    }

    /// Stop the notification listener.
    pub fn shutdown(&self) {
        self.listener.shutdown();
    }
}
