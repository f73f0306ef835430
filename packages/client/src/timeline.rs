//! Polling scheduler over a changing set of queue servers.
//!
//! A [`Timeline`] keeps two collections: servers to try right now
//! (`immediate`) and servers deferred until a deadline (`scheduled`). A
//! single discovery entry lives in one of them at all times and
//! periodically re-enumerates the servers. Servers that hand out work go to
//! the back of `immediate`; servers with nothing are deferred by the retry
//! timeout; unreachable servers are dropped until the next discovery.
//! Notifications pull deferred servers forward.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use netschedule_core::{JobDescriptor, Reply, ServerAddress, WaitRequest};
use tokio::time::Instant;

use crate::channel::{JobChannel, ServiceDiscovery, call};
use crate::config::TimelineConfig;
use crate::error::{ClientError, RpcError};
use crate::modes::PollMode;
use crate::notifications::{ServerNotifications, WaitOutcome};

const WORKING: u8 = 0;
const RESTARTED: u8 = 1;
const STOPPED: u8 = 2;

/// Result of [`Timeline::get_job`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A job, and the server that handed it out.
    Job {
        server: ServerAddress,
        job: JobDescriptor,
    },
    /// No server expects more work.
    NoJobs,
    /// The deadline passed while some server may still get work.
    RetryLater,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Discovery,
    Server(ServerAddress),
}

impl Entry {
    fn server(&self) -> Option<&ServerAddress> {
        match self {
            Entry::Server(server) => Some(server),
            Entry::Discovery => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Scheduled {
    entry: Entry,
    deadline: Instant,
    more_jobs: bool,
}

/// Stops or restarts a timeline from another task.
#[derive(Debug, Clone)]
pub struct TimelineControl {
    state: Arc<AtomicU8>,
    notifications: Arc<ServerNotifications>,
}

impl TimelineControl {
    fn new(notifications: Arc<ServerNotifications>) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(WORKING)),
            notifications,
        }
    }

    /// Make the current and later `get_job` calls fail with
    /// [`ClientError::Interrupted`] until [`restart`](Self::restart).
    pub fn stop(&self) {
        self.state.store(STOPPED, Ordering::SeqCst);
        self.notifications.interrupt();
    }

    /// Forget every server and start over from discovery.
    pub fn restart(&self) {
        self.state.store(RESTARTED, Ordering::SeqCst);
        self.notifications.interrupt();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STOPPED
    }
}

pub struct Timeline<M> {
    mode: M,
    channel: Arc<dyn JobChannel>,
    discovery: Arc<dyn ServiceDiscovery>,
    notifications: Arc<ServerNotifications>,
    config: TimelineConfig,
    wait_port: Option<u16>,
    control: TimelineControl,
    immediate: VecDeque<Entry>,
    scheduled: Vec<Scheduled>,
}

impl<M: PollMode> Timeline<M> {
    pub fn new(
        mode: M,
        channel: Arc<dyn JobChannel>,
        discovery: Arc<dyn ServiceDiscovery>,
        notifications: Arc<ServerNotifications>,
        config: TimelineConfig,
    ) -> Self {
        let control = TimelineControl::new(notifications.clone());
        Self {
            mode,
            channel,
            discovery,
            notifications,
            config,
            wait_port: None,
            control,
            immediate: VecDeque::from([Entry::Discovery]),
            scheduled: Vec::new(),
        }
    }

    /// Ask servers that have nothing to notify this UDP port.
    pub fn with_wait_port(mut self, port: u16) -> Self {
        self.wait_port = Some(port);
        self
    }

    pub fn control(&self) -> TimelineControl {
        self.control.clone()
    }

    pub fn mode(&self) -> &M {
        &self.mode
    }

    /// Servers due for polling, in order.
    pub fn immediate_servers(&self) -> Vec<ServerAddress> {
        self.immediate
            .iter()
            .filter_map(Entry::server)
            .cloned()
            .collect()
    }

    /// Deferred servers and when they become due, earliest first.
    pub fn scheduled_servers(&self) -> Vec<(ServerAddress, Instant)> {
        self.scheduled
            .iter()
            .filter_map(|s| s.entry.server().map(|server| (server.clone(), s.deadline)))
            .collect()
    }

    /// Number of discovery entries; always one.
    pub fn discovery_entries(&self) -> usize {
        self.immediate
            .iter()
            .chain(self.scheduled.iter().map(|s| &s.entry))
            .filter(|e| **e == Entry::Discovery)
            .count()
    }

    /// Poll servers until one hands out a job, none expects work, or
    /// `deadline` passes.
    ///
    /// The deadline is checked before every request, so a call overruns it
    /// by at most one request timeout.
    pub async fn get_job(&mut self, deadline: Instant) -> Result<Outcome, ClientError> {
        loop {
            self.check_state()?;
            self.promote_due(Instant::now());

            while !self.immediate.is_empty() {
                self.check_state()?;
                // Servers not asked yet keep their place for the next call.
                if Instant::now() >= deadline {
                    return Ok(Outcome::RetryLater);
                }
                let Some(entry) = self.immediate.pop_front() else {
                    break;
                };
                match entry {
                    Entry::Discovery => self.discover().await,
                    Entry::Server(server) => {
                        if let Some(job) = self.poll(&server).await {
                            self.immediate.push_back(Entry::Server(server.clone()));
                            return Ok(Outcome::Job { server, job });
                        }
                    }
                }
                for server in self.notifications.drain() {
                    self.promote(server);
                }
            }

            if !self.scheduled.iter().any(|s| s.more_jobs) {
                return Ok(Outcome::NoJobs);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Outcome::RetryLater);
            }

            let wake_at = self
                .scheduled
                .first()
                .map_or(deadline, |s| s.deadline.min(deadline));
            match self.notifications.wait(wake_at).await {
                WaitOutcome::Notified(server) => self.promote(server),
                WaitOutcome::Interrupted | WaitOutcome::TimedOut => {}
            }
        }
    }

    fn check_state(&mut self) -> Result<(), ClientError> {
        match self.control.state.load(Ordering::SeqCst) {
            STOPPED => Err(ClientError::Interrupted),
            RESTARTED => {
                if self
                    .control
                    .state
                    .compare_exchange(RESTARTED, WORKING, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    tracing::debug!("Timeline restarted");
                    self.immediate.clear();
                    self.scheduled.clear();
                    self.immediate.push_back(Entry::Discovery);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn promote_due(&mut self, now: Instant) {
        let due = self.scheduled.partition_point(|s| s.deadline <= now);
        for s in self.scheduled.drain(..due) {
            self.immediate.push_back(s.entry);
        }
    }

    /// Move `server` to `immediate` unless it is already there.
    fn promote(&mut self, server: ServerAddress) {
        let entry = Entry::Server(server);
        if self.immediate.contains(&entry) {
            return;
        }
        self.scheduled.retain(|s| s.entry != entry);
        self.immediate.push_back(entry);
    }

    fn schedule(&mut self, entry: Entry, deadline: Instant, more_jobs: bool) {
        let at = self.scheduled.partition_point(|s| s.deadline <= deadline);
        self.scheduled.insert(
            at,
            Scheduled {
                entry,
                deadline,
                more_jobs,
            },
        );
    }

    async fn discover(&mut self) {
        let next = Instant::now() + self.config.discovery_period;
        let servers = match self.discovery.discover().await {
            Ok(servers) => servers,
            Err(e) => {
                tracing::warn!(error = %e, "Server discovery failed");
                self.schedule(Entry::Discovery, next, false);
                return;
            }
        };

        let mut dropped = Vec::new();
        let mut keep = |entry: &Entry| match entry.server() {
            Some(server) if !servers.contains(server) => {
                dropped.push(server.clone());
                false
            }
            _ => true,
        };
        self.immediate.retain(|e| keep(e));
        self.scheduled.retain(|s| keep(&s.entry));
        for server in &dropped {
            self.mode.disconnected(server);
        }

        let mut added = 0;
        for server in &servers {
            let entry = Entry::Server(server.clone());
            let known = self.immediate.contains(&entry)
                || self.scheduled.iter().any(|s| s.entry == entry);
            if !known {
                self.immediate.push_back(entry);
                added += 1;
            }
        }
        tracing::debug!(
            servers = servers.len(),
            added,
            dropped = dropped.len(),
            "Servers discovered"
        );
        self.schedule(Entry::Discovery, next, false);
    }

    /// One request against `server`; reschedules or drops it unless a job
    /// comes back.
    async fn poll(&mut self, server: &ServerAddress) -> Option<JobDescriptor> {
        if let Some(command) = self.mode.prepare(server) {
            match call(self.channel.as_ref(), server, &command).await {
                Ok(_) => self.mode.prepared(server),
                Err(e) if e.is_connection_failure() => {
                    self.disconnect(server, &e);
                    return None;
                }
                Err(e) => {
                    tracing::warn!(%server, error = %e, command = command.verb(), "Preparation failed");
                }
            }
        }

        let wait = self.wait_port.map(|port| WaitRequest {
            port,
            timeout: None,
        });
        let command = self.mode.request(wait);
        let retry_at = Instant::now() + self.config.retry_timeout;
        match call(self.channel.as_ref(), server, &command).await {
            Ok(Reply::Job(job)) => {
                tracing::debug!(%server, job_id = %job.id, "Job received");
                Some(job)
            }
            Ok(Reply::NoJob { more_jobs }) => {
                self.schedule(Entry::Server(server.clone()), retry_at, more_jobs);
                None
            }
            Ok(reply) => {
                tracing::warn!(%server, ?reply, "Unexpected reply");
                self.schedule(Entry::Server(server.clone()), retry_at, false);
                None
            }
            Err(e) if e.is_connection_failure() => {
                self.disconnect(server, &e);
                None
            }
            Err(e) => {
                tracing::warn!(%server, error = %e, command = command.verb(), "Request failed");
                self.schedule(Entry::Server(server.clone()), retry_at, false);
                None
            }
        }
    }

    fn disconnect(&mut self, server: &ServerAddress, error: &RpcError) {
        tracing::warn!(%server, %error, "Dropping unreachable server until next discovery");
        self.mode.disconnected(server);
    }
}
