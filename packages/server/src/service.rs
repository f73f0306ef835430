//! Command dispatch: one request line in, one reply line out.

use std::net::IpAddr;
use std::sync::Arc;

use netschedule_core::{
    Command, ErrorCode, JobDescriptor, NotificationKind, QueueError, Reply,
};
use ractor::ActorRef;

use crate::messages::{ServerError, SupervisorMessage};
use crate::queue::JobFilter;
use crate::registry::QueueRegistry;
use crate::supervisor;

/// Executes wire commands against the live queues.
#[derive(Debug, Clone)]
pub struct QueueService {
    registry: Arc<QueueRegistry>,
    supervisor: Option<ActorRef<SupervisorMessage>>,
}

impl QueueService {
    /// `supervisor` handles `QCRE`/`QDEL`; without one they are refused.
    pub fn new(
        registry: Arc<QueueRegistry>,
        supervisor: Option<ActorRef<SupervisorMessage>>,
    ) -> Self {
        Self {
            registry,
            supervisor,
        }
    }

    /// Parse, run and encode one request line from `peer`.
    pub async fn execute(&self, peer: IpAddr, line: &str) -> String {
        let reply = match Command::parse(line) {
            Ok(command) => self.dispatch(&peer.to_string(), command).await,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "Malformed request");
                Reply::Error {
                    code: ErrorCode::Protocol,
                    message: e.to_string(),
                }
            }
        };
        reply.encode()
    }

    pub async fn dispatch(&self, host: &str, command: Command) -> Reply {
        match command {
            Command::CreateQueue { queue, class } => {
                let Some(supervisor) = &self.supervisor else {
                    return unsupported("QCRE");
                };
                match supervisor::create_queue(supervisor, &queue, Some(&class), None).await {
                    Ok(_) => Reply::Ok,
                    Err(e) => server_error(e),
                }
            }
            Command::DeleteQueue { queue } => {
                let Some(supervisor) = &self.supervisor else {
                    return unsupported("QDEL");
                };
                match supervisor::delete_queue(supervisor, &queue).await {
                    Ok(()) => Reply::Ok,
                    Err(e) => server_error(e),
                }
            }
            command => self
                .run(host, command)
                .await
                .unwrap_or_else(|e| Reply::error(&e)),
        }
    }

    async fn run(&self, host: &str, command: Command) -> Result<Reply, QueueError> {
        let queue = self.registry.get(command.queue())?;
        let reply = match command {
            Command::Submit { spec, .. } => Reply::Submitted(queue.submit(spec, host).await?),

            Command::Get {
                client,
                affinities,
                any_affinity,
                group,
                wait,
                ..
            } => {
                let filter = JobFilter {
                    affinities,
                    any_affinity,
                    group,
                };
                match queue.try_get(&client, &filter, host).await? {
                    Some(job) => Reply::Job(JobDescriptor::from(&job)),
                    None => {
                        if let Some(wait) = &wait {
                            queue.register_listener(
                                host,
                                &client,
                                NotificationKind::Get,
                                wait,
                                &filter,
                            );
                        }
                        Reply::NoJob {
                            more_jobs: queue.more_jobs(NotificationKind::Get),
                        }
                    }
                }
            }

            Command::Put {
                client,
                job,
                output,
                ..
            } => {
                queue.complete(&client, job, output).await?;
                Reply::Ok
            }

            Command::Fail {
                client, job, error, ..
            } => {
                queue.fail(&client, job, error).await?;
                Reply::Ok
            }

            Command::Return { client, job, .. } => {
                queue.return_job(&client, job).await?;
                Reply::Ok
            }

            Command::SetAffinity {
                client,
                add,
                remove,
                ..
            } => {
                queue.set_affinity(&client, &add, &remove)?;
                Reply::Ok
            }

            Command::Read { client, wait, .. } => match queue.try_read(&client, host).await? {
                Some(job) => Reply::Job(JobDescriptor::from(&job)),
                None => {
                    if let Some(wait) = &wait {
                        queue.register_listener(
                            host,
                            &client,
                            NotificationKind::Read,
                            wait,
                            &JobFilter::default(),
                        );
                    }
                    Reply::NoJob {
                        more_jobs: queue.more_jobs(NotificationKind::Read),
                    }
                }
            },

            Command::Confirm { client, job, .. } => {
                queue.confirm_read(&client, job).await?;
                Reply::Ok
            }

            Command::ReadFail {
                client, job, error, ..
            } => {
                queue.fail_read(&client, job, error).await?;
                Reply::Ok
            }

            Command::Cancel { job, .. } => {
                queue.cancel(job).await?;
                Reply::Ok
            }

            Command::Status { job, .. } => Reply::Status(queue.status(job)?),

            Command::Stat { .. } => Reply::Stats(queue.stats()),

            Command::CreateQueue { .. } => unsupported("QCRE"),
            Command::DeleteQueue { .. } => unsupported("QDEL"),
        };
        Ok(reply)
    }
}

fn unsupported(verb: &str) -> Reply {
    Reply::Error {
        code: ErrorCode::Internal,
        message: format!("{} is not available on this server", verb),
    }
}

fn server_error(err: ServerError) -> Reply {
    match err {
        ServerError::Queue(e) => Reply::error(&e),
        other => Reply::Error {
            code: ErrorCode::Internal,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use db::MemoryJobStore;
    use netschedule_core::{
        JobId, JobSpec, JobStatus, QueueKind, ServerAddress, WaitRequest, WorkerId,
    };

    use super::*;
    use crate::notifier::testing::RecordingNotifier;
    use crate::queue::{Queue, QueueContext};

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));

    async fn service() -> (QueueService, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let context = QueueContext {
            store: Arc::new(MemoryJobStore::new()),
            notifier: notifier.clone(),
            server: ServerAddress::new("ns1", 9100),
        };
        let registry = Arc::new(QueueRegistry::new());
        let queue = Queue::open("render", QueueKind::Static, None, context)
            .await
            .unwrap();
        registry.insert(Arc::new(queue)).unwrap();
        (QueueService::new(registry, None), notifier)
    }

    async fn send(service: &QueueService, command: Command) -> Reply {
        Reply::parse(&service.execute(PEER, &command.encode()).await).unwrap()
    }

    fn get(client: &str, wait: Option<WaitRequest>) -> Command {
        Command::Get {
            queue: "render".into(),
            client: WorkerId::new(client),
            affinities: Vec::new(),
            any_affinity: false,
            group: None,
            wait,
        }
    }

    #[tokio::test]
    async fn submit_get_put_round() {
        let (service, _) = service().await;
        let reply = send(
            &service,
            Command::Submit {
                queue: "render".into(),
                spec: JobSpec::new("frame 1"),
            },
        )
        .await;
        assert_eq!(reply, Reply::Submitted(JobId(1)));

        let Reply::Job(job) = send(&service, get("wn1", None)).await else {
            panic!("expected a job");
        };
        assert_eq!(job.input, "frame 1");

        let reply = send(
            &service,
            Command::Put {
                queue: "render".into(),
                client: WorkerId::new("wn1"),
                job: job.id,
                output: "ok".into(),
            },
        )
        .await;
        assert_eq!(reply, Reply::Ok);

        let reply = send(
            &service,
            Command::Status {
                queue: "render".into(),
                job: job.id,
            },
        )
        .await;
        assert_eq!(reply, Reply::Status(JobStatus::Done));
    }

    #[tokio::test]
    async fn empty_get_registers_listener_and_hints() {
        let (service, notifier) = service().await;
        let wait = WaitRequest {
            port: 9200,
            timeout: Some(Duration::from_secs(30)),
        };
        let reply = send(&service, get("wn1", Some(wait))).await;
        assert_eq!(reply, Reply::NoJob { more_jobs: false });

        send(
            &service,
            Command::Submit {
                queue: "render".into(),
                spec: JobSpec::new("x"),
            },
        )
        .await;
        let sent = notifier.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.to_string(), "10.0.0.5:9200");
    }

    #[tokio::test]
    async fn errors_carry_codes() {
        let (service, _) = service().await;
        let reply = send(
            &service,
            Command::Stat {
                queue: "missing".into(),
            },
        )
        .await;
        assert!(matches!(
            reply,
            Reply::Error {
                code: ErrorCode::QueueNotFound,
                ..
            }
        ));

        let reply = send(
            &service,
            Command::Return {
                queue: "render".into(),
                client: WorkerId::new("wn1"),
                job: JobId(42),
            },
        )
        .await;
        assert!(matches!(
            reply,
            Reply::Error {
                code: ErrorCode::JobNotFound,
                ..
            }
        ));

        let line = service.execute(PEER, "BOGUS queue=render").await;
        assert!(line.starts_with("ERR:"));
        assert!(matches!(
            Reply::parse(&line).unwrap(),
            Reply::Error {
                code: ErrorCode::Protocol,
                ..
            }
        ));

        let reply = send(
            &service,
            Command::DeleteQueue {
                queue: "render".into(),
            },
        )
        .await;
        assert!(matches!(
            reply,
            Reply::Error {
                code: ErrorCode::Internal,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn read_side_over_the_wire() {
        let (service, _) = service().await;
        send(
            &service,
            Command::Submit {
                queue: "render".into(),
                spec: JobSpec::new("a"),
            },
        )
        .await;
        let Reply::Job(job) = send(&service, get("wn1", None)).await else {
            panic!("expected a job");
        };
        send(
            &service,
            Command::Put {
                queue: "render".into(),
                client: WorkerId::new("wn1"),
                job: job.id,
                output: "result".into(),
            },
        )
        .await;

        let read = Command::Read {
            queue: "render".into(),
            client: WorkerId::new("reader"),
            wait: None,
        };
        let Reply::Job(done) = send(&service, read.clone()).await else {
            panic!("expected a finished job");
        };
        assert_eq!(done.output.as_deref(), Some("result"));
        assert_eq!(
            send(&service, read).await,
            Reply::NoJob { more_jobs: true }
        );

        let reply = send(
            &service,
            Command::Confirm {
                queue: "render".into(),
                client: WorkerId::new("reader"),
                job: done.id,
            },
        )
        .await;
        assert_eq!(reply, Reply::Ok);

        let Reply::Stats(stats) = send(
            &service,
            Command::Stat {
                queue: "render".into(),
            },
        )
        .await
        else {
            panic!("expected stats");
        };
        assert_eq!(stats.count(JobStatus::Confirmed), 1);
        assert_eq!(stats.submitted, 1);
    }
}
