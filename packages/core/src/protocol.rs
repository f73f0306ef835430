//! Text-line command and reply codec.
//!
//! A request is one line: `VERB form-urlencoded-args`, e.g.
//! `GET2 queue=render&client=wn7&aff=gpu,big&port=9200`. A reply is one
//! line: `OK:<form-urlencoded-fields>` or `ERR:<code>:<message>`.

use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;

use url::form_urlencoded;

use crate::error::{ErrorCode, ProtocolError, QueueError};
use crate::job::{Job, JobId, JobSpec, JobStatus, WorkerId};
use crate::queue::QueueStats;

/// Longest request or reply line either side accepts, newline excluded.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Register-for-notification part of a `GET2`/`READ` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitRequest {
    /// UDP port the client listens on.
    pub port: u16,
    /// Registration lifetime; the queue default applies when absent.
    pub timeout: Option<Duration>,
}

/// Requests understood by a queue server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Submit {
        queue: String,
        spec: JobSpec,
    },
    Get {
        queue: String,
        client: WorkerId,
        affinities: Vec<String>,
        any_affinity: bool,
        group: Option<String>,
        wait: Option<WaitRequest>,
    },
    Put {
        queue: String,
        client: WorkerId,
        job: JobId,
        output: String,
    },
    Fail {
        queue: String,
        client: WorkerId,
        job: JobId,
        error: String,
    },
    Return {
        queue: String,
        client: WorkerId,
        job: JobId,
    },
    SetAffinity {
        queue: String,
        client: WorkerId,
        add: Vec<String>,
        remove: Vec<String>,
    },
    Read {
        queue: String,
        client: WorkerId,
        wait: Option<WaitRequest>,
    },
    Confirm {
        queue: String,
        client: WorkerId,
        job: JobId,
    },
    ReadFail {
        queue: String,
        client: WorkerId,
        job: JobId,
        error: String,
    },
    Cancel {
        queue: String,
        job: JobId,
    },
    Status {
        queue: String,
        job: JobId,
    },
    Stat {
        queue: String,
    },
    CreateQueue {
        queue: String,
        class: String,
    },
    DeleteQueue {
        queue: String,
    },
}

impl Command {
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Submit { .. } => "SUBMIT",
            Command::Get { .. } => "GET2",
            Command::Put { .. } => "PUT",
            Command::Fail { .. } => "FPUT",
            Command::Return { .. } => "RETURN",
            Command::SetAffinity { .. } => "SETAFF",
            Command::Read { .. } => "READ",
            Command::Confirm { .. } => "CONFIRM",
            Command::ReadFail { .. } => "READFAIL",
            Command::Cancel { .. } => "CANCEL",
            Command::Status { .. } => "STATUS",
            Command::Stat { .. } => "STAT",
            Command::CreateQueue { .. } => "QCRE",
            Command::DeleteQueue { .. } => "QDEL",
        }
    }

    /// Queue the command addresses.
    pub fn queue(&self) -> &str {
        match self {
            Command::Submit { queue, .. }
            | Command::Get { queue, .. }
            | Command::Put { queue, .. }
            | Command::Fail { queue, .. }
            | Command::Return { queue, .. }
            | Command::SetAffinity { queue, .. }
            | Command::Read { queue, .. }
            | Command::Confirm { queue, .. }
            | Command::ReadFail { queue, .. }
            | Command::Cancel { queue, .. }
            | Command::Status { queue, .. }
            | Command::Stat { queue }
            | Command::CreateQueue { queue, .. }
            | Command::DeleteQueue { queue } => queue,
        }
    }

    /// Encode as a single request line without the trailing newline.
    pub fn encode(&self) -> String {
        let mut form = form_urlencoded::Serializer::new(String::new());
        form.append_pair("queue", self.queue());
        match self {
            Command::Submit { spec, .. } => {
                form.append_pair("input", &spec.input);
                if let Some(affinity) = &spec.affinity {
                    form.append_pair("aff", affinity);
                }
                if let Some(group) = &spec.group {
                    form.append_pair("group", group);
                }
            }
            Command::Get {
                client,
                affinities,
                any_affinity,
                group,
                wait,
                ..
            } => {
                form.append_pair("client", client.as_str());
                if !affinities.is_empty() {
                    form.append_pair("aff", &affinities.join(","));
                }
                if *any_affinity {
                    form.append_pair("any_aff", "1");
                }
                if let Some(group) = group {
                    form.append_pair("group", group);
                }
                append_wait(&mut form, wait.as_ref());
            }
            Command::Put {
                client,
                job,
                output,
                ..
            } => {
                form.append_pair("client", client.as_str());
                form.append_pair("job_key", &job.to_string());
                form.append_pair("output", output);
            }
            Command::Fail {
                client, job, error, ..
            }
            | Command::ReadFail {
                client, job, error, ..
            } => {
                form.append_pair("client", client.as_str());
                form.append_pair("job_key", &job.to_string());
                form.append_pair("err_msg", error);
            }
            Command::Return { client, job, .. } | Command::Confirm { client, job, .. } => {
                form.append_pair("client", client.as_str());
                form.append_pair("job_key", &job.to_string());
            }
            Command::SetAffinity {
                client,
                add,
                remove,
                ..
            } => {
                form.append_pair("client", client.as_str());
                if !add.is_empty() {
                    form.append_pair("add", &add.join(","));
                }
                if !remove.is_empty() {
                    form.append_pair("del", &remove.join(","));
                }
            }
            Command::Read { client, wait, .. } => {
                form.append_pair("client", client.as_str());
                append_wait(&mut form, wait.as_ref());
            }
            Command::Cancel { job, .. } | Command::Status { job, .. } => {
                form.append_pair("job_key", &job.to_string());
            }
            Command::CreateQueue { class, .. } => {
                form.append_pair("class", class);
            }
            Command::Stat { .. } | Command::DeleteQueue { .. } => {}
        }
        format!("{} {}", self.verb(), form.finish())
    }

    /// Parse one request line.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ProtocolError::Empty);
        }
        let (verb, args) = line.split_once(' ').unwrap_or((line, ""));
        let fields = Fields::parse(args.as_bytes());
        let queue = fields.required("queue")?.to_string();
        let command = match verb {
            "SUBMIT" => Command::Submit {
                queue,
                spec: JobSpec {
                    input: fields.get("input").unwrap_or_default().to_string(),
                    affinity: fields.optional("aff"),
                    group: fields.optional("group"),
                },
            },
            "GET2" => Command::Get {
                queue,
                client: fields.client()?,
                affinities: fields.list("aff"),
                any_affinity: fields.flag("any_aff"),
                group: fields.optional("group"),
                wait: fields.wait()?,
            },
            "PUT" => Command::Put {
                queue,
                client: fields.client()?,
                job: fields.job_key()?,
                output: fields.get("output").unwrap_or_default().to_string(),
            },
            "FPUT" => Command::Fail {
                queue,
                client: fields.client()?,
                job: fields.job_key()?,
                error: fields.get("err_msg").unwrap_or_default().to_string(),
            },
            "RETURN" => Command::Return {
                queue,
                client: fields.client()?,
                job: fields.job_key()?,
            },
            "SETAFF" => Command::SetAffinity {
                queue,
                client: fields.client()?,
                add: fields.list("add"),
                remove: fields.list("del"),
            },
            "READ" => Command::Read {
                queue,
                client: fields.client()?,
                wait: fields.wait()?,
            },
            "CONFIRM" => Command::Confirm {
                queue,
                client: fields.client()?,
                job: fields.job_key()?,
            },
            "READFAIL" => Command::ReadFail {
                queue,
                client: fields.client()?,
                job: fields.job_key()?,
                error: fields.get("err_msg").unwrap_or_default().to_string(),
            },
            "CANCEL" => Command::Cancel {
                queue,
                job: fields.job_key()?,
            },
            "STATUS" => Command::Status {
                queue,
                job: fields.job_key()?,
            },
            "STAT" => Command::Stat { queue },
            "QCRE" => Command::CreateQueue {
                queue,
                class: fields.required("class")?.to_string(),
            },
            "QDEL" => Command::DeleteQueue { queue },
            other => return Err(ProtocolError::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }
}

fn append_wait(form: &mut form_urlencoded::Serializer<'_, String>, wait: Option<&WaitRequest>) {
    if let Some(wait) = wait {
        form.append_pair("port", &wait.port.to_string());
        if let Some(timeout) = wait.timeout {
            form.append_pair("timeout", &timeout.as_secs().to_string());
        }
    }
}

/// Decoded form fields; later duplicates win.
struct Fields<'a>(HashMap<Cow<'a, str>, Cow<'a, str>>);

impl<'a> Fields<'a> {
    fn parse(input: &'a [u8]) -> Self {
        Fields(form_urlencoded::parse(input).collect())
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.as_ref())
    }

    fn required(&self, key: &'static str) -> Result<&str, ProtocolError> {
        self.get(key)
            .filter(|v| !v.is_empty())
            .ok_or(ProtocolError::MissingField(key))
    }

    fn optional(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.is_empty()).map(str::to_string)
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some("1" | "true" | "yes"))
    }

    fn client(&self) -> Result<WorkerId, ProtocolError> {
        self.required("client").map(WorkerId::new)
    }

    fn job_key(&self) -> Result<JobId, ProtocolError> {
        let raw = self.required("job_key")?;
        JobId::parse(raw).map_err(|_| ProtocolError::invalid("job_key", raw))
    }

    fn wait(&self) -> Result<Option<WaitRequest>, ProtocolError> {
        let Some(port) = self.get("port") else {
            return Ok(None);
        };
        let port = port
            .parse()
            .map_err(|_| ProtocolError::invalid("port", port))?;
        let timeout = match self.get("timeout") {
            Some(raw) => Some(Duration::from_secs(
                raw.parse()
                    .map_err(|_| ProtocolError::invalid("timeout", raw))?,
            )),
            None => None,
        };
        Ok(Some(WaitRequest { port, timeout }))
    }
}

/// Job as it travels to a worker or reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub id: JobId,
    pub input: String,
    pub output: Option<String>,
    pub affinity: Option<String>,
    pub group: Option<String>,
}

impl From<&Job> for JobDescriptor {
    fn from(job: &Job) -> Self {
        JobDescriptor {
            id: job.id,
            input: job.input.clone(),
            output: job.output.clone(),
            affinity: job.affinity.clone(),
            group: job.group.clone(),
        }
    }
}

/// Server replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Plain acknowledgement.
    Ok,
    Submitted(JobId),
    Job(JobDescriptor),
    /// Nothing to hand out; `more_jobs` hints that work may appear later.
    NoJob { more_jobs: bool },
    Status(JobStatus),
    Stats(QueueStats),
    Error { code: ErrorCode, message: String },
}

impl Reply {
    pub fn error(err: &QueueError) -> Self {
        Reply::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }

    pub fn encode(&self) -> String {
        let mut form = form_urlencoded::Serializer::new(String::new());
        match self {
            Reply::Ok => {}
            Reply::Submitted(id) => {
                form.append_pair("job_key", &id.to_string());
            }
            Reply::Job(job) => {
                form.append_pair("job_key", &job.id.to_string());
                form.append_pair("input", &job.input);
                if let Some(output) = &job.output {
                    form.append_pair("output", output);
                }
                if let Some(affinity) = &job.affinity {
                    form.append_pair("affinity", affinity);
                }
                if let Some(group) = &job.group {
                    form.append_pair("group", group);
                }
            }
            Reply::NoJob { more_jobs } => {
                form.append_pair("no_more_jobs", if *more_jobs { "false" } else { "true" });
            }
            Reply::Status(status) => {
                form.append_pair("status", status.as_str());
            }
            Reply::Stats(stats) => {
                let json = serde_json::to_string(stats).unwrap_or_else(|_| "{}".to_string());
                form.append_pair("stats", &json);
            }
            Reply::Error { code, message } => {
                let message = message.replace(['\r', '\n'], " ");
                return format!("ERR:{}:{}", code, message);
            }
        }
        format!("OK:{}", form.finish())
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(rest) = line.strip_prefix("ERR:") {
            let (code, message) = rest.split_once(':').unwrap_or((rest, ""));
            return Ok(Reply::Error {
                code: ErrorCode::parse(code),
                message: message.to_string(),
            });
        }
        let body = line
            .strip_prefix("OK:")
            .ok_or_else(|| ProtocolError::MalformedReply(line.to_string()))?;
        let fields = Fields::parse(body.as_bytes());

        if let Some(flag) = fields.get("no_more_jobs") {
            return Ok(Reply::NoJob {
                more_jobs: flag != "true",
            });
        }
        if let Some(raw) = fields.get("stats") {
            let stats = serde_json::from_str(raw)
                .map_err(|_| ProtocolError::MalformedReply(line.to_string()))?;
            return Ok(Reply::Stats(stats));
        }
        if let Some(raw) = fields.get("status") {
            let status = raw
                .parse()
                .map_err(|_| ProtocolError::invalid("status", raw))?;
            return Ok(Reply::Status(status));
        }
        if fields.get("input").is_some() {
            return Ok(Reply::Job(JobDescriptor {
                id: fields.job_key()?,
                input: fields.get("input").unwrap_or_default().to_string(),
                output: fields.get("output").map(str::to_string),
                affinity: fields.optional("affinity"),
                group: fields.optional("group"),
            }));
        }
        if fields.get("job_key").is_some() {
            return Ok(Reply::Submitted(fields.job_key()?));
        }
        Ok(Reply::Ok)
    }
}
