//! Server over real sockets: TCP requests and UDP notifications.

use std::collections::BTreeMap;
use std::time::Duration;

use netschedule_core::{
    Command, ErrorCode, JobSpec, MAX_LINE_LEN, Notification, NotificationKind, Reply,
    WaitRequest, WorkerId,
};
use netschedule_server::{QueueConfig, ServerConfig, start};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(addr: std::net::SocketAddr) -> Self {
        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send(&mut self, command: Command) -> Reply {
        let line = format!("{}\n", command.encode());
        self.writer.write_all(line.as_bytes()).await.unwrap();
        let reply = self.lines.next_line().await.unwrap().unwrap();
        Reply::parse(&reply).unwrap()
    }
}

fn config() -> ServerConfig {
    ServerConfig {
        listen: "127.0.0.1:0".into(),
        udp_bind: "127.0.0.1:0".into(),
        queues: BTreeMap::from([("render".to_string(), QueueConfig::default())]),
        ..Default::default()
    }
}

#[tokio::test]
async fn requests_and_notifications_over_sockets() {
    let shutdown = CancellationToken::new();
    let server = start(config(), shutdown.clone()).await.unwrap();
    let mut conn = Connection::open(server.local_addr()).await;

    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = udp.local_addr().unwrap().port();

    let reply = conn
        .send(Command::Get {
            queue: "render".into(),
            client: WorkerId::new("wn1"),
            affinities: Vec::new(),
            any_affinity: false,
            group: None,
            wait: Some(WaitRequest {
                port,
                timeout: Some(Duration::from_secs(30)),
            }),
        })
        .await;
    assert_eq!(reply, Reply::NoJob { more_jobs: false });

    let reply = conn
        .send(Command::Submit {
            queue: "render".into(),
            spec: JobSpec::new("frame 7"),
        })
        .await;
    assert!(matches!(reply, Reply::Submitted(_)));

    let mut buf = [0u8; 1024];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), udp.recv_from(&mut buf))
        .await
        .expect("notification within timeout")
        .unwrap();
    let notification = Notification::parse(&buf[..len]).unwrap();
    assert_eq!(notification.kind, NotificationKind::Get);
    assert_eq!(notification.queue, "render");
    assert_eq!(&notification.server, server.node());

    let Reply::Job(job) = conn
        .send(Command::Get {
            queue: "render".into(),
            client: WorkerId::new("wn1"),
            affinities: Vec::new(),
            any_affinity: false,
            group: None,
            wait: None,
        })
        .await
    else {
        panic!("expected a job");
    };
    assert_eq!(job.input, "frame 7");

    shutdown.cancel();
    server.stopped().await.unwrap();
}

#[tokio::test]
async fn dynamic_queues_over_the_wire() {
    let mut config = config();
    config
        .classes
        .insert("scratch".into(), Default::default());

    let shutdown = CancellationToken::new();
    let server = start(config, shutdown.clone()).await.unwrap();
    let mut conn = Connection::open(server.local_addr()).await;

    let reply = conn
        .send(Command::CreateQueue {
            queue: "tmp".into(),
            class: "scratch".into(),
        })
        .await;
    assert_eq!(reply, Reply::Ok);
    assert!(server.registry().contains("tmp"));

    let reply = conn
        .send(Command::DeleteQueue {
            queue: "render".into(),
        })
        .await;
    assert!(matches!(reply, Reply::Error { .. }));

    let reply = conn
        .send(Command::DeleteQueue {
            queue: "tmp".into(),
        })
        .await;
    assert_eq!(reply, Reply::Ok);
    assert!(!server.registry().contains("tmp"));

    shutdown.cancel();
    server.stopped().await.unwrap();
}

#[tokio::test]
async fn over_long_request_line_is_rejected_and_the_connection_survives() {
    let shutdown = CancellationToken::new();
    let server = start(config(), shutdown.clone()).await.unwrap();
    let mut conn = Connection::open(server.local_addr()).await;

    let huge = format!("SUBMIT queue=render&input={}\n", "x".repeat(MAX_LINE_LEN));
    conn.writer.write_all(huge.as_bytes()).await.unwrap();
    let reply = conn.lines.next_line().await.unwrap().unwrap();
    let Reply::Error { code, .. } = Reply::parse(&reply).unwrap() else {
        panic!("expected an error reply, got {reply}");
    };
    assert_eq!(code, ErrorCode::Protocol);

    let reply = conn
        .send(Command::Stat {
            queue: "render".into(),
        })
        .await;
    assert!(matches!(reply, Reply::Stats(_)));

    shutdown.cancel();
    server.stopped().await.unwrap();
}
