//! Client against real servers over TCP and UDP.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use netschedule_client::{
    ClientConfig, NetScheduleClient, Outcome, StaticDiscovery, TimelineConfig,
};
use netschedule_core::{JobSpec, JobStatus, ServerAddress};
use netschedule_server::{QueueConfig, RunningServer, ServerConfig, start};
use tokio_util::sync::CancellationToken;

async fn server(shutdown: &CancellationToken) -> RunningServer {
    let config = ServerConfig {
        listen: "127.0.0.1:0".into(),
        udp_bind: "127.0.0.1:0".into(),
        queues: BTreeMap::from([("render".to_string(), QueueConfig::default())]),
        ..Default::default()
    };
    start(config, shutdown.clone()).await.unwrap()
}

async fn client(servers: Vec<ServerAddress>, retry_timeout: Duration) -> NetScheduleClient {
    let config = ClientConfig {
        notification_bind: "127.0.0.1:0".into(),
        receive_timeout: Duration::from_secs(5),
        timeline: TimelineConfig {
            retry_timeout,
            discovery_period: Duration::from_secs(60),
        },
        ..ClientConfig::new("render", "wn1")
    };
    NetScheduleClient::connect(config, Arc::new(StaticDiscovery::new(servers)))
        .await
        .unwrap()
}

async fn unused_address() -> ServerAddress {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    ServerAddress::new("127.0.0.1", port)
}

#[tokio::test]
async fn job_is_run_read_and_confirmed() {
    let shutdown = CancellationToken::new();
    let ns = server(&shutdown).await;
    let node = ns.node().clone();
    let client = client(vec![node.clone()], Duration::from_secs(10)).await;

    let id = client
        .submit(&node, JobSpec::new("frame-1"))
        .await
        .unwrap();
    assert_eq!(client.status(&node, id).await.unwrap(), JobStatus::Pending);

    let mut executor = client.executor();
    let Outcome::Job { server, job } = executor.get_job(Duration::from_secs(5)).await.unwrap()
    else {
        panic!("expected a job");
    };
    assert_eq!(server, node);
    assert_eq!(job.id, id);
    assert_eq!(job.input, "frame-1");
    executor.put_result(&server, job.id, "rendered").await.unwrap();

    let mut reader = client.reader();
    let Outcome::Job { server, job } = reader.read_job(Duration::from_secs(5)).await.unwrap()
    else {
        panic!("expected a finished job");
    };
    assert_eq!(job.output.as_deref(), Some("rendered"));
    reader.confirm(&server, job.id).await.unwrap();
    assert_eq!(client.status(&node, id).await.unwrap(), JobStatus::Confirmed);

    assert_eq!(
        executor.get_job(Duration::from_secs(1)).await.unwrap(),
        Outcome::NoJobs
    );
    shutdown.cancel();
}

#[tokio::test]
async fn waiting_worker_is_woken_by_a_submission() {
    let shutdown = CancellationToken::new();
    let ns = server(&shutdown).await;
    let node = ns.node().clone();
    let client = client(vec![node.clone()], Duration::from_secs(60)).await;

    client.submit(&node, JobSpec::new("first")).await.unwrap();
    let mut executor = client.executor();
    assert!(matches!(
        executor.get_job(Duration::from_secs(5)).await.unwrap(),
        Outcome::Job { .. }
    ));

    let waiter = tokio::spawn(async move {
        let started = Instant::now();
        let outcome = executor.get_job(Duration::from_secs(30)).await;
        (outcome, started.elapsed())
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    let second = client.submit(&node, JobSpec::new("second")).await.unwrap();

    let (outcome, elapsed) = waiter.await.unwrap();
    let Outcome::Job { job, .. } = outcome.unwrap() else {
        panic!("expected the second job");
    };
    assert_eq!(job.id, second);
    assert!(elapsed < Duration::from_secs(10), "woke after {elapsed:?}");
    shutdown.cancel();
}

#[tokio::test]
async fn unreachable_server_does_not_block_a_live_one() {
    let shutdown = CancellationToken::new();
    let ns = server(&shutdown).await;
    let node = ns.node().clone();
    let dead = unused_address().await;
    let client = client(vec![dead.clone(), node.clone()], Duration::from_secs(10)).await;

    let id = client.submit(&node, JobSpec::new("a")).await.unwrap();
    let mut executor = client.executor();
    let Outcome::Job { server, job } = executor.get_job(Duration::from_secs(5)).await.unwrap()
    else {
        panic!("expected a job");
    };
    assert_eq!((server, job.id), (node.clone(), id));
    assert_eq!(executor.timeline().immediate_servers(), vec![node]);
    assert!(executor.timeline().scheduled_servers().is_empty());
    shutdown.cancel();
}

#[tokio::test]
async fn preferred_affinity_is_served_first() {
    let shutdown = CancellationToken::new();
    let ns = server(&shutdown).await;
    let node = ns.node().clone();
    let client = client(vec![node.clone()], Duration::from_secs(10)).await;

    client.submit(&node, JobSpec::new("plain")).await.unwrap();
    let preferred = client
        .submit(&node, JobSpec::new("gpu job").with_affinity("x"))
        .await
        .unwrap();

    let mut executor = client.executor();
    assert!(executor.claim_affinity("x").unwrap());
    let Outcome::Job { job, .. } = executor.get_job(Duration::from_secs(5)).await.unwrap() else {
        panic!("expected a job");
    };
    assert_eq!(job.id, preferred);
    shutdown.cancel();
}

#[tokio::test]
async fn failed_job_goes_back_to_pending() {
    let shutdown = CancellationToken::new();
    let ns = server(&shutdown).await;
    let node = ns.node().clone();
    let client = client(vec![node.clone()], Duration::from_secs(10)).await;

    let id = client.submit(&node, JobSpec::new("flaky")).await.unwrap();
    let mut executor = client.executor();
    let Outcome::Job { server, .. } = executor.get_job(Duration::from_secs(5)).await.unwrap()
    else {
        panic!("expected a job");
    };
    executor.fail_job(&server, id, "segfault").await.unwrap();
    assert_eq!(client.status(&node, id).await.unwrap(), JobStatus::Pending);

    let Outcome::Job { server, .. } = executor.get_job(Duration::from_secs(5)).await.unwrap()
    else {
        panic!("expected the retried job");
    };
    executor.return_job(&server, id).await.unwrap();
    client.cancel(&node, id).await.unwrap();
    assert_eq!(client.status(&node, id).await.unwrap(), JobStatus::Canceled);
    assert!(client.submit(&node, JobSpec::new("x").with_affinity("bad token")).await.is_err());
    shutdown.cancel();
}
