//! RELP end-to-end scenarios against a real store: the happy path,
//! out-of-order downstream completions, and the ordering guarantee on
//! server responses.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use skewer_model::{EventId, IdGenerator};
use skewer_relay::bus::FatalSignal;
use skewer_relay::config::{
    Config, DestinationKind, DestinationMask, ListenerConfig, ListenerProtocol,
};
use skewer_relay::dest::{feedback_channel, spawn_runner, DestFeedback, Destination};
use skewer_relay::filter::NoopFilter;
use skewer_relay::ingress::IngressCounters;
use skewer_relay::relp::{handle_connection, RelpConnection, StoreRelpStasher};
use skewer_relay::store::{MessageStore, StoredEvent};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

/// Destination that parks every event until the test releases it.
struct ManualDestination {
    fatal: FatalSignal,
    seen: Arc<Mutex<Vec<EventId>>>,
}

#[async_trait]
impl Destination for ManualDestination {
    async fn send(&mut self, stored: StoredEvent) {
        self.seen.lock().unwrap().push(stored.uid);
    }

    fn fatal(&self) -> FatalSignal {
        self.fatal.clone()
    }
}

struct Harness {
    client: DuplexStream,
    store: Arc<MessageStore>,
    feedback: DestFeedback,
    seen: Arc<Mutex<Vec<EventId>>>,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

/// Store + manual destination runner + one RELP connection over an
/// in-memory duplex.
async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let dest = DestinationKind::Stderr;
    let config = Config {
        store_dir: dir.path().to_path_buf(),
        destinations: DestinationMask::of(&[dest]),
        retry_delay: Duration::from_secs(60),
        ..Config::default()
    };
    let shutdown = CancellationToken::new();
    let store = MessageStore::open(&config).unwrap();
    let handle = MessageStore::start(&store, &shutdown, 64);

    let (feedback, feedback_rx) = feedback_channel();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let adapter = Box::new(ManualDestination {
        fatal: FatalSignal::new(),
        seen: Arc::clone(&seen),
    });
    spawn_runner(
        Arc::clone(&store),
        dest,
        adapter,
        feedback_rx,
        100,
        None,
        shutdown.clone(),
    );

    let ctx = RelpConnection {
        stasher: Arc::new(StoreRelpStasher::new(handle.clone())),
        generator: Arc::new(IdGenerator::new()),
        filter: Arc::new(NoopFilter::new()),
        counters: Arc::new(IngressCounters::default()),
        fatal: store.fatal(),
        failure_backoff: Duration::from_millis(10),
    };
    let (client, server) = tokio::io::duplex(8192);
    let mut listener = ListenerConfig::new(ListenerProtocol::Relp, "ignored");
    listener.read_timeout = Duration::from_secs(10);
    tokio::spawn(handle_connection(
        ctx,
        server,
        "test-client".to_string(),
        listener,
        shutdown.clone(),
    ));

    Harness {
        client,
        store,
        feedback,
        seen,
        shutdown,
        _dir: dir,
    }
}

async fn read_response(client: &mut DuplexStream) -> String {
    let mut buf = vec![0u8; 4096];
    let n = tokio::time::timeout(Duration::from_secs(3), client.read(&mut buf))
        .await
        .expect("expected a server response")
        .unwrap();
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

/// Reads until `needle` has been received or the timeout hits.
async fn read_until(client: &mut DuplexStream, needle: &str) -> String {
    let mut collected = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !collected.contains(needle) {
        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout_at(deadline, client.read(&mut buf))
            .await
            .expect("expected more server output")
            .unwrap();
        assert!(n > 0, "connection closed while waiting for {needle:?}");
        collected.push_str(&String::from_utf8_lossy(&buf[..n]));
    }
    collected
}

async fn wait_for_inflight(seen: &Arc<Mutex<Vec<EventId>>>, count: usize) -> Vec<EventId> {
    for _ in 0..300 {
        {
            let seen = seen.lock().unwrap();
            if seen.len() >= count {
                return seen.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("destination never saw {count} events");
}

#[tokio::test]
async fn test_happy_relp_path_drains_the_store() {
    let mut h = harness().await;

    h.client.write_all(b"1 open 14 relp_version=0\n").await.unwrap();
    assert_eq!(read_response(&mut h.client).await, "1 rsp 21 200 OK\nrelp_version=0\n");

    h.client
        .write_all(b"2 syslog 23 <13>1 - - - - - - hello\n")
        .await
        .unwrap();

    // the destination confirms, which unlocks the protocol ack
    let uids = wait_for_inflight(&h.seen, 1).await;
    h.feedback.ack(uids[0]);
    assert_eq!(read_until(&mut h.client, "2 rsp").await, "2 rsp 6 200 OK\n");

    // after the final ack nothing is left on disk
    for _ in 0..300 {
        if h.store.messages_count().unwrap() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.store.messages_count().unwrap(), 0);

    h.client.write_all(b"3 close 0\n").await.unwrap();
    assert_eq!(read_response(&mut h.client).await, "3 rsp 0\n0 serverclose 0\n");
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_out_of_order_completions_ack_in_txnr_order() {
    let mut h = harness().await;

    h.client.write_all(b"1 open 14 relp_version=0\n").await.unwrap();
    let _ = read_response(&mut h.client).await;

    for (txnr, body) in [(2, "aa"), (3, "bb"), (4, "cc")] {
        let record = format!("<13>1 - - - - - - {body}");
        let frame = format!("{txnr} syslog {} {record}\n", record.len());
        h.client.write_all(frame.as_bytes()).await.unwrap();
    }
    let uids = wait_for_inflight(&h.seen, 3).await;

    // confirm 4 then 3: the server must stay silent, 2 is still pending
    h.feedback.ack(uids[2]);
    h.feedback.ack(uids[1]);
    let mut probe = vec![0u8; 256];
    let silent =
        tokio::time::timeout(Duration::from_millis(300), h.client.read(&mut probe)).await;
    assert!(silent.is_err(), "no ack may be emitted before txnr 2 completes");

    // confirming 2 releases all three, in order
    h.feedback.ack(uids[0]);
    let output = read_until(&mut h.client, "4 rsp").await;
    assert_eq!(output, "2 rsp 6 200 OK\n3 rsp 6 200 OK\n4 rsp 6 200 OK\n");
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_failed_delivery_surfaces_as_ko() {
    let mut h = harness().await;

    h.client.write_all(b"1 open 14 relp_version=0\n").await.unwrap();
    let _ = read_response(&mut h.client).await;

    let record = "<13>1 - - - - - - doomed";
    let frame = format!("2 syslog {} {record}\n", record.len());
    h.client.write_all(frame.as_bytes()).await.unwrap();

    let uids = wait_for_inflight(&h.seen, 1).await;
    h.feedback.nack(uids[0]);
    assert_eq!(read_until(&mut h.client, "2 rsp").await, "2 rsp 6 500 KO\n");

    // the event stays queued for retry even though the client was told KO
    assert_eq!(
        h.store
            .queue_count(skewer_relay::store::QueueKind::Failed, DestinationKind::Stderr)
            .unwrap(),
        1
    );
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_response_txnrs_are_strictly_increasing() {
    let mut h = harness().await;

    h.client.write_all(b"1 open 14 relp_version=0\n").await.unwrap();
    let _ = read_response(&mut h.client).await;

    let count = 10usize;
    for i in 0..count {
        let record = format!("<13>1 - - - - - - msg {i}");
        let frame = format!("{} syslog {} {record}\n", i + 2, record.len());
        h.client.write_all(frame.as_bytes()).await.unwrap();
    }
    let uids = wait_for_inflight(&h.seen, count).await;
    // complete in reverse order
    for uid in uids.iter().rev() {
        h.feedback.ack(*uid);
    }

    let output = read_until(&mut h.client, &format!("{} rsp", count + 1)).await;
    let txnrs: Vec<u64> = output
        .lines()
        .filter_map(|line| line.split(' ').next())
        .filter_map(|t| t.parse().ok())
        .collect();
    assert_eq!(txnrs.len(), count);
    assert!(txnrs.windows(2).all(|w| w[0] < w[1]), "txnrs not increasing: {txnrs:?}");
    h.shutdown.cancel();
}
