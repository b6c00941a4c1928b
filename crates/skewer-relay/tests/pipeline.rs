//! Whole-pipeline test: TCP socket -> auto framing -> parser pool ->
//! store -> destination runner -> file.

use std::sync::Arc;
use std::time::Duration;

use skewer_model::IdGenerator;
use skewer_relay::bus::FatalSignal;
use skewer_relay::config::{
    Config, DestinationKind, DestinationMask, ListenerConfig, ListenerProtocol,
};
use skewer_relay::dest::{feedback_channel, file::FileDestination, spawn_runner, EventEncoder};
use skewer_relay::filter::NoopFilter;
use skewer_relay::ingress::{
    raw_ring, spawn_parsers, tcp::spawn_stream_listener, IngressCounters,
};
use skewer_relay::store::MessageStore;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_tcp_to_file_with_mixed_framing() {
    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("delivered.ndjson");
    let dest = DestinationKind::File;
    let config = Config {
        store_dir: dir.path().join("store"),
        destinations: DestinationMask::of(&[dest]),
        retry_delay: Duration::from_secs(60),
        ..Config::default()
    };
    let shutdown = CancellationToken::new();

    let store = MessageStore::open(&config).unwrap();
    let handle = MessageStore::start(&store, &shutdown, 64);

    let (feedback, feedback_rx) = feedback_channel();
    let adapter = Box::new(FileDestination::new(
        &out_path,
        EventEncoder::Json,
        feedback,
        FatalSignal::new(),
    ));
    spawn_runner(
        Arc::clone(&store),
        dest,
        adapter,
        feedback_rx,
        100,
        None,
        shutdown.clone(),
    );

    let (ring, consumer) = raw_ring(64);
    let counters = Arc::new(IngressCounters::default());
    // a single worker keeps arrival order deterministic for the test
    spawn_parsers(
        consumer,
        Arc::new(handle.clone()),
        Arc::new(NoopFilter::new()),
        Arc::new(IdGenerator::new()),
        Arc::clone(&counters),
        1,
    );

    let mut listener = ListenerConfig::new(ListenerProtocol::Tcp, "127.0.0.1:0");
    listener.read_timeout = Duration::from_secs(5);
    let info = spawn_stream_listener(listener, ring, Arc::clone(&counters), shutdown.clone())
        .await
        .unwrap();

    // first record line-framed, second octet-counted, same stream
    let mut client = tokio::net::TcpStream::connect(info.bind_addr.unwrap())
        .await
        .unwrap();
    client
        .write_all(b"<14>1 2020-01-01T00:00:00Z h a p m - hi\n")
        .await
        .unwrap();
    let second = "<14>1 2020-01-01T00:00:01Z h a p m - hi again";
    client
        .write_all(format!("{} {second}", second.len()).as_bytes())
        .await
        .unwrap();
    client.shutdown().await.unwrap();

    // both events must land in the output file, in order
    let mut content = String::new();
    for _ in 0..500 {
        content = std::fs::read_to_string(&out_path).unwrap_or_default();
        if content.lines().count() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2, "expected two delivered events, got: {content}");
    assert!(lines[0].contains("\"hi\""));
    assert!(lines[1].contains("hi again"));

    // everything acked, the store is drained
    for _ in 0..500 {
        if store.messages_count().unwrap() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.messages_count().unwrap(), 0);
    assert_eq!(
        store
            .queue_count(skewer_relay::store::QueueKind::Ready, dest)
            .unwrap(),
        0
    );
    shutdown.cancel();
}
