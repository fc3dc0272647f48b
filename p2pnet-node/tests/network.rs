//! Nodes on 127.0.0.1 with ephemeral ports; local discovery off.

use std::sync::Arc;
use std::time::Duration;

use p2pnet_core::{BootstrapState, DiscoverySource, Multiaddr, PeerId, PeerRecord};
use p2pnet_node::{CallError, Config, Network, PeerTransport, Service};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Barrier;

const WAIT: Duration = Duration::from_secs(10);

async fn node(rendezvous: &str) -> Network {
    let config = Config {
        rendezvous: rendezvous.into(),
        listen_host: "127.0.0.1".into(),
        listen_port: 0,
        local_discovery: false,
        poll_interval_secs: 1,
        directory_poll_secs: 1,
        ..Config::default()
    };
    Network::new(config).await.unwrap()
}

fn record_of(n: &Network) -> PeerRecord {
    PeerRecord::new(n.peer_id(), n.addrs(), DiscoverySource::Static)
}

fn random_bytes(n: usize) -> Vec<u8> {
    (0..n).map(|_| rand::random::<u8>()).collect()
}

async fn collect(mut rx: tokio::sync::mpsc::Receiver<PeerRecord>) -> Vec<PeerRecord> {
    let mut out = Vec::new();
    while let Some(r) = rx.recv().await {
        out.push(r);
    }
    out
}

fn echo_service() -> Service {
    Service::new("Echo")
        .method("echo", |bytes: Vec<u8>| async move { Ok::<_, String>(bytes) })
        .method("slow", |ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, String>(ms)
        })
}

#[tokio::test]
async fn rpc_echo_is_byte_identical() {
    let a = node("rpc").await;
    let b = node("rpc").await;
    b.rpc().register(echo_service()).unwrap();
    a.connect(&record_of(&b)).await.unwrap();

    let data = random_bytes(64);
    let back: Vec<u8> = a.rpc().call(b.peer_id(), "Echo", "echo", &data).await.unwrap();
    assert_eq!(back, data);

    // Second call goes over the pooled stream.
    let again: Vec<u8> = a.rpc().call(b.peer_id(), "Echo", "echo", &data).await.unwrap();
    assert_eq!(again, data);

    let err = a
        .rpc()
        .call::<_, Vec<u8>>(b.peer_id(), "Echo", "missing", &data)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::UnknownMethod { .. }));
    let err = a
        .rpc()
        .call::<_, Vec<u8>>(b.peer_id(), "Nope", "echo", &data)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::UnknownService(_)));

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn dial_to_an_impostor_identity_is_rejected() {
    let a = node("auth").await;
    let b = node("auth").await;
    let impostor = PeerRecord::new(PeerId::random(), b.addrs(), DiscoverySource::Static);

    let err = a.connect(&impostor).await.unwrap_err();
    assert!(matches!(err, p2pnet_node::Error::ConnectionFailure { .. }));
    assert!(a.transport().connected_peers().is_empty());
    assert!(!a.transport().is_connected(&b.peer_id()));
    b.close().await;
}

#[tokio::test]
async fn rpc_timeout_resets_and_next_call_recovers() {
    let a = node("rpc-timeout").await;
    let b = node("rpc-timeout").await;
    b.rpc().register(echo_service()).unwrap();
    a.connect(&record_of(&b)).await.unwrap();

    let err = a
        .rpc()
        .call_with_timeout::<_, u64>(b.peer_id(), "Echo", "slow", &30_000u64, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Timeout));

    // The caller reset its stream, so the server stops serving it long before the method would finish.
    tokio::time::timeout(Duration::from_secs(5), async {
        while b.rpc().inbound_streams() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let ms: u64 = a.rpc().call(b.peer_id(), "Echo", "slow", &1u64).await.unwrap();
    assert_eq!(ms, 1);
    assert_eq!(b.rpc().inbound_streams(), 1);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn raw_stream_echo_is_byte_identical() {
    let a = node("streams").await;
    let b = node("streams").await;
    b.stream_manager().set_handler("/echo/1.0.0", |stream| async move {
        let (mut r, mut w) = tokio::io::split(stream);
        let _ = tokio::io::copy(&mut r, &mut w).await;
        let _ = w.shutdown().await;
    });
    a.connect(&record_of(&b)).await.unwrap();

    let data = random_bytes(512);
    let mut s = a
        .stream_manager()
        .open_stream(b.peer_id(), "/echo/1.0.0")
        .await
        .unwrap();
    s.write_all(&data).await.unwrap();
    s.shutdown().await.unwrap();
    let mut back = Vec::new();
    s.read_to_end(&mut back).await.unwrap();
    assert_eq!(back, data);

    b.stream_manager().remove_handler("/echo/1.0.0");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(a
        .stream_manager()
        .open_stream(b.peer_id(), "/echo/1.0.0")
        .await
        .is_err());

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn inbound_streams_for_one_tag_run_concurrently() {
    let a = node("concurrent").await;
    let b = node("concurrent").await;
    let barrier = Arc::new(Barrier::new(2));
    b.stream_manager().set_handler("/meet/1.0.0", move |mut stream| {
        let barrier = barrier.clone();
        async move {
            let mut byte = [0u8; 1];
            if stream.read_exact(&mut byte).await.is_err() {
                return;
            }
            // Both handlers must be running for either to get past here.
            barrier.wait().await;
            let _ = stream.write_all(&byte).await;
            let _ = stream.shutdown().await;
        }
    });
    a.connect(&record_of(&b)).await.unwrap();

    let mut streams = Vec::new();
    for tag in [1u8, 2] {
        let mut s = a
            .stream_manager()
            .open_stream(b.peer_id(), "/meet/1.0.0")
            .await
            .unwrap();
        s.write_all(&[tag]).await.unwrap();
        s.flush().await.unwrap();
        streams.push((tag, s));
    }
    for (tag, mut s) in streams {
        let mut back = [0u8; 1];
        tokio::time::timeout(WAIT, s.read_exact(&mut back))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(back[0], tag);
    }

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn bootstrap_waits_for_a_connection_then_announces() {
    let a = node("boot").await;
    let b = node("boot").await;

    assert!(tokio::time::timeout(Duration::from_millis(1500), a.wait_for_bootstrap())
        .await
        .is_err());
    assert_eq!(a.bootstrap_state(), BootstrapState::Discovering);

    a.record_peer(&record_of(&b));
    tokio::time::timeout(WAIT, a.wait_for_bootstrap()).await.unwrap();
    assert_eq!(a.bootstrap_state(), BootstrapState::Announced);

    // The accepting side counts the inbound connection as connectivity.
    tokio::time::timeout(WAIT, b.wait_for_bootstrap()).await.unwrap();
    assert!(b.bootstrap_state() >= BootstrapState::Connected);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn directory_finds_peers_after_they_advertised() {
    let hub = node("dir").await;
    let b = node("dir").await;
    let c = node("dir").await;
    b.record_peer(&record_of(&hub));
    c.record_peer(&record_of(&hub));
    tokio::time::timeout(WAIT, b.wait_for_bootstrap()).await.unwrap();
    tokio::time::timeout(WAIT, c.wait_for_bootstrap()).await.unwrap();
    tokio::time::timeout(WAIT, hub.wait_for_bootstrap()).await.unwrap();
    assert_eq!(b.bootstrap_state(), BootstrapState::Announced);

    let found = collect(c.discovery().find_peers("dir").await.unwrap()).await;
    let ids: Vec<_> = found.iter().map(|r| r.peer_id()).collect();
    assert!(ids.contains(&b.peer_id()));
    assert!(ids.contains(&hub.peer_id()));
    assert!(!ids.contains(&c.peer_id()));
    assert!(found.iter().all(|r| r.discovered_via() == DiscoverySource::Directory));

    // Directory results carry the provider's own published addresses in dialable form.
    let from_b = found.iter().find(|r| r.peer_id() == b.peer_id()).unwrap();
    let dialable = from_b.dialable_addrs();
    for addr in b.addrs() {
        assert!(dialable.contains(&addr), "{addr} missing from {dialable:?}");
    }

    assert!(collect(c.discovery().find_peers("never-advertised").await.unwrap())
        .await
        .is_empty());

    hub.close().await;
    b.close().await;
    c.close().await;
}

#[tokio::test]
async fn record_peer_merges_address_sets() {
    let a = node("book").await;
    let b = node("book").await;
    let x: Multiaddr = "/ip4/10.1.0.1/tcp/4001".parse().unwrap();
    let y: Multiaddr = "/ip4/10.1.0.2/tcp/4001".parse().unwrap();
    a.record_peer(&PeerRecord::new(b.peer_id(), [x.clone()], DiscoverySource::Local));
    a.record_peer(&PeerRecord::new(b.peer_id(), [y.clone()], DiscoverySource::Directory));
    a.record_peer(&PeerRecord::new(b.peer_id(), [x.clone()], DiscoverySource::Local));
    assert_eq!(a.transport().address_book().addrs(&b.peer_id()), vec![x, y]);

    a.record_peer(&record_of(&a));
    assert!(a.transport().address_book().addrs(&a.peer_id()).is_empty());

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn close_drops_connections() {
    let a = node("close").await;
    let b = node("close").await;
    a.connect(&record_of(&b)).await.unwrap();
    assert!(a.transport().is_connected(&b.peer_id()));

    a.close().await;
    assert!(a.transport().is_closed());
    assert!(a.connect(&record_of(&b)).await.is_err());
    tokio::time::timeout(WAIT, async {
        while b.transport().is_connected(&a.peer_id()) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    b.close().await;
}

#[tokio::test]
async fn simultaneous_dials_leave_one_peer_entry_and_close_cleanly() {
    let a = node("cross").await;
    let b = node("cross").await;
    let (rec_b, rec_a) = (record_of(&b), record_of(&a));
    let (ab, ba) = tokio::join!(a.connect(&rec_b), b.connect(&rec_a));
    ab.unwrap();
    ba.unwrap();
    assert_eq!(a.transport().connected_peers(), vec![b.peer_id()]);
    assert_eq!(b.transport().connected_peers(), vec![a.peer_id()]);

    a.close().await;
    tokio::time::timeout(WAIT, async {
        while !b.transport().connected_peers().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    b.close().await;
}
