use std::sync::Arc;
use std::time::Duration;

use peersync_tunnel::{
    memory_pair, ConnFramed, ConnectionProvider, FrameStream, MemoryStream, Multiplexer, MuxConfig,
    TunnelConn, TunnelError, TunnelMessage,
};
use tokio::time::timeout;

struct Pair {
    client: Multiplexer,
    server: Multiplexer,
    client_accept: ConnectionProvider,
    server_accept: ConnectionProvider,
}

fn spawn_run(mux: &Multiplexer, stream: MemoryStream<TunnelMessage>) {
    let mux = mux.clone();
    tokio::spawn(async move {
        let _ = mux.run(Arc::new(stream)).await;
    });
}

async fn connected(config: MuxConfig) -> Pair {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();

    let (a, b) = memory_pair::<TunnelMessage>(64);
    let client = Multiplexer::new_initiator(config.clone());
    let server = Multiplexer::new_responder(config);
    let client_accept = client.connection_provider();
    let server_accept = server.connection_provider();
    spawn_run(&client, a);
    spawn_run(&server, b);

    timeout(Duration::from_secs(2), client.wait_ready())
        .await
        .expect("client ready timeout")
        .expect("client ready");
    timeout(Duration::from_secs(2), server.wait_ready())
        .await
        .expect("server ready timeout")
        .expect("server ready");

    Pair {
        client,
        server,
        client_accept,
        server_accept,
    }
}

async fn read_string(conn: &TunnelConn, len: usize) -> String {
    let mut buf = vec![0u8; len];
    let ok = timeout(Duration::from_secs(2), conn.read_exact(&mut buf))
        .await
        .expect("read timeout")
        .expect("read");
    assert!(ok, "connection closed early");
    String::from_utf8(buf).unwrap()
}

#[tokio::test]
async fn shared_secret_matches() {
    let pair = connected(MuxConfig::new()).await;
    assert!(pair.client.is_ready());
    assert_eq!(pair.client.shared_secret(), pair.server.shared_secret());
    assert!(pair.client.shared_secret().is_some());
}

#[tokio::test]
async fn dial_parity_and_echo() {
    let pair = connected(MuxConfig::new()).await;

    let c1 = pair.client.dial().unwrap();
    let c2 = pair.client.dial().unwrap();
    let s1 = pair.server.dial().unwrap();
    assert_eq!(c1.conn_id(), 1);
    assert_eq!(c2.conn_id(), 3);
    assert_eq!(s1.conn_id(), 2);

    c1.write(b"hello").await.unwrap();
    let accepted = timeout(Duration::from_secs(2), pair.server_accept.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(accepted.conn_id(), 1);
    assert_eq!(read_string(&accepted, 5).await, "hello");

    accepted.write(b"world").await.unwrap();
    assert_eq!(read_string(&c1, 5).await, "world");

    s1.write(b"from-server").await.unwrap();
    let on_client = timeout(Duration::from_secs(2), pair.client_accept.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(on_client.conn_id(), 2);
    assert_eq!(read_string(&on_client, 11).await, "from-server");
}

#[tokio::test]
async fn close_propagates_to_peer() {
    let pair = connected(MuxConfig::new()).await;
    let conn = pair.client.dial().unwrap();
    conn.write(b"x").await.unwrap();
    let accepted = pair.server_accept.accept().await.unwrap();
    assert_eq!(read_string(&accepted, 1).await, "x");

    conn.close();
    timeout(Duration::from_secs(2), accepted.closed())
        .await
        .expect("peer close not observed");
    let mut buf = [0u8; 1];
    assert_eq!(accepted.read(&mut buf).await.unwrap(), 0);
    assert!(matches!(conn.write(b"y").await, Err(TunnelError::ConnClosed { .. })));
}

#[tokio::test]
async fn stuck_conn_does_not_block_others() {
    let config = MuxConfig::new()
        .hol_timeout(Duration::from_millis(100))
        .read_buffer(2);
    let pair = connected(config).await;

    let stuck = pair.client.dial().unwrap();
    let live = pair.client.dial().unwrap();
    stuck.write(b"s").await.unwrap();
    live.write(b"l").await.unwrap();

    let stuck_remote = pair.server_accept.accept().await.unwrap();
    let live_remote = pair.server_accept.accept().await.unwrap();
    assert_eq!(stuck_remote.conn_id(), stuck.conn_id());

    // Nobody reads `stuck_remote`; overflow its buffer. Later writes may
    // already see the close coming back.
    for _ in 0..5 {
        let _ = stuck.write(b"more").await;
    }
    live.write(b"k").await.unwrap();

    assert_eq!(read_string(&live_remote, 2).await, "lk");
    timeout(Duration::from_secs(1), stuck_remote.closed())
        .await
        .expect("stuck conn was not closed");
    timeout(Duration::from_secs(1), stuck.closed())
        .await
        .expect("close not sent back to dialer");
    assert!(!live_remote.is_closed());
}

#[tokio::test]
async fn unknown_conn_without_provider_is_dropped() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
    let (a, b) = memory_pair::<TunnelMessage>(16);
    let client = Multiplexer::new_initiator(MuxConfig::new());
    let server = Multiplexer::new_responder(MuxConfig::new());
    spawn_run(&client, a);
    spawn_run(&server, b);
    client.wait_ready().await.unwrap();
    server.wait_ready().await.unwrap();

    let conn = client.dial().unwrap();
    conn.write(b"ignored").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.conn_count(), 0);
}

#[tokio::test]
async fn shutdown_closes_everything() {
    let pair = connected(MuxConfig::new()).await;
    let conn = pair.client.dial().unwrap();
    pair.client.shutdown();
    timeout(Duration::from_secs(1), conn.closed()).await.unwrap();
    assert!(matches!(pair.client.dial(), Err(TunnelError::NotRunning)));
    assert!(matches!(
        timeout(Duration::from_secs(1), pair.client_accept.accept()).await.unwrap(),
        Err(TunnelError::ProviderClosed)
    ));
}

#[tokio::test]
async fn key_exchange_times_out() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
    let (a, _b) = memory_pair::<TunnelMessage>(16);
    let mux = Multiplexer::new_initiator(MuxConfig::new().handshake_timeout(Duration::from_millis(50)));
    let res = timeout(Duration::from_secs(2), mux.run(Arc::new(a))).await.unwrap();
    assert!(matches!(res, Err(TunnelError::Handshake(_))));
}

#[tokio::test]
async fn sealed_tunnel_roundtrip() {
    let pair = connected(MuxConfig::new().seal_payloads(true)).await;
    let conn = pair.client.dial().unwrap();
    conn.write(b"sealed payload").await.unwrap();
    let accepted = pair.server_accept.accept().await.unwrap();
    assert_eq!(read_string(&accepted, 14).await, "sealed payload");
}

#[tokio::test]
async fn framed_protocol_inside_conn() {
    let pair = connected(MuxConfig::new()).await;
    let conn = pair.client.dial().unwrap();
    let client_side: ConnFramed<Vec<u64>> = ConnFramed::new(conn);

    let big: Vec<u64> = (0..20_000).collect();
    client_side.send(big.clone()).await.unwrap();

    let accepted = pair.server_accept.accept().await.unwrap();
    let server_side: ConnFramed<Vec<u64>> = ConnFramed::new(accepted);
    let got = timeout(Duration::from_secs(2), server_side.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(got, big);

    client_side.close().await;
    assert!(timeout(Duration::from_secs(2), server_side.recv())
        .await
        .unwrap()
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn shutdown_unblocks_a_stalled_writer() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
    let (a, peer) = memory_pair::<TunnelMessage>(1);
    let client = Multiplexer::new_initiator(MuxConfig::new());
    let run = {
        let client = client.clone();
        tokio::spawn(async move { client.run(Arc::new(a)).await })
    };

    // complete the key exchange, then never read again
    peer.send(TunnelMessage::handshake([7u8; 32])).await.unwrap();
    let first = timeout(Duration::from_secs(2), peer.recv()).await.unwrap().unwrap();
    assert!(first.is_some());
    timeout(Duration::from_secs(2), client.wait_ready()).await.unwrap().unwrap();

    let conn = client.dial().unwrap();
    for _ in 0..4 {
        let _ = timeout(Duration::from_millis(100), conn.write(b"stuck")).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.shutdown();
    let res = timeout(Duration::from_secs(2), run).await.expect("run did not return after shutdown");
    assert!(res.unwrap().is_ok());
    timeout(Duration::from_secs(1), conn.closed()).await.unwrap();
}
