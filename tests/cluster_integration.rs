//! Multi-node cluster scenarios over real sockets.
//!
//! Each node runs its full stack in-process: the replication thread, the
//! TCP front end on its own runtime, and an isolated store. Tests drive
//! the cluster through the same wire protocol external clients use, and
//! poll node status with generous deadlines since elections and ticks run
//! on real timers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

use magnetite::config::{NodeAddress, NodeConfig};
use magnetite::protocol::{encode_frame, parse_frame, Frame};
use magnetite::{RaftHandle, RaftNode, Server, Store};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct TestNode {
    id: u32,
    port: u16,
    handle: RaftHandle,
    runtime: Option<tokio::runtime::Runtime>,
    _raft_thread: std::thread::JoinHandle<()>,
}

impl TestNode {
    /// Stop the node abruptly: server tasks die with the runtime, the
    /// request queue closes, and the replication thread exits.
    fn kill(mut self) {
        if let Some(rt) = self.runtime.take() {
            rt.shutdown_background();
        }
    }

    fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}

fn spawn_node(dir: &TempDir, id: u32, init: bool, join: bool) -> TestNode {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    std_listener.set_nonblocking(true).expect("nonblocking");
    let port = std_listener.local_addr().expect("local addr").port();

    let mut config = NodeConfig::new(id, NodeAddress::new("127.0.0.1", port));
    config.init = init;
    config.join = join;
    config.raft_log_path = Some(PathBuf::from(dir.path().join(format!("node{id}.db"))));

    let store = Arc::new(Store::new());
    let node = RaftNode::new(&config, store).expect("raft node");
    let handle = node.handle();
    let raft_thread = node.start().expect("start raft thread");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("node runtime");
    let server_handle = handle.clone();
    runtime.spawn(async move {
        let listener = tokio::net::TcpListener::from_std(std_listener).expect("listener");
        let _ = Server::new(server_handle).run(listener).await;
    });

    TestNode {
        id,
        port,
        handle,
        runtime: Some(runtime),
        _raft_thread: raft_thread,
    }
}

struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl TestClient {
    async fn connect(port: u16) -> TestClient {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(stream) => {
                    return TestClient {
                        stream,
                        buf: BytesMut::with_capacity(4096),
                    }
                }
                Err(_) if Instant::now() < deadline => sleep(Duration::from_millis(50)).await,
                Err(e) => panic!("connect to {port}: {e}"),
            }
        }
    }

    async fn cmd(&mut self, parts: &[&[u8]]) -> Frame {
        let frame = Frame::array(
            parts
                .iter()
                .map(|p| Frame::Bulk(Some(bytes::Bytes::copy_from_slice(p))))
                .collect(),
        );
        let mut out = BytesMut::new();
        encode_frame(&frame, &mut out);
        self.stream.write_all(&out).await.expect("write");

        loop {
            if let Some(reply) = parse_frame(&mut self.buf).expect("parse reply") {
                return reply;
            }
            let n = self.stream.read_buf(&mut self.buf).await.expect("read");
            assert!(n > 0, "connection closed mid-reply");
        }
    }
}

/// Fetch the INFO report from a node.
async fn node_info(port: u16) -> String {
    let mut client = TestClient::connect(port).await;
    let reply = timeout(Duration::from_secs(5), client.cmd(&[b"RAFT.INFO"]))
        .await
        .expect("info timeout");
    reply.as_str().expect("info is a bulk string").to_string()
}

fn info_field(info: &str, key: &str) -> Option<String> {
    info.lines()
        .find_map(|l| l.strip_prefix(&format!("{key}:")).map(|v| v.to_string()))
}

fn info_u64(info: &str, key: &str) -> u64 {
    info_field(info, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Poll until `pred` holds for a node's INFO, panicking at the deadline.
async fn wait_for_info(port: u16, secs: u64, what: &str, pred: impl Fn(&str) -> bool) -> String {
    let deadline = Instant::now() + Duration::from_secs(secs);
    loop {
        let info = node_info(port).await;
        if pred(&info) {
            return info;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {what}; last INFO:\n{info}"
        );
        sleep(Duration::from_millis(200)).await;
    }
}

/// Build a three-node cluster: node 1 inits, 2 and 3 join and get
/// promoted to voting members.
async fn three_node_cluster(dir: &TempDir) -> Vec<TestNode> {
    let n1 = spawn_node(dir, 1, true, false);
    let n2 = spawn_node(dir, 2, false, true);
    let n3 = spawn_node(dir, 3, false, true);

    let mut leader = TestClient::connect(n1.port).await;
    for node in [&n2, &n3] {
        let reply = leader
            .cmd(&[
                b"RAFT.ADDNODE",
                node.id.to_string().as_bytes(),
                node.addr().as_bytes(),
            ])
            .await;
        assert_eq!(reply, Frame::simple("OK"), "addnode {}", node.id);
    }

    // Each join produces a non-voting add plus a promotion entry once the
    // newcomer catches up: 1 (self-add) + 2 * 2 = 5 entries total.
    wait_for_info(n1.port, 30, "both nodes promoted", |info| {
        info_u64(info, "commit_index") >= 5
    })
    .await;

    vec![n1, n2, n3]
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_node_init_serves_writes() {
    let dir = TempDir::new().unwrap();
    let node = spawn_node(&dir, 1, true, false);

    let mut client = TestClient::connect(node.port).await;
    assert_eq!(client.cmd(&[b"PING"]).await, Frame::simple("PONG"));

    let reply = timeout(Duration::from_secs(5), client.cmd(&[b"SET", b"k", b"v"]))
        .await
        .expect("write timeout");
    assert_eq!(reply, Frame::simple("OK"));

    let reply = timeout(Duration::from_secs(5), client.cmd(&[b"GET", b"k"]))
        .await
        .expect("read timeout");
    assert_eq!(reply, Frame::bulk("v"));

    let info = node_info(node.port).await;
    assert_eq!(info_field(&info, "role").as_deref(), Some("leader"));
    assert_eq!(info_field(&info, "node_id").as_deref(), Some("1"));
    assert!(info_u64(&info, "current_term") >= 1);
    // Self-add plus the two data commands.
    assert!(info_u64(&info, "commit_index") >= 2);

    node.kill();
}

#[tokio::test]
async fn three_node_replication_and_redirect() {
    let dir = TempDir::new().unwrap();
    let nodes = three_node_cluster(&dir).await;

    // A write through the leader reaches every replica's applied state.
    let mut leader = TestClient::connect(nodes[0].port).await;
    let reply = timeout(Duration::from_secs(5), leader.cmd(&[b"SET", b"x", b"1"]))
        .await
        .expect("write timeout");
    assert_eq!(reply, Frame::simple("OK"));

    let applied_target = info_u64(&node_info(nodes[0].port).await, "last_applied_index");
    assert!(applied_target >= 6);
    for node in &nodes {
        wait_for_info(node.port, 20, "entry applied everywhere", |info| {
            info_u64(info, "last_applied_index") >= applied_target
        })
        .await;
    }

    // Commit indexes agree across live nodes.
    let commit = info_u64(&node_info(nodes[0].port).await, "commit_index");
    for node in &nodes[1..] {
        let info = wait_for_info(node.port, 20, "commit index convergence", |info| {
            info_u64(info, "commit_index") >= commit
        })
        .await;
        assert_eq!(info_field(&info, "leader_id").as_deref(), Some("1"));
    }

    // Writes to a follower are redirected to the leader.
    let mut follower = TestClient::connect(nodes[1].port).await;
    let reply = timeout(Duration::from_secs(5), follower.cmd(&[b"SET", b"x", b"2"]))
        .await
        .expect("redirect timeout");
    let expected = format!("LEADERIS 127.0.0.1:{}", nodes[0].port);
    assert_eq!(reply, Frame::error(expected));

    for node in nodes {
        node.kill();
    }
}

#[tokio::test]
async fn leader_failover_elects_new_leader() {
    let dir = TempDir::new().unwrap();
    let mut nodes = three_node_cluster(&dir).await;
    let old_term = info_u64(&node_info(nodes[0].port).await, "current_term");

    // Kill the leader.
    let leader = nodes.remove(0);
    let leader_port = leader.port;
    leader.kill();

    // A remaining node takes over with a strictly higher term.
    let deadline = Instant::now() + Duration::from_secs(30);
    let new_leader_port;
    'found: loop {
        for node in &nodes {
            let info = node_info(node.port).await;
            if info_field(&info, "role").as_deref() == Some("leader")
                && info_u64(&info, "current_term") > old_term
            {
                new_leader_port = node.port;
                break 'found;
            }
        }
        assert!(Instant::now() < deadline, "no new leader elected");
        sleep(Duration::from_millis(200)).await;
    }
    assert_ne!(new_leader_port, leader_port);

    // New writes succeed on the new leader.
    let mut client = TestClient::connect(new_leader_port).await;
    let reply = timeout(Duration::from_secs(10), client.cmd(&[b"SET", b"y", b"9"]))
        .await
        .expect("post-failover write timeout");
    assert_eq!(reply, Frame::simple("OK"));

    for node in nodes {
        node.kill();
    }
}

#[tokio::test]
async fn removed_leader_shuts_down_and_cluster_continues() {
    let dir = TempDir::new().unwrap();
    let mut nodes = three_node_cluster(&dir).await;
    let old_term = info_u64(&node_info(nodes[0].port).await, "current_term");

    // Ask the leader to remove itself.
    let mut client = TestClient::connect(nodes[0].port).await;
    let reply = timeout(Duration::from_secs(5), client.cmd(&[b"RAFT.REMOVENODE", b"1"]))
        .await
        .expect("removenode timeout");
    assert_eq!(reply, Frame::simple("OK"));

    // The removal commits and the removed node's replication loop exits.
    let removed = nodes.remove(0);
    let deadline = Instant::now() + Duration::from_secs(30);
    while !removed.handle.is_shutdown() {
        assert!(Instant::now() < deadline, "removed node did not shut down");
        sleep(Duration::from_millis(200)).await;
    }
    removed.kill();

    // The remaining two elect a leader and accept writes.
    let deadline = Instant::now() + Duration::from_secs(30);
    let new_leader_port;
    'found: loop {
        for node in &nodes {
            let info = node_info(node.port).await;
            if info_field(&info, "role").as_deref() == Some("leader")
                && info_u64(&info, "current_term") > old_term
            {
                new_leader_port = node.port;
                break 'found;
            }
        }
        assert!(Instant::now() < deadline, "no leader after removal");
        sleep(Duration::from_millis(200)).await;
    }

    let mut client = TestClient::connect(new_leader_port).await;
    let reply = timeout(Duration::from_secs(10), client.cmd(&[b"SET", b"z", b"3"]))
        .await
        .expect("post-removal write timeout");
    assert_eq!(reply, Frame::simple("OK"));

    for node in nodes {
        node.kill();
    }
}
