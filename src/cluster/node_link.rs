//! Peer links
//!
//! One `PeerLink` per remote cluster member. A link owns an outbound
//! connection task and turns engine send-callbacks into string RPCs:
//!
//! ```text
//! RAFT.REQUESTVOTE   <src> <term>:<candidate>:<last_log_idx>:<last_log_term>
//! RAFT.APPENDENTRIES <src> <term>:<prev_idx>:<prev_term>:<commit> <n> (<term>:<id>:<type> <payload>)*
//! ```
//!
//! Connections are lazy: the first send to a disconnected peer starts a
//! connect attempt and the RPC itself is not sent — the engine's next
//! tick retries. Replies are parsed into the engine's typed structs and
//! delivered to the replication loop through the peer-event channel;
//! malformed replies are logged and dropped, and the next heartbeat
//! resynchronizes.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cluster::engine::{
    AppendEntriesMsg, AppendEntriesReply, RequestVoteMsg, RequestVoteReply,
};
use crate::config::{NodeAddress, NodeId};
use crate::protocol::{encode_frame, parse_frame, Frame};

// ---------------------------------------------------------------------------
// Link state
// ---------------------------------------------------------------------------

/// Connection state of a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection and no attempt in flight.
    Disconnected,
    /// Connect attempt in flight.
    Connecting,
    /// Connection established; RPCs flow.
    Connected,
}

impl LinkState {
    /// Compact state string used by the INFO report.
    pub fn as_info_str(self) -> &'static str {
        match self {
            LinkState::Disconnected => "",
            LinkState::Connecting => "c",
            LinkState::Connected => "C",
        }
    }
}

// ---------------------------------------------------------------------------
// Events and outbound RPCs
// ---------------------------------------------------------------------------

/// Feedback from link tasks into the replication loop.
#[derive(Debug)]
pub enum PeerEvent {
    /// The outbound connection is established.
    Connected {
        /// Peer the event concerns.
        id: NodeId,
    },
    /// The connection failed or closed; the link is disconnected.
    Disconnected {
        /// Peer the event concerns.
        id: NodeId,
    },
    /// A parsed RequestVote reply.
    VoteReply {
        /// Peer that replied.
        id: NodeId,
        /// Typed reply.
        reply: RequestVoteReply,
    },
    /// A parsed AppendEntries reply.
    AppendReply {
        /// Peer that replied.
        id: NodeId,
        /// Typed reply.
        reply: AppendEntriesReply,
    },
}

/// An RPC queued on a link's connection task.
#[derive(Debug)]
enum PeerRpc {
    RequestVote(RequestVoteMsg),
    AppendEntries(AppendEntriesMsg),
}

// ---------------------------------------------------------------------------
// PeerLink
// ---------------------------------------------------------------------------

/// Outbound RPC endpoint for one remote member.
#[derive(Debug)]
pub struct PeerLink {
    /// Remote member id.
    pub id: NodeId,
    /// Remote member address.
    pub addr: NodeAddress,
    local_id: NodeId,
    state: LinkState,
    tx: Option<mpsc::UnboundedSender<PeerRpc>>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerLink {
    /// Create a disconnected link.
    pub fn new(
        local_id: NodeId,
        id: NodeId,
        addr: NodeAddress,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            id,
            addr,
            local_id,
            state: LinkState::Disconnected,
            tx: None,
            events,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Mark the link connected (driven by [`PeerEvent::Connected`]).
    pub fn mark_connected(&mut self) {
        self.state = LinkState::Connected;
    }

    /// Mark the link disconnected and drop the task handle.
    pub fn mark_disconnected(&mut self) {
        self.state = LinkState::Disconnected;
        self.tx = None;
    }

    /// Queue a RequestVote RPC, or start connecting if necessary.
    pub fn send_request_vote(&mut self, msg: &RequestVoteMsg) {
        self.send(PeerRpc::RequestVote(msg.clone()));
    }

    /// Queue an AppendEntries RPC, or start connecting if necessary.
    pub fn send_append_entries(&mut self, msg: &AppendEntriesMsg) {
        self.send(PeerRpc::AppendEntries(msg.clone()));
    }

    fn send(&mut self, rpc: PeerRpc) {
        if self.state != LinkState::Connected {
            self.begin_connect();
            return;
        }
        let delivered = self
            .tx
            .as_ref()
            .map(|tx| tx.send(rpc).is_ok())
            .unwrap_or(false);
        if !delivered {
            // The task died under us; reconnect lazily on the next send.
            self.mark_disconnected();
        }
    }

    /// Start a connect attempt unless one is already in flight.
    ///
    /// Must run inside a `tokio::task::LocalSet` (the replication loop).
    pub fn begin_connect(&mut self) {
        if self.state == LinkState::Connecting {
            return;
        }
        debug!(peer = self.id, addr = %self.addr, "connecting to peer");
        self.state = LinkState::Connecting;
        let (tx, rx) = mpsc::unbounded_channel();
        self.tx = Some(tx);
        tokio::task::spawn_local(run_connection(
            self.local_id,
            self.id,
            self.addr.clone(),
            rx,
            self.events.clone(),
        ));
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

async fn run_connection(
    local_id: NodeId,
    peer_id: NodeId,
    addr: NodeAddress,
    mut rx: mpsc::UnboundedReceiver<PeerRpc>,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    let mut stream = match TcpStream::connect((addr.host.as_str(), addr.port)).await {
        Ok(s) => s,
        Err(e) => {
            warn!(peer = peer_id, addr = %addr, error = %e, "peer connect failed");
            let _ = events.send(PeerEvent::Disconnected { id: peer_id });
            return;
        }
    };
    let _ = events.send(PeerEvent::Connected { id: peer_id });

    let mut read_buf = BytesMut::with_capacity(4096);
    while let Some(rpc) = rx.recv().await {
        let request = encode_rpc(local_id, &rpc);
        let mut out = BytesMut::new();
        encode_frame(&request, &mut out);
        if stream.write_all(&out).await.is_err() {
            let _ = events.send(PeerEvent::Disconnected { id: peer_id });
            return;
        }

        let reply = match read_reply(&mut stream, &mut read_buf).await {
            Some(frame) => frame,
            None => {
                let _ = events.send(PeerEvent::Disconnected { id: peer_id });
                return;
            }
        };

        match parse_reply(peer_id, &rpc, &reply) {
            Some(event) => {
                let _ = events.send(event);
            }
            None => {
                warn!(peer = peer_id, ?reply, "malformed peer reply, dropped");
            }
        }
    }
}

async fn read_reply(stream: &mut TcpStream, buf: &mut BytesMut) -> Option<Frame> {
    loop {
        match parse_frame(buf) {
            Ok(Some(frame)) => return Some(frame),
            Ok(None) => {}
            Err(_) => return None,
        }
        match stream.read_buf(buf).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Wire encoding
// ---------------------------------------------------------------------------

fn bulk_str(s: String) -> Frame {
    Frame::Bulk(Some(Bytes::from(s)))
}

fn encode_rpc(local_id: NodeId, rpc: &PeerRpc) -> Frame {
    match rpc {
        PeerRpc::RequestVote(msg) => Frame::array(vec![
            Frame::from("RAFT.REQUESTVOTE"),
            bulk_str(local_id.to_string()),
            bulk_str(format!(
                "{}:{}:{}:{}",
                msg.term, msg.candidate_id, msg.last_log_idx, msg.last_log_term
            )),
        ]),
        PeerRpc::AppendEntries(msg) => {
            let mut parts = vec![
                Frame::from("RAFT.APPENDENTRIES"),
                bulk_str(local_id.to_string()),
                bulk_str(format!(
                    "{}:{}:{}:{}",
                    msg.term, msg.prev_log_idx, msg.prev_log_term, msg.leader_commit
                )),
                bulk_str(msg.entries.len().to_string()),
            ];
            for entry in &msg.entries {
                parts.push(bulk_str(format!(
                    "{}:{}:{}",
                    entry.term,
                    entry.id,
                    entry.etype.as_u8()
                )));
                parts.push(Frame::Bulk(Some(entry.data.clone())));
            }
            Frame::array(parts)
        }
    }
}

// ---------------------------------------------------------------------------
// Reply parsing
// ---------------------------------------------------------------------------

fn parse_reply(peer_id: NodeId, rpc: &PeerRpc, reply: &Frame) -> Option<PeerEvent> {
    let ints = integer_array(reply)?;
    match rpc {
        PeerRpc::RequestVote(_) => {
            if ints.len() != 2 {
                return None;
            }
            Some(PeerEvent::VoteReply {
                id: peer_id,
                reply: RequestVoteReply {
                    term: ints[0].max(0) as u64,
                    vote_granted: ints[1] != 0,
                },
            })
        }
        PeerRpc::AppendEntries(_) => {
            if ints.len() != 4 {
                return None;
            }
            Some(PeerEvent::AppendReply {
                id: peer_id,
                reply: AppendEntriesReply {
                    term: ints[0].max(0) as u64,
                    success: ints[1] != 0,
                    current_idx: ints[2].max(0) as u64,
                    first_idx: ints[3].max(0) as u64,
                },
            })
        }
    }
}

fn integer_array(frame: &Frame) -> Option<Vec<i64>> {
    frame
        .as_array()?
        .iter()
        .map(|f| f.as_integer())
        .collect::<Option<Vec<i64>>>()
}
