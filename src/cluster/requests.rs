//! Raft requests
//!
//! The front end never touches consensus state directly: every operation
//! crosses into the replication thread as a [`RaftReq`] carrying a
//! [`BlockedClient`] reply handle. The client's connection task parks on
//! the other end of that handle until the replication thread (or, for
//! replicated commands, the apply path) produces a reply.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::cluster::engine::{AppendEntriesMsg, RaftEngine, RequestVoteMsg};
use crate::cluster::node_link::PeerLink;
use crate::config::{NodeAddress, NodeId};
use crate::protocol::Frame;

// ---------------------------------------------------------------------------
// BlockedClient
// ---------------------------------------------------------------------------

/// Reply handle for a client parked on an in-flight request.
///
/// Replying consumes the handle; dropping it without a reply unparks the
/// client with a generic unavailable error (the receiver observes the
/// closed channel).
#[derive(Debug)]
pub struct BlockedClient {
    tx: oneshot::Sender<Frame>,
}

impl BlockedClient {
    /// Create a handle and the receiver its client waits on.
    pub fn pair() -> (Self, oneshot::Receiver<Frame>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Send the reply and unblock the client.
    pub fn reply(self, frame: Frame) {
        // A vanished client is not an error; it simply hung up early.
        let _ = self.tx.send(frame);
    }
}

// ---------------------------------------------------------------------------
// RaftReq
// ---------------------------------------------------------------------------

/// A request crossing from the front end to the replication thread.
#[derive(Debug)]
pub enum RaftReq {
    /// Add a node to the cluster (starts non-voting, promoted later).
    CfgChangeAddNode {
        /// New node's id.
        id: NodeId,
        /// New node's advertised address.
        addr: NodeAddress,
        /// Reply handle.
        client: BlockedClient,
    },
    /// Remove a node from the cluster.
    CfgChangeRemoveNode {
        /// Node to remove.
        id: NodeId,
        /// Reply handle.
        client: BlockedClient,
    },
    /// Inbound AppendEntries RPC from a peer.
    AppendEntries {
        /// Sending node's id.
        src: NodeId,
        /// Decoded message.
        msg: AppendEntriesMsg,
        /// Reply handle.
        client: BlockedClient,
    },
    /// Inbound RequestVote RPC from a peer.
    RequestVote {
        /// Sending node's id.
        src: NodeId,
        /// Decoded message.
        msg: RequestVoteMsg,
        /// Reply handle.
        client: BlockedClient,
    },
    /// A data command to run through the replicated log.
    Command {
        /// Parsed argv.
        argv: Vec<Bytes>,
        /// Reply handle.
        client: BlockedClient,
    },
    /// Cluster status report.
    Info {
        /// Reply handle.
        client: BlockedClient,
    },
}

impl RaftReq {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            RaftReq::CfgChangeAddNode { .. } => "cfgchange_addnode",
            RaftReq::CfgChangeRemoveNode { .. } => "cfgchange_removenode",
            RaftReq::AppendEntries { .. } => "appendentries",
            RaftReq::RequestVote { .. } => "requestvote",
            RaftReq::Command { .. } => "rediscommand",
            RaftReq::Info { .. } => "info",
        }
    }
}

// ---------------------------------------------------------------------------
// Pending-request arena
// ---------------------------------------------------------------------------

/// Requests whose reply is deferred until their log entry commits.
///
/// The log entry carries the `u64` token, not a reference; the request
/// outlives the entry's journey through consensus, and the apply path is
/// the only consumer. A request sits here exactly while it would carry
/// the pending-commit flag.
#[derive(Debug, Default)]
pub struct PendingRequests {
    next_token: u64,
    waiting: HashMap<u64, (Vec<Bytes>, BlockedClient)>,
}

impl PendingRequests {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a request, returning the token to stamp on its log entry.
    pub fn park(&mut self, argv: Vec<Bytes>, client: BlockedClient) -> u64 {
        self.next_token += 1;
        let token = self.next_token;
        self.waiting.insert(token, (argv, client));
        token
    }

    /// Take a parked request by token.
    pub fn take(&mut self, token: u64) -> Option<(Vec<Bytes>, BlockedClient)> {
        self.waiting.remove(&token)
    }

    /// Number of requests currently parked.
    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    /// Whether no requests are parked.
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

// ---------------------------------------------------------------------------
// INFO report
// ---------------------------------------------------------------------------

/// Format the cluster status report served for `RAFT.INFO`.
pub fn format_info(engine: &RaftEngine, links: &HashMap<NodeId, PeerLink>) -> String {
    let mut s = String::with_capacity(256);
    s.push_str("# Nodes\n");
    s.push_str(&format!("node_id:{}\n", engine.node_id()));
    s.push_str(&format!("role:{}\n", engine.role()));
    let leader = engine
        .leader_id()
        .map(|id| id as i64)
        .unwrap_or(-1);
    s.push_str(&format!("leader_id:{leader}\n"));
    s.push_str(&format!("current_term:{}\n", engine.current_term()));

    let mut peer_ids: Vec<NodeId> = links.keys().copied().collect();
    peer_ids.sort_unstable();
    for (i, id) in peer_ids.iter().enumerate() {
        if let Some(link) = links.get(id) {
            s.push_str(&format!(
                "node{i}:id={},state={},addr={},port={}\n",
                link.id,
                link.state().as_info_str(),
                link.addr.host,
                link.addr.port
            ));
        }
    }

    s.push_str("\n# Log\n");
    s.push_str(&format!("log_entries:{}\n", engine.entry_count()));
    s.push_str(&format!("current_index:{}\n", engine.last_log_idx()));
    s.push_str(&format!("commit_index:{}\n", engine.commit_idx()));
    s.push_str(&format!("last_applied_index:{}\n", engine.last_applied()));
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node_link::PeerEvent;
    use tokio::sync::mpsc;

    // -- blocked clients ---------------------------------------------------

    #[test]
    fn blocked_client_delivers_reply() {
        let (client, mut rx) = BlockedClient::pair();
        client.reply(Frame::simple("OK"));
        assert_eq!(rx.try_recv().unwrap(), Frame::simple("OK"));
    }

    #[test]
    fn dropped_client_closes_channel() {
        let (client, mut rx) = BlockedClient::pair();
        drop(client);
        assert!(rx.try_recv().is_err());
    }

    // -- pending arena -----------------------------------------------------

    #[test]
    fn pending_tokens_are_unique_and_consumed() {
        let mut pending = PendingRequests::new();
        let (c1, _r1) = BlockedClient::pair();
        let (c2, _r2) = BlockedClient::pair();
        let t1 = pending.park(vec![Bytes::from_static(b"SET")], c1);
        let t2 = pending.park(vec![Bytes::from_static(b"DEL")], c2);
        assert_ne!(t1, t2);
        assert_eq!(pending.len(), 2);

        let (argv, _client) = pending.take(t1).unwrap();
        assert_eq!(argv[0].as_ref(), b"SET");
        assert!(pending.take(t1).is_none());
        assert_eq!(pending.len(), 1);
    }

    // -- info formatting ---------------------------------------------------

    #[test]
    fn info_report_shape() {
        let mut engine = RaftEngine::with_defaults(1);
        engine.add_member(1, true);

        let (events, _rx) = mpsc::unbounded_channel::<PeerEvent>();
        let mut links = HashMap::new();
        links.insert(
            2,
            PeerLink::new(1, 2, NodeAddress::new("10.0.0.2", 5002), events),
        );

        let info = format_info(&engine, &links);
        assert!(info.starts_with("# Nodes\n"));
        assert!(info.contains("node_id:1\n"));
        assert!(info.contains("role:follower\n"));
        assert!(info.contains("leader_id:-1\n"));
        assert!(info.contains("current_term:0\n"));
        assert!(info.contains("node0:id=2,state=,addr=10.0.0.2,port=5002\n"));
        assert!(info.contains("\n# Log\n"));
        assert!(info.contains("log_entries:0\n"));
        assert!(info.contains("current_index:0\n"));
        assert!(info.contains("commit_index:0\n"));
        assert!(info.contains("last_applied_index:0\n"));
    }
}
