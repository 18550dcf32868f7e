//! Cluster node coordinator
//!
//! Owns everything consensus-adjacent on one dedicated replication
//! thread: the engine, the persisted log, the peer links, and the
//! pending-request arena. The front end interacts only by enqueuing
//! [`RaftReq`]s on the handle; peer connection tasks feed parsed replies
//! back through the peer-event channel. Nothing else ever touches the
//! engine.
//!
//! The loop has three wakeup sources:
//! - a 500 ms periodic tick, which drives the engine clock and then
//!   applies newly committed entries;
//! - the request queue;
//! - the peer-event channel (AppendEntries replies are followed by an
//!   apply pass, since the leader's commit index may have advanced).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::cluster::codec::{decode_command, encode_command, RaftCfgChange};
use crate::cluster::engine::{
    Entry, EntryType, RaftConfig, RaftEngine, RaftError, RaftHooks, RequestVoteMsg,
};
use crate::cluster::node_link::{PeerEvent, PeerLink};
use crate::cluster::requests::{format_info, BlockedClient, PendingRequests, RaftReq};
use crate::config::{NodeAddress, NodeConfig, NodeId};
use crate::error::Result;
use crate::protocol::Frame;
use crate::storage::Store;

/// Milliseconds between engine clock ticks.
const TICK_MS: u64 = 500;

// ---------------------------------------------------------------------------
// RaftCtx: the callback surface implementation
// ---------------------------------------------------------------------------

/// Replication-thread state behind the engine's callback surface.
struct RaftCtx {
    node_id: NodeId,
    log: crate::cluster::raft_log::RaftLogFile,
    links: HashMap<NodeId, PeerLink>,
    store: Arc<Store>,
    pending: PendingRequests,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    /// Promotions requested by the engine mid-call, submitted by the loop
    /// right after the engine call returns.
    deferred_promotions: Vec<NodeId>,
}

impl RaftCtx {
    fn ensure_link(&mut self, id: NodeId, addr: NodeAddress) {
        if id == self.node_id {
            return;
        }
        self.links
            .entry(id)
            .or_insert_with(|| PeerLink::new(self.node_id, id, addr, self.peer_events.clone()));
    }
}

impl RaftHooks for RaftCtx {
    fn send_request_vote(&mut self, node: NodeId, msg: &RequestVoteMsg) {
        match self.links.get_mut(&node) {
            Some(link) => link.send_request_vote(msg),
            None => debug!(peer = node, "no link for requestvote"),
        }
    }

    fn send_append_entries(
        &mut self,
        node: NodeId,
        msg: &crate::cluster::engine::AppendEntriesMsg,
    ) {
        match self.links.get_mut(&node) {
            Some(link) => link.send_append_entries(msg),
            None => debug!(peer = node, "no link for appendentries"),
        }
    }

    fn persist_vote(&mut self, vote: Option<NodeId>) -> std::result::Result<(), RaftError> {
        self.log.set_vote(vote).map_err(|e| {
            error!(error = %e, "failed to persist vote");
            RaftError::Shutdown
        })
    }

    fn persist_term(
        &mut self,
        term: u64,
        vote: Option<NodeId>,
    ) -> std::result::Result<(), RaftError> {
        self.log.set_term(term, vote).map_err(|e| {
            error!(error = %e, "failed to persist term");
            RaftError::Shutdown
        })
    }

    fn log_offer(&mut self, entry: &Entry, idx: u64) -> std::result::Result<(), RaftError> {
        self.log.append(entry).map_err(|e| {
            error!(error = %e, idx, "failed to append log entry");
            RaftError::Shutdown
        })?;

        if !entry.etype.is_cfg_change() {
            return Ok(());
        }
        match RaftCfgChange::decode(&entry.data) {
            Ok(change) => match entry.etype {
                EntryType::AddNode | EntryType::AddNonvotingNode => {
                    self.ensure_link(change.id, change.addr);
                }
                EntryType::RemoveNode => {
                    self.links.remove(&change.id);
                }
                EntryType::Normal => {}
            },
            Err(e) => {
                warn!(idx, error = %e, "undecodable membership payload");
            }
        }
        Ok(())
    }

    fn apply_log(&mut self, entry: &Entry, idx: u64) -> std::result::Result<(), RaftError> {
        self.log.set_commit(idx);

        match entry.etype {
            EntryType::Normal => {
                match decode_command(&entry.data) {
                    Ok(argv) => {
                        let reply = self.store.execute(&argv);
                        if let Some(token) = entry.user_data {
                            if let Some((_argv, client)) = self.pending.take(token) {
                                client.reply(reply);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(idx, error = %e, "undecodable command payload");
                        if let Some(token) = entry.user_data {
                            if let Some((_argv, client)) = self.pending.take(token) {
                                client.reply(Frame::error("ERR unreadable command"));
                            }
                        }
                    }
                }
            }
            EntryType::RemoveNode => {
                if RaftCfgChange::decode_id(&entry.data) == Some(self.node_id) {
                    info!(node_id = self.node_id, "removed from cluster");
                    return Err(RaftError::Shutdown);
                }
            }
            EntryType::AddNode | EntryType::AddNonvotingNode => {}
        }
        Ok(())
    }

    fn entry_node_id(&self, entry: &Entry) -> Option<NodeId> {
        RaftCfgChange::decode_id(&entry.data)
    }

    fn node_caught_up(&mut self, node: NodeId) {
        debug!(peer = node, "node has sufficient logs");
        self.deferred_promotions.push(node);
    }

    fn log_line(&self, line: &str) {
        debug!("[raft] {line}");
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Front-end handle to the replication thread.
///
/// Cloneable; all clones feed the same FIFO queue. Dropping every clone
/// stops the replication loop.
#[derive(Debug, Clone)]
pub struct RaftHandle {
    tx: mpsc::UnboundedSender<RaftReq>,
    shutdown: watch::Receiver<bool>,
}

impl RaftHandle {
    /// Enqueue a request. Returns false if the node has shut down.
    pub fn submit(&self, req: RaftReq) -> bool {
        self.tx.send(req).is_ok()
    }

    /// Whether the replication loop has exited.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Wait until the replication loop exits.
    pub async fn wait_shutdown(&mut self) {
        while !*self.shutdown.borrow() {
            if self.shutdown.changed().await.is_err() {
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RaftNode
// ---------------------------------------------------------------------------

/// A fully initialized cluster node, ready to start its replication
/// thread.
pub struct RaftNode {
    engine: RaftEngine,
    ctx: RaftCtx,
    req_rx: mpsc::UnboundedReceiver<RaftReq>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    handle: RaftHandle,
    shutdown_tx: watch::Sender<bool>,
}

impl RaftNode {
    /// Initialize a node: create or reopen the log, restore engine state,
    /// and prepare the replication loop.
    pub fn new(config: &NodeConfig, store: Arc<Store>) -> Result<Self> {
        config.validate()?;
        let node_id = config.node_id;
        let path = config.log_path();

        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut engine = RaftEngine::new(node_id, RaftConfig::default());

        if config.init || config.join {
            let log = crate::cluster::raft_log::RaftLogFile::create(&path)?;
            let mut ctx = RaftCtx {
                node_id,
                log,
                links: HashMap::new(),
                store,
                pending: PendingRequests::new(),
                peer_events: peer_tx,
                deferred_promotions: Vec::new(),
            };

            if config.init {
                engine.add_member(node_id, true);
                engine
                    .become_leader(&mut ctx)
                    .map_err(|e| crate::error::MagnetiteError::Raft(e.to_string()))?;
                let change = RaftCfgChange::new(node_id, config.addr.clone());
                let entry = Entry::new(EntryType::AddNode, change.encode());
                engine
                    .recv_entry(&mut ctx, entry)
                    .map_err(|e| crate::error::MagnetiteError::Raft(e.to_string()))?;
                info!(node_id, addr = %config.addr, "initialized new cluster");
            } else {
                engine.add_member(node_id, false);
                info!(node_id, addr = %config.addr, "waiting to join a cluster");
            }

            Ok(Self {
                engine,
                ctx,
                req_rx,
                peer_rx,
                handle: RaftHandle {
                    tx: req_tx,
                    shutdown: shutdown_rx,
                },
                shutdown_tx,
            })
        } else {
            let mut log = crate::cluster::raft_log::RaftLogFile::open(&path)?;
            let header = *log.header();

            let mut entries = Vec::new();
            let loaded = log.load_entries(|e| entries.push(e))?;
            info!(node_id, entries = loaded, path = %path.display(), "raft log loaded");

            let mut ctx = RaftCtx {
                node_id,
                log,
                links: HashMap::new(),
                store,
                pending: PendingRequests::new(),
                peer_events: peer_tx,
                deferred_promotions: Vec::new(),
            };

            for entry in entries {
                let cfg_id = if entry.etype.is_cfg_change() {
                    match RaftCfgChange::decode(&entry.data) {
                        Ok(change) => {
                            match entry.etype {
                                EntryType::AddNode | EntryType::AddNonvotingNode => {
                                    ctx.ensure_link(change.id, change.addr.clone());
                                }
                                EntryType::RemoveNode => {
                                    ctx.links.remove(&change.id);
                                }
                                EntryType::Normal => {}
                            }
                            Some(change.id)
                        }
                        Err(e) => {
                            warn!(error = %e, "skipping undecodable membership payload");
                            None
                        }
                    }
                } else {
                    None
                };
                engine.load_entry(entry, cfg_id);
            }

            engine.restore_term(header.current_term);
            engine.restore_vote(header.voted_for);
            engine.restore_commit(header.commit_idx);
            engine
                .apply_all(&mut ctx)
                .map_err(|e| crate::error::MagnetiteError::Raft(e.to_string()))?;

            Ok(Self {
                engine,
                ctx,
                req_rx,
                peer_rx,
                handle: RaftHandle {
                    tx: req_tx,
                    shutdown: shutdown_rx,
                },
                shutdown_tx,
            })
        }
    }

    /// The handle front-end tasks use to reach this node.
    pub fn handle(&self) -> RaftHandle {
        self.handle.clone()
    }

    /// Spawn the replication thread and return its join handle.
    pub fn start(self) -> Result<std::thread::JoinHandle<()>> {
        let RaftNode {
            engine,
            ctx,
            req_rx,
            peer_rx,
            handle: _,
            shutdown_tx,
        } = self;
        let join = std::thread::Builder::new()
            .name("magnetite-raft".into())
            .spawn(move || {
                run_replication_loop(engine, ctx, req_rx, peer_rx, shutdown_tx);
            })?;
        Ok(join)
    }
}

// ---------------------------------------------------------------------------
// Replication loop
// ---------------------------------------------------------------------------

fn run_replication_loop(
    mut engine: RaftEngine,
    mut ctx: RaftCtx,
    mut req_rx: mpsc::UnboundedReceiver<RaftReq>,
    mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    shutdown_tx: watch::Sender<bool>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build replication runtime");
            let _ = shutdown_tx.send(true);
            return;
        }
    };
    let local = tokio::task::LocalSet::new();

    local.block_on(&rt, async move {
        let mut tick = tokio::time::interval(Duration::from_millis(TICK_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let step: std::result::Result<(), RaftError> = tokio::select! {
                _ = tick.tick() => {
                    engine
                        .periodic(&mut ctx, TICK_MS)
                        .and_then(|_| engine.apply_all(&mut ctx))
                }
                req = req_rx.recv() => {
                    match req {
                        Some(req) => handle_request(&mut engine, &mut ctx, req),
                        None => break,
                    }
                }
                ev = peer_rx.recv() => {
                    match ev {
                        Some(ev) => handle_peer_event(&mut engine, &mut ctx, ev),
                        // The loop holds a sender clone; this cannot close
                        // before the loop ends.
                        None => break,
                    }
                }
            };

            let step = step.and_then(|_| flush_promotions(&mut engine, &mut ctx));
            if let Err(e) = step {
                match e {
                    RaftError::Shutdown => info!("replication loop stopping"),
                    other => error!(error = %other, "replication loop failed"),
                }
                break;
            }
        }

        if let Err(e) = ctx.log.sync_header() {
            warn!(error = %e, "final header sync failed");
        }
        let _ = shutdown_tx.send(true);
    });
}

/// Submit promotions queued by `node_caught_up` during the last engine
/// call.
fn flush_promotions(
    engine: &mut RaftEngine,
    ctx: &mut RaftCtx,
) -> std::result::Result<(), RaftError> {
    while let Some(id) = ctx.deferred_promotions.pop() {
        let Some(addr) = ctx.links.get(&id).map(|l| l.addr.clone()) else {
            continue;
        };
        let change = RaftCfgChange::new(id, addr);
        let entry = Entry::new(EntryType::AddNode, change.encode());
        match engine.recv_entry(ctx, entry) {
            Ok((idx, _)) => info!(peer = id, idx, "promoting node to voting member"),
            Err(RaftError::Shutdown) => return Err(RaftError::Shutdown),
            Err(e) => warn!(peer = id, error = %e, "promotion submit failed"),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Request handlers
// ---------------------------------------------------------------------------

fn handle_request(
    engine: &mut RaftEngine,
    ctx: &mut RaftCtx,
    req: RaftReq,
) -> std::result::Result<(), RaftError> {
    debug!(kind = req.kind(), "handling raft request");
    match req {
        RaftReq::RequestVote { src: _, msg, client } => {
            match engine.recv_request_vote(ctx, &msg) {
                Ok(reply) => client.reply(Frame::array(vec![
                    Frame::integer(reply.term as i64),
                    Frame::integer(reply.vote_granted as i64),
                ])),
                Err(RaftError::Shutdown) => {
                    client.reply(operation_failed(&RaftError::Shutdown));
                    return Err(RaftError::Shutdown);
                }
                Err(e) => client.reply(operation_failed(&e)),
            }
        }
        RaftReq::AppendEntries { src, msg, client } => {
            match engine.recv_append_entries(ctx, src, &msg) {
                Ok(reply) => client.reply(Frame::array(vec![
                    Frame::integer(reply.term as i64),
                    Frame::integer(reply.success as i64),
                    Frame::integer(reply.current_idx as i64),
                    Frame::integer(reply.first_idx as i64),
                ])),
                Err(RaftError::Shutdown) => {
                    client.reply(operation_failed(&RaftError::Shutdown));
                    return Err(RaftError::Shutdown);
                }
                Err(e) => client.reply(operation_failed(&e)),
            }
        }
        RaftReq::CfgChangeAddNode { id, addr, client } => {
            let change = RaftCfgChange::new(id, addr);
            let entry = Entry::new(EntryType::AddNonvotingNode, change.encode());
            submit_cfg_change(engine, ctx, entry, client)?;
        }
        RaftReq::CfgChangeRemoveNode { id, client } => {
            let addr = ctx
                .links
                .get(&id)
                .map(|l| l.addr.clone())
                .unwrap_or_else(|| NodeAddress::new("", 0));
            let change = RaftCfgChange::new(id, addr);
            let entry = Entry::new(EntryType::RemoveNode, change.encode());
            submit_cfg_change(engine, ctx, entry, client)?;
        }
        RaftReq::Command { argv, client } => {
            handle_command(engine, ctx, argv, client)?;
        }
        RaftReq::Info { client } => {
            let report = format_info(engine, &ctx.links);
            client.reply(Frame::bulk(report));
        }
    }
    Ok(())
}

fn submit_cfg_change(
    engine: &mut RaftEngine,
    ctx: &mut RaftCtx,
    entry: Entry,
    client: BlockedClient,
) -> std::result::Result<(), RaftError> {
    match engine.recv_entry(ctx, entry) {
        Ok(_) => client.reply(Frame::simple("OK")),
        Err(RaftError::Shutdown) => {
            client.reply(Frame::simple("ERROR"));
            return Err(RaftError::Shutdown);
        }
        Err(_) => client.reply(Frame::simple("ERROR")),
    }
    Ok(())
}

fn handle_command(
    engine: &mut RaftEngine,
    ctx: &mut RaftCtx,
    argv: Vec<bytes::Bytes>,
    client: BlockedClient,
) -> std::result::Result<(), RaftError> {
    let Some(leader) = engine.leader_id() else {
        client.reply(Frame::error("NOLEADER"));
        return Ok(());
    };
    if leader != ctx.node_id {
        match ctx.links.get(&leader) {
            Some(link) => {
                client.reply(Frame::error(format!(
                    "LEADERIS {}:{}",
                    link.addr.host, link.addr.port
                )));
            }
            None => client.reply(Frame::error("NOLEADER")),
        }
        return Ok(());
    }

    let data = encode_command(&argv);
    let token = ctx.pending.park(argv, client);
    let mut entry = Entry::new(EntryType::Normal, data);
    entry.user_data = Some(token);

    match engine.recv_entry(ctx, entry) {
        Ok(_) => {
            // Waiting for commit; the apply path owns the reply now.
        }
        Err(e) => {
            if let Some((_argv, client)) = ctx.pending.take(token) {
                client.reply(Frame::simple("ERROR"));
            }
            if e == RaftError::Shutdown {
                return Err(RaftError::Shutdown);
            }
        }
    }
    Ok(())
}

fn handle_peer_event(
    engine: &mut RaftEngine,
    ctx: &mut RaftCtx,
    ev: PeerEvent,
) -> std::result::Result<(), RaftError> {
    match ev {
        PeerEvent::Connected { id } => {
            if let Some(link) = ctx.links.get_mut(&id) {
                debug!(peer = id, "peer connected");
                link.mark_connected();
            }
        }
        PeerEvent::Disconnected { id } => {
            if let Some(link) = ctx.links.get_mut(&id) {
                debug!(peer = id, "peer disconnected");
                link.mark_disconnected();
            }
        }
        PeerEvent::VoteReply { id, reply } => {
            engine.recv_request_vote_response(ctx, id, &reply)?;
        }
        PeerEvent::AppendReply { id, reply } => {
            engine.recv_append_entries_response(ctx, id, &reply)?;
            // The leader's commit index may have advanced.
            engine.apply_all(ctx)?;
        }
    }
    Ok(())
}

fn operation_failed(e: &RaftError) -> Frame {
    Frame::error(format!("operation failed, error {e}"))
}
