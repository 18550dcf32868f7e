//! Raft consensus engine
//!
//! Election and replication arithmetic behind a synchronous callback
//! surface. The engine owns the in-memory log, the member table, term and
//! vote state, and the commit/match bookkeeping; everything with a side
//! effect outside the engine — sending an RPC, persisting state, applying
//! a committed entry — goes through [`RaftHooks`], which the coordinator
//! implements. All engine methods are invoked from a single thread; the
//! engine takes no locks.
//!
//! Time is driven externally: the owner calls [`RaftEngine::periodic`]
//! with the elapsed milliseconds, which advances election and heartbeat
//! timers.

use std::collections::HashSet;

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, info};

use crate::config::NodeId;

/// Raft term number.
pub type Term = u64;

/// Log index (1-based, 0 means "no entry").
pub type LogIndex = u64;

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// Discriminant for replicated log entry types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    /// An opaque command for the state machine.
    Normal,
    /// Add a voting member.
    AddNode,
    /// Add a non-voting member (replicated to, never counted for quorum).
    AddNonvotingNode,
    /// Remove a member.
    RemoveNode,
}

impl EntryType {
    /// Whether this entry mutates cluster membership.
    pub fn is_cfg_change(self) -> bool {
        !matches!(self, EntryType::Normal)
    }

    /// Wire/disk code for this type.
    pub fn as_u8(self) -> u8 {
        match self {
            EntryType::Normal => 0,
            EntryType::AddNode => 1,
            EntryType::AddNonvotingNode => 2,
            EntryType::RemoveNode => 3,
        }
    }

    /// Decode a wire/disk code.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(EntryType::Normal),
            1 => Some(EntryType::AddNode),
            2 => Some(EntryType::AddNonvotingNode),
            3 => Some(EntryType::RemoveNode),
            _ => None,
        }
    }
}

/// A single entry in the replicated log.
///
/// `user_data` is a token into the coordinator's pending-request arena.
/// It is set only on the leader, only for locally originated entries, and
/// is neither persisted nor replicated.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Term when the entry was created.
    pub term: Term,
    /// Random identifier assigned at submission.
    pub id: u32,
    /// Entry type.
    pub etype: EntryType,
    /// Opaque payload (command codec or membership payload).
    pub data: Bytes,
    /// Pending-request token; local to the originating node.
    pub user_data: Option<u64>,
}

impl Entry {
    /// Create a new entry with a random id and no pending-request token.
    pub fn new(etype: EntryType, data: Bytes) -> Self {
        Self {
            term: 0,
            id: rand::thread_rng().gen(),
            etype,
            data,
            user_data: None,
        }
    }
}

// ---------------------------------------------------------------------------
// RPC messages
// ---------------------------------------------------------------------------

/// RequestVote RPC arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteMsg {
    /// Candidate's term.
    pub term: Term,
    /// Candidate requesting the vote.
    pub candidate_id: NodeId,
    /// Index of the candidate's last log entry.
    pub last_log_idx: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

/// RequestVote RPC reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestVoteReply {
    /// Responder's current term.
    pub term: Term,
    /// Whether the vote was granted.
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendEntriesMsg {
    /// Leader's term.
    pub term: Term,
    /// Index of the entry immediately preceding the new ones.
    pub prev_log_idx: LogIndex,
    /// Term of the entry at `prev_log_idx`.
    pub prev_log_term: Term,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
    /// Entries to store (empty for heartbeat).
    pub entries: Vec<Entry>,
}

/// AppendEntries RPC reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendEntriesReply {
    /// Responder's current term.
    pub term: Term,
    /// Whether the entries were accepted.
    pub success: bool,
    /// Responder's last log index after processing.
    pub current_idx: LogIndex,
    /// Index of the first entry in the accepted batch.
    pub first_idx: LogIndex,
}

// ---------------------------------------------------------------------------
// Roles and errors
// ---------------------------------------------------------------------------

/// Node role in the consensus protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Passive node that responds to RPCs.
    Follower,
    /// Actively seeking votes to become leader.
    Candidate,
    /// Authoritative node that drives log replication.
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Errors surfaced by the engine and the callback surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RaftError {
    /// Durability or terminal failure; the node must shut down.
    #[error("raft shutdown required")]
    Shutdown,

    /// The operation requires leadership this node does not hold.
    #[error("not the leader")]
    NotLeader,

    /// The referenced member is not in the cluster view.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
}

// ---------------------------------------------------------------------------
// Callback surface
// ---------------------------------------------------------------------------

/// The contract between the engine and its host.
///
/// Invoked synchronously on the replication thread only. Send callbacks
/// are fire-and-forget: a failed or unsendable RPC is indistinguishable
/// from a lost packet, and the engine retries on later ticks. Persistence
/// callbacks are fatal on failure.
pub trait RaftHooks {
    /// Deliver a RequestVote RPC to a peer.
    fn send_request_vote(&mut self, node: NodeId, msg: &RequestVoteMsg);

    /// Deliver an AppendEntries RPC to a peer.
    fn send_append_entries(&mut self, node: NodeId, msg: &AppendEntriesMsg);

    /// Durably record the vote.
    fn persist_vote(&mut self, vote: Option<NodeId>) -> Result<(), RaftError>;

    /// Durably record the term (and the vote cast in it, if any).
    fn persist_term(&mut self, term: Term, vote: Option<NodeId>) -> Result<(), RaftError>;

    /// Durably append an entry; membership entries also create peer state.
    fn log_offer(&mut self, entry: &Entry, idx: LogIndex) -> Result<(), RaftError>;

    /// An entry is being truncated from the tail of the log.
    fn log_pop(&mut self, entry: &Entry, idx: LogIndex) -> Result<(), RaftError> {
        let _ = (entry, idx);
        Ok(())
    }

    /// Apply a committed entry to the state machine.
    fn apply_log(&mut self, entry: &Entry, idx: LogIndex) -> Result<(), RaftError>;

    /// Extract the member id from a membership entry's payload.
    fn entry_node_id(&self, entry: &Entry) -> Option<NodeId>;

    /// A non-voting member has caught up and can be promoted.
    fn node_caught_up(&mut self, node: NodeId);

    /// Debug sink for engine-internal events.
    fn log_line(&self, line: &str) {
        let _ = line;
    }
}

// ---------------------------------------------------------------------------
// Members
// ---------------------------------------------------------------------------

/// Engine-side view of one cluster member.
#[derive(Debug, Clone)]
pub struct Member {
    /// Member id.
    pub id: NodeId,
    /// Whether the member counts toward quorum.
    pub voting: bool,
    /// Whether this member is the local node.
    pub is_self: bool,
    /// Next log index to send (leader bookkeeping).
    next_idx: LogIndex,
    /// Highest log index known replicated (leader bookkeeping).
    match_idx: LogIndex,
    /// Promotion already requested for this catch-up cycle.
    promotion_requested: bool,
}

// ---------------------------------------------------------------------------
// Engine configuration
// ---------------------------------------------------------------------------

/// Timing configuration for the engine.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Minimum randomized election timeout in milliseconds.
    pub election_timeout_min_ms: u64,
    /// Maximum randomized election timeout in milliseconds.
    pub election_timeout_max_ms: u64,
    /// Interval between leader heartbeats in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Maximum entries per AppendEntries RPC.
    pub max_entries_per_append: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 1500,
            election_timeout_max_ms: 3000,
            heartbeat_interval_ms: 500,
            max_entries_per_append: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// RaftEngine
// ---------------------------------------------------------------------------

/// The consensus engine.
pub struct RaftEngine {
    id: NodeId,
    role: Role,
    current_term: Term,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    log: Vec<Entry>,
    commit_idx: LogIndex,
    last_applied: LogIndex,
    members: Vec<Member>,
    votes: HashSet<NodeId>,
    election_elapsed_ms: u64,
    election_timeout_ms: u64,
    heartbeat_elapsed_ms: u64,
    config: RaftConfig,
}

impl RaftEngine {
    /// Create an engine for the given local node id.
    pub fn new(id: NodeId, config: RaftConfig) -> Self {
        let election_timeout_ms = Self::random_timeout(&config);
        Self {
            id,
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            log: Vec::new(),
            commit_idx: 0,
            last_applied: 0,
            members: Vec::new(),
            votes: HashSet::new(),
            election_elapsed_ms: 0,
            election_timeout_ms,
            heartbeat_elapsed_ms: 0,
            config,
        }
    }

    /// Create an engine with default timing.
    pub fn with_defaults(id: NodeId) -> Self {
        Self::new(id, RaftConfig::default())
    }

    fn random_timeout(config: &RaftConfig) -> u64 {
        rand::thread_rng()
            .gen_range(config.election_timeout_min_ms..=config.election_timeout_max_ms)
    }

    // -- accessors ---------------------------------------------------------

    /// Local node id.
    pub fn node_id(&self) -> NodeId {
        self.id
    }

    /// Current role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether this node currently leads.
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Current term.
    pub fn current_term(&self) -> Term {
        self.current_term
    }

    /// Known leader id, if any.
    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    /// The vote cast in the current term, if any.
    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    /// Highest committed index.
    pub fn commit_idx(&self) -> LogIndex {
        self.commit_idx
    }

    /// Highest applied index.
    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Index of the last log entry (0 when empty).
    pub fn last_log_idx(&self) -> LogIndex {
        self.log.len() as LogIndex
    }

    /// Number of entries in the in-memory log.
    pub fn entry_count(&self) -> usize {
        self.log.len()
    }

    /// The entry at a 1-based index.
    pub fn entry(&self, idx: LogIndex) -> Option<&Entry> {
        if idx == 0 {
            return None;
        }
        self.log.get(idx as usize - 1)
    }

    /// Iterate the member table.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter()
    }

    /// Look up a member.
    pub fn member(&self, id: NodeId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    fn member_mut(&mut self, id: NodeId) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.id == id)
    }

    fn term_at(&self, idx: LogIndex) -> Term {
        self.entry(idx).map(|e| e.term).unwrap_or(0)
    }

    fn last_log_term(&self) -> Term {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    fn voting_count(&self) -> usize {
        self.members.iter().filter(|m| m.voting).count()
    }

    /// Votes needed to win an election or commit an entry.
    pub fn quorum_size(&self) -> usize {
        self.voting_count() / 2 + 1
    }

    // -- membership --------------------------------------------------------

    /// Add (or promote) a member. Used at bootstrap and at offer time for
    /// membership entries.
    pub fn add_member(&mut self, id: NodeId, voting: bool) {
        let last = self.last_log_idx();
        if let Some(m) = self.member_mut(id) {
            if voting && !m.voting {
                m.voting = true;
                m.promotion_requested = false;
            }
            return;
        }
        self.members.push(Member {
            id,
            voting,
            is_self: id == self.id,
            next_idx: last + 1,
            match_idx: 0,
            promotion_requested: false,
        });
    }

    /// Remove a member from the cluster view.
    pub fn remove_member(&mut self, id: NodeId) {
        self.members.retain(|m| m.id != id);
    }

    // -- startup restore ---------------------------------------------------

    /// Restore the persisted term (no hook side effects).
    pub fn restore_term(&mut self, term: Term) {
        self.current_term = term;
    }

    /// Restore the persisted vote (no hook side effects).
    pub fn restore_vote(&mut self, vote: Option<NodeId>) {
        self.voted_for = vote;
    }

    /// Restore the persisted commit index (no hook side effects).
    pub fn restore_commit(&mut self, idx: LogIndex) {
        self.commit_idx = idx.min(self.last_log_idx());
    }

    /// Append a replayed entry during startup. `cfg_id` carries the
    /// decoded member id for membership entries; peer-link construction is
    /// the caller's job.
    pub fn load_entry(&mut self, entry: Entry, cfg_id: Option<NodeId>) {
        if entry.etype.is_cfg_change() {
            if let Some(id) = cfg_id {
                self.apply_membership(entry.etype, id);
            }
        }
        self.log.push(entry);
    }

    fn apply_membership(&mut self, etype: EntryType, id: NodeId) {
        match etype {
            EntryType::AddNode => self.add_member(id, true),
            EntryType::AddNonvotingNode => self.add_member(id, false),
            EntryType::RemoveNode => self.remove_member(id),
            EntryType::Normal => {}
        }
    }

    // -- role transitions --------------------------------------------------

    fn transition_to(&mut self, role: Role) {
        if self.role == role {
            return;
        }
        info!(
            node_id = self.id,
            from = %self.role,
            to = %role,
            term = self.current_term,
            "role transition"
        );
        self.role = role;
        match role {
            Role::Leader => {
                self.leader_id = Some(self.id);
                let last = self.last_log_idx();
                for m in &mut self.members {
                    m.next_idx = last + 1;
                    m.match_idx = if m.is_self { last } else { 0 };
                }
            }
            Role::Follower | Role::Candidate => {
                self.votes.clear();
            }
        }
    }

    /// Force leadership, bootstrapping the very first node of a cluster.
    pub fn become_leader<H: RaftHooks>(&mut self, hooks: &mut H) -> Result<(), RaftError> {
        if self.current_term == 0 {
            self.current_term = 1;
            self.voted_for = Some(self.id);
            hooks.persist_term(1, Some(self.id))?;
        }
        self.transition_to(Role::Leader);
        Ok(())
    }

    fn step_down<H: RaftHooks>(&mut self, hooks: &mut H, new_term: Term) -> Result<(), RaftError> {
        if new_term <= self.current_term {
            return Ok(());
        }
        debug!(
            node_id = self.id,
            old_term = self.current_term,
            new_term,
            "stepping down: higher term observed"
        );
        self.current_term = new_term;
        self.voted_for = None;
        hooks.persist_term(new_term, None)?;
        self.leader_id = None;
        self.transition_to(Role::Follower);
        self.reset_election_timer();
        Ok(())
    }

    fn reset_election_timer(&mut self) {
        self.election_elapsed_ms = 0;
        self.election_timeout_ms = Self::random_timeout(&self.config);
    }

    // -- periodic clock ----------------------------------------------------

    /// Advance the engine clock by `ms` milliseconds.
    ///
    /// Drives election timeouts on followers/candidates and heartbeats on
    /// the leader. The caller follows each tick with [`apply_all`].
    ///
    /// [`apply_all`]: RaftEngine::apply_all
    pub fn periodic<H: RaftHooks>(&mut self, hooks: &mut H, ms: u64) -> Result<(), RaftError> {
        match self.role {
            Role::Leader => {
                self.heartbeat_elapsed_ms += ms;
                if self.heartbeat_elapsed_ms >= self.config.heartbeat_interval_ms {
                    self.send_append_entries_all(hooks);
                }
            }
            Role::Follower | Role::Candidate => {
                // A non-voting member never starts elections.
                let self_votes = self.member(self.id).map(|m| m.voting).unwrap_or(false);
                self.election_elapsed_ms += ms;
                if self_votes && self.election_elapsed_ms >= self.election_timeout_ms {
                    self.start_election(hooks)?;
                }
            }
        }
        Ok(())
    }

    fn start_election<H: RaftHooks>(&mut self, hooks: &mut H) -> Result<(), RaftError> {
        self.current_term += 1;
        self.voted_for = Some(self.id);
        hooks.persist_term(self.current_term, Some(self.id))?;
        self.transition_to(Role::Candidate);
        self.reset_election_timer();
        self.votes.clear();
        self.votes.insert(self.id);
        hooks.log_line(&format!(
            "node {} starting election for term {}",
            self.id, self.current_term
        ));

        if self.votes.len() >= self.quorum_size() {
            self.transition_to(Role::Leader);
            self.send_append_entries_all(hooks);
            return Ok(());
        }

        let msg = RequestVoteMsg {
            term: self.current_term,
            candidate_id: self.id,
            last_log_idx: self.last_log_idx(),
            last_log_term: self.last_log_term(),
        };
        let targets: Vec<NodeId> = self
            .members
            .iter()
            .filter(|m| m.voting && !m.is_self)
            .map(|m| m.id)
            .collect();
        for id in targets {
            hooks.send_request_vote(id, &msg);
        }
        Ok(())
    }

    // -- RequestVote -------------------------------------------------------

    /// Process an inbound RequestVote RPC.
    pub fn recv_request_vote<H: RaftHooks>(
        &mut self,
        hooks: &mut H,
        msg: &RequestVoteMsg,
    ) -> Result<RequestVoteReply, RaftError> {
        if msg.term > self.current_term {
            self.step_down(hooks, msg.term)?;
        }

        if msg.term < self.current_term {
            return Ok(RequestVoteReply {
                term: self.current_term,
                vote_granted: false,
            });
        }

        let log_ok = msg.last_log_term > self.last_log_term()
            || (msg.last_log_term == self.last_log_term()
                && msg.last_log_idx >= self.last_log_idx());
        let can_vote =
            self.voted_for.is_none() || self.voted_for == Some(msg.candidate_id);
        let vote_granted = can_vote && log_ok;

        if vote_granted {
            self.voted_for = Some(msg.candidate_id);
            hooks.persist_vote(Some(msg.candidate_id))?;
            self.reset_election_timer();
            debug!(
                node_id = self.id,
                candidate = msg.candidate_id,
                term = msg.term,
                "granted vote"
            );
        }

        Ok(RequestVoteReply {
            term: self.current_term,
            vote_granted,
        })
    }

    /// Process a RequestVote reply from a peer.
    pub fn recv_request_vote_response<H: RaftHooks>(
        &mut self,
        hooks: &mut H,
        src: NodeId,
        reply: &RequestVoteReply,
    ) -> Result<(), RaftError> {
        if reply.term > self.current_term {
            return self.step_down(hooks, reply.term);
        }
        if self.role != Role::Candidate || !reply.vote_granted || reply.term < self.current_term
        {
            return Ok(());
        }
        self.votes.insert(src);
        if self.votes.len() >= self.quorum_size() {
            info!(
                node_id = self.id,
                votes = self.votes.len(),
                term = self.current_term,
                "won election"
            );
            self.transition_to(Role::Leader);
            self.send_append_entries_all(hooks);
        }
        Ok(())
    }

    // -- AppendEntries -----------------------------------------------------

    /// Process an inbound AppendEntries RPC.
    pub fn recv_append_entries<H: RaftHooks>(
        &mut self,
        hooks: &mut H,
        src: NodeId,
        msg: &AppendEntriesMsg,
    ) -> Result<AppendEntriesReply, RaftError> {
        if msg.term < self.current_term {
            return Ok(AppendEntriesReply {
                term: self.current_term,
                success: false,
                current_idx: self.last_log_idx(),
                first_idx: 0,
            });
        }
        if msg.term > self.current_term {
            self.step_down(hooks, msg.term)?;
        }
        self.leader_id = Some(src);
        if self.role != Role::Follower {
            self.transition_to(Role::Follower);
        }
        self.reset_election_timer();

        // Consistency check at prev_log_idx.
        if msg.prev_log_idx > 0 {
            if msg.prev_log_idx > self.last_log_idx() {
                return Ok(AppendEntriesReply {
                    term: self.current_term,
                    success: false,
                    current_idx: self.last_log_idx(),
                    first_idx: 0,
                });
            }
            if self.term_at(msg.prev_log_idx) != msg.prev_log_term {
                self.pop_to(hooks, msg.prev_log_idx - 1)?;
                return Ok(AppendEntriesReply {
                    term: self.current_term,
                    success: false,
                    current_idx: self.last_log_idx(),
                    first_idx: 0,
                });
            }
        }

        // Append new entries, resolving conflicts.
        for (i, entry) in msg.entries.iter().enumerate() {
            let idx = msg.prev_log_idx + 1 + i as LogIndex;
            if idx <= self.last_log_idx() {
                if self.term_at(idx) == entry.term {
                    continue;
                }
                self.pop_to(hooks, idx - 1)?;
            }
            let mut entry = entry.clone();
            entry.user_data = None;
            self.append_entry(hooks, entry)?;
        }

        if msg.leader_commit > self.commit_idx {
            self.commit_idx = msg.leader_commit.min(self.last_log_idx());
        }

        Ok(AppendEntriesReply {
            term: self.current_term,
            success: true,
            current_idx: self.last_log_idx(),
            first_idx: msg.prev_log_idx + 1,
        })
    }

    /// Process an AppendEntries reply from a peer. The caller follows a
    /// successful reply with [`apply_all`](RaftEngine::apply_all).
    pub fn recv_append_entries_response<H: RaftHooks>(
        &mut self,
        hooks: &mut H,
        src: NodeId,
        reply: &AppendEntriesReply,
    ) -> Result<(), RaftError> {
        if reply.term > self.current_term {
            return self.step_down(hooks, reply.term);
        }
        if self.role != Role::Leader {
            return Ok(());
        }
        let last = self.last_log_idx();
        let Some(m) = self.member_mut(src) else {
            return Ok(());
        };

        if reply.success {
            m.match_idx = reply.current_idx;
            m.next_idx = reply.current_idx + 1;
            let promote =
                !m.voting && !m.promotion_requested && m.match_idx >= last && last > 0;
            if promote {
                m.promotion_requested = true;
                hooks.node_caught_up(src);
            }
            self.try_advance_commit();
        } else {
            // Fast catch-up: jump to the follower's reported last index.
            m.next_idx = (reply.current_idx + 1).min(last + 1).max(1);
        }
        Ok(())
    }

    fn try_advance_commit(&mut self) {
        let last = self.last_log_idx();
        let quorum = self.quorum_size();
        for n in (self.commit_idx + 1)..=last {
            // Only current-term entries commit by counting.
            if self.term_at(n) != self.current_term {
                continue;
            }
            let count = self
                .members
                .iter()
                .filter(|m| m.voting && (m.is_self || m.match_idx >= n))
                .count();
            if count >= quorum {
                self.commit_idx = n;
                debug!(node_id = self.id, commit_idx = n, "advanced commit index");
            }
        }
    }

    // -- submission --------------------------------------------------------

    /// Submit a new entry on the leader. Returns the assigned index and
    /// term.
    pub fn recv_entry<H: RaftHooks>(
        &mut self,
        hooks: &mut H,
        mut entry: Entry,
    ) -> Result<(LogIndex, Term), RaftError> {
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader);
        }
        entry.term = self.current_term;
        let idx = self.append_entry(hooks, entry)?;
        if let Some(m) = self.member_mut(self.id) {
            m.match_idx = idx;
            m.next_idx = idx + 1;
        }
        self.try_advance_commit();
        Ok((idx, self.current_term))
    }

    /// Append an entry at the tail: durable offer first, then membership
    /// side effects, then the in-memory log.
    fn append_entry<H: RaftHooks>(
        &mut self,
        hooks: &mut H,
        entry: Entry,
    ) -> Result<LogIndex, RaftError> {
        let idx = self.last_log_idx() + 1;
        hooks.log_offer(&entry, idx)?;
        if entry.etype.is_cfg_change() {
            if let Some(id) = hooks.entry_node_id(&entry) {
                self.apply_membership(entry.etype, id);
            }
        }
        self.log.push(entry);
        Ok(idx)
    }

    /// Truncate the in-memory log down to `keep` entries, invoking
    /// `log_pop` for each removed entry from the tail inward.
    fn pop_to<H: RaftHooks>(&mut self, hooks: &mut H, keep: LogIndex) -> Result<(), RaftError> {
        while self.last_log_idx() > keep {
            let idx = self.last_log_idx();
            if let Some(entry) = self.log.pop() {
                hooks.log_pop(&entry, idx)?;
            }
        }
        if self.commit_idx > keep {
            self.commit_idx = keep;
        }
        Ok(())
    }

    // -- replication fan-out -----------------------------------------------

    fn send_append_entries_all<H: RaftHooks>(&mut self, hooks: &mut H) {
        self.heartbeat_elapsed_ms = 0;
        let mut rpcs = Vec::new();
        for m in self.members.iter().filter(|m| !m.is_self) {
            let prev_log_idx = m.next_idx.saturating_sub(1);
            let prev_log_term = self.term_at(prev_log_idx);
            let entries: Vec<Entry> = self
                .log
                .iter()
                .skip(prev_log_idx as usize)
                .take(self.config.max_entries_per_append)
                .map(|e| {
                    let mut e = e.clone();
                    e.user_data = None;
                    e
                })
                .collect();
            rpcs.push((
                m.id,
                AppendEntriesMsg {
                    term: self.current_term,
                    prev_log_idx,
                    prev_log_term,
                    leader_commit: self.commit_idx,
                    entries,
                },
            ));
        }
        for (id, msg) in rpcs {
            hooks.send_append_entries(id, &msg);
        }
    }

    // -- apply -------------------------------------------------------------

    /// Apply every committed-but-unapplied entry, in index order.
    pub fn apply_all<H: RaftHooks>(&mut self, hooks: &mut H) -> Result<(), RaftError> {
        while self.last_applied < self.commit_idx {
            let idx = self.last_applied + 1;
            let entry = match self.entry(idx) {
                Some(e) => e.clone(),
                None => break,
            };
            hooks.apply_log(&entry, idx)?;
            self.last_applied = idx;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RaftEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftEngine")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("term", &self.current_term)
            .field("entries", &self.log.len())
            .field("commit_idx", &self.commit_idx)
            .field("members", &self.members.len())
            .finish()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
