//! Connection handling
//!
//! Buffered per-connection loop: parse one RESP command array, route it,
//! wait for the reply, write it back. Peer RPCs and client commands share
//! the connection format; routing decides which become raft requests and
//! which are answered locally.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::cluster::engine::{AppendEntriesMsg, Entry, EntryType, RequestVoteMsg};
use crate::cluster::node::RaftHandle;
use crate::cluster::requests::{BlockedClient, RaftReq};
use crate::config::{NodeAddress, NodeId};
use crate::protocol::{encode_frame, parse_frame, Frame};

const READ_BUFFER_SIZE: usize = 4 * 1024;

/// Serve one connection until it closes or turns invalid.
pub(crate) async fn handle_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    handle: RaftHandle,
) {
    debug!(%peer, "connection opened");
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut out = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        let frame = loop {
            match parse_frame(&mut buf) {
                Ok(Some(frame)) => break frame,
                Ok(None) => {}
                Err(e) => {
                    out.clear();
                    encode_frame(&Frame::error(format!("ERR protocol error: {e}")), &mut out);
                    let _ = socket.write_all(&out).await;
                    debug!(%peer, error = %e, "closing connection on protocol error");
                    return;
                }
            }
            match socket.read_buf(&mut buf).await {
                Ok(0) => {
                    debug!(%peer, "connection closed");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(%peer, error = %e, "read failed");
                    return;
                }
            }
        };

        let reply = match extract_argv(frame) {
            Ok(argv) => serve(argv, &handle).await,
            Err(reply) => reply,
        };

        out.clear();
        encode_frame(&reply, &mut out);
        if let Err(e) = socket.write_all(&out).await {
            debug!(%peer, error = %e, "write failed");
            return;
        }
    }
}

/// A command must be an array of bulk strings.
fn extract_argv(frame: Frame) -> Result<Vec<Bytes>, Frame> {
    let Some(items) = frame.into_array() else {
        return Err(Frame::error("ERR protocol error: expected array"));
    };
    let mut argv = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Frame::Bulk(Some(b)) => argv.push(b),
            _ => {
                return Err(Frame::error(
                    "ERR protocol error: expected bulk string arguments",
                ))
            }
        }
    }
    if argv.is_empty() {
        return Err(Frame::error("ERR empty command"));
    }
    Ok(argv)
}

async fn serve(argv: Vec<Bytes>, handle: &RaftHandle) -> Frame {
    match route(argv) {
        Route::Local(frame) => frame,
        Route::Raft(build) => {
            let (client, rx) = BlockedClient::pair();
            if !handle.submit(build(client)) {
                return Frame::error("ERR raft node unavailable");
            }
            match rx.await {
                Ok(frame) => frame,
                Err(_) => Frame::error("ERR raft node unavailable"),
            }
        }
    }
}

/// Routing decision for one parsed command.
enum Route {
    /// Answer immediately without touching the replication thread.
    Local(Frame),
    /// Build a raft request around the caller's reply handle.
    Raft(Box<dyn FnOnce(BlockedClient) -> RaftReq + Send>),
}

fn route(argv: Vec<Bytes>) -> Route {
    let name = String::from_utf8_lossy(&argv[0]).to_ascii_uppercase();
    match name.as_str() {
        "PING" => Route::Local(Frame::simple("PONG")),
        "RAFT.REQUESTVOTE" => route_request_vote(&argv),
        "RAFT.APPENDENTRIES" => route_append_entries(&argv),
        "RAFT.ADDNODE" => route_add_node(&argv),
        "RAFT.REMOVENODE" => route_remove_node(&argv),
        "RAFT.INFO" | "INFO" => {
            if argv.len() != 1 {
                return Route::Local(Frame::error(
                    "ERR wrong number of arguments for 'info' command",
                ));
            }
            Route::Raft(Box::new(|client| RaftReq::Info { client }))
        }
        _ => Route::Raft(Box::new(move |client| RaftReq::Command { argv, client })),
    }
}

// ---------------------------------------------------------------------------
// Peer RPC parsing
// ---------------------------------------------------------------------------

fn malformed(what: &str) -> Route {
    warn!(rpc = what, "malformed inbound RPC");
    Route::Local(Frame::error("operation failed, error invalid message"))
}

fn route_request_vote(argv: &[Bytes]) -> Route {
    if argv.len() != 3 {
        return malformed("requestvote");
    }
    let Some(src) = parse_node_id(&argv[1]) else {
        return malformed("requestvote");
    };
    let Some(fields) = parse_colon_u64s(&argv[2], 4) else {
        return malformed("requestvote");
    };
    let msg = RequestVoteMsg {
        term: fields[0],
        candidate_id: fields[1] as NodeId,
        last_log_idx: fields[2],
        last_log_term: fields[3],
    };
    Route::Raft(Box::new(move |client| RaftReq::RequestVote {
        src,
        msg,
        client,
    }))
}

fn route_append_entries(argv: &[Bytes]) -> Route {
    if argv.len() < 4 {
        return malformed("appendentries");
    }
    let Some(src) = parse_node_id(&argv[1]) else {
        return malformed("appendentries");
    };
    let Some(hdr) = parse_colon_u64s(&argv[2], 4) else {
        return malformed("appendentries");
    };
    let Some(n_entries) = parse_usize(&argv[3]) else {
        return malformed("appendentries");
    };
    if argv.len() != 4 + n_entries * 2 {
        return malformed("appendentries");
    }

    let mut entries = Vec::with_capacity(n_entries);
    for i in 0..n_entries {
        let Some(entry_hdr) = parse_colon_u64s(&argv[4 + i * 2], 3) else {
            return malformed("appendentries");
        };
        let Some(etype) = u8::try_from(entry_hdr[2]).ok().and_then(EntryType::from_u8)
        else {
            return malformed("appendentries");
        };
        entries.push(Entry {
            term: entry_hdr[0],
            id: entry_hdr[1] as u32,
            etype,
            data: argv[5 + i * 2].clone(),
            user_data: None,
        });
    }

    let msg = AppendEntriesMsg {
        term: hdr[0],
        prev_log_idx: hdr[1],
        prev_log_term: hdr[2],
        leader_commit: hdr[3],
        entries,
    };
    Route::Raft(Box::new(move |client| RaftReq::AppendEntries {
        src,
        msg,
        client,
    }))
}

// ---------------------------------------------------------------------------
// Membership commands
// ---------------------------------------------------------------------------

fn route_add_node(argv: &[Bytes]) -> Route {
    if argv.len() != 3 {
        return Route::Local(Frame::error(
            "ERR wrong number of arguments for 'raft.addnode' command",
        ));
    }
    let Some(id) = parse_node_id(&argv[1]) else {
        return Route::Local(Frame::error("ERR invalid node id"));
    };
    let Some(addr) = std::str::from_utf8(&argv[2])
        .ok()
        .and_then(|s| NodeAddress::parse(s).ok())
    else {
        return Route::Local(Frame::error("ERR invalid node address"));
    };
    Route::Raft(Box::new(move |client| RaftReq::CfgChangeAddNode {
        id,
        addr,
        client,
    }))
}

fn route_remove_node(argv: &[Bytes]) -> Route {
    if argv.len() != 2 {
        return Route::Local(Frame::error(
            "ERR wrong number of arguments for 'raft.removenode' command",
        ));
    }
    let Some(id) = parse_node_id(&argv[1]) else {
        return Route::Local(Frame::error("ERR invalid node id"));
    };
    Route::Raft(Box::new(move |client| RaftReq::CfgChangeRemoveNode {
        id,
        client,
    }))
}

// ---------------------------------------------------------------------------
// Field parsing
// ---------------------------------------------------------------------------

fn parse_node_id(b: &[u8]) -> Option<NodeId> {
    std::str::from_utf8(b).ok()?.parse::<NodeId>().ok()
}

fn parse_usize(b: &[u8]) -> Option<usize> {
    std::str::from_utf8(b).ok()?.parse::<usize>().ok()
}

/// Parse exactly `n` colon-separated decimal integers.
fn parse_colon_u64s(b: &[u8], n: usize) -> Option<Vec<u64>> {
    let s = std::str::from_utf8(b).ok()?;
    let fields: Vec<u64> = s
        .split(':')
        .map(|p| p.parse::<u64>())
        .collect::<Result<_, _>>()
        .ok()?;
    if fields.len() != n {
        return None;
    }
    Some(fields)
}
