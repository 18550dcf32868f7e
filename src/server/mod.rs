//! TCP front end
//!
//! Accepts client and peer connections, parses RESP commands, and pushes
//! everything consensus-related onto the replication queue. Connection
//! tasks run on the shared runtime; each parks on its request's reply
//! handle, so a command that is waiting for commit simply keeps its
//! client blocked.

mod connection;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::cluster::node::RaftHandle;
use crate::error::Result;

/// The network server.
pub struct Server {
    handle: RaftHandle,
}

impl Server {
    /// Create a server that feeds the given replication handle.
    pub fn new(handle: RaftHandle) -> Self {
        Self { handle }
    }

    /// Accept connections until the listener fails.
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "listening");
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    let handle = self.handle.clone();
                    tokio::spawn(async move {
                        connection::handle_connection(socket, peer, handle).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }
}
