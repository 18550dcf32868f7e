//! Node startup configuration
//!
//! Command-line driven configuration for a single cluster node. There is
//! deliberately no configuration-file layer here; everything a node needs
//! to start is a handful of flags.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{MagnetiteError, Result};

/// Identifier of a cluster node. Zero is reserved as "no node".
pub type NodeId = u32;

/// Network address of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    /// Hostname or IP address.
    pub host: String,
    /// Client-facing port (peer RPCs share it).
    pub port: u16,
}

impl NodeAddress {
    /// Create a new address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` string.
    pub fn parse(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| MagnetiteError::Config(format!("invalid address '{s}'")))?;
        if host.is_empty() {
            return Err(MagnetiteError::Config(format!("invalid address '{s}'")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| MagnetiteError::Config(format!("invalid port in '{s}'")))?;
        Ok(Self::new(host, port))
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Startup configuration for a cluster node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier (nonzero).
    pub node_id: NodeId,
    /// Address this node advertises to peers and binds its listener on.
    pub addr: NodeAddress,
    /// Bootstrap a fresh single-node cluster and become leader.
    pub init: bool,
    /// Start with a fresh log and wait to be added to an existing cluster.
    pub join: bool,
    /// Raft log file path; defaults to `magnetite-log-<node_id>.db`.
    pub raft_log_path: Option<PathBuf>,
}

impl NodeConfig {
    /// Create a configuration with defaults for the optional fields.
    pub fn new(node_id: NodeId, addr: NodeAddress) -> Self {
        Self {
            node_id,
            addr,
            init: false,
            join: false,
            raft_log_path: None,
        }
    }

    /// Resolve the Raft log file path.
    pub fn log_path(&self) -> PathBuf {
        self.raft_log_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("magnetite-log-{}.db", self.node_id)))
    }

    /// Validate the configuration, returning an error for invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(MagnetiteError::Config("node id must be nonzero".into()));
        }
        if self.init && self.join {
            return Err(MagnetiteError::Config(
                "--init and --join are mutually exclusive".into(),
            ));
        }
        if self.addr.host.is_empty() {
            return Err(MagnetiteError::Config("bind host must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parse_and_display() {
        let addr = NodeAddress::parse("127.0.0.1:6379").unwrap();
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.port, 6379);
        assert_eq!(addr.to_string(), "127.0.0.1:6379");
    }

    #[test]
    fn address_parse_rejects_garbage() {
        assert!(NodeAddress::parse("nocolon").is_err());
        assert!(NodeAddress::parse(":123").is_err());
        assert!(NodeAddress::parse("host:notaport").is_err());
    }

    #[test]
    fn config_default_log_path() {
        let cfg = NodeConfig::new(7, NodeAddress::new("127.0.0.1", 5000));
        assert_eq!(cfg.log_path(), PathBuf::from("magnetite-log-7.db"));

        let mut cfg = cfg;
        cfg.raft_log_path = Some(PathBuf::from("/tmp/custom.db"));
        assert_eq!(cfg.log_path(), PathBuf::from("/tmp/custom.db"));
    }

    #[test]
    fn config_validation() {
        let mut cfg = NodeConfig::new(1, NodeAddress::new("127.0.0.1", 5000));
        assert!(cfg.validate().is_ok());

        cfg.node_id = 0;
        assert!(cfg.validate().is_err());

        cfg.node_id = 1;
        cfg.init = true;
        cfg.join = true;
        assert!(cfg.validate().is_err());
    }
}
