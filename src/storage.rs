//! In-memory key-value store
//!
//! The execution engine the replication layer drives: a committed command
//! arrives as an argv vector and is executed here, producing the reply
//! frame that is eventually sent to the originating client. The keyspace
//! is guarded by a single `RwLock`; the apply path takes it for the
//! duration of one command, which is what keeps replicas byte-identical
//! for the same command sequence.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::MagnetiteError;
use crate::protocol::Frame;

/// Shared in-memory keyspace.
#[derive(Debug, Default)]
pub struct Store {
    data: RwLock<HashMap<Bytes, Bytes>>,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Execute a parsed command against the store.
    ///
    /// Every mutation and read goes through here, on whichever thread
    /// holds the committed command. Unknown commands and argument errors
    /// come back as RESP error frames rather than `Err`; the command was
    /// executed as far as the replication layer is concerned.
    pub fn execute(&self, argv: &[Bytes]) -> Frame {
        let Some(name) = argv.first() else {
            return Frame::error("ERR empty command");
        };
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();

        match name.as_str() {
            "SET" => self.cmd_set(argv),
            "GET" => self.cmd_get(argv),
            "DEL" => self.cmd_del(argv),
            "EXISTS" => self.cmd_exists(argv),
            "INCR" => self.cmd_incr_by(argv, 1, 2),
            "DECR" => self.cmd_incr_by(argv, -1, 2),
            "INCRBY" => self.cmd_incrby(argv),
            "APPEND" => self.cmd_append(argv),
            "STRLEN" => self.cmd_strlen(argv),
            "MSET" => self.cmd_mset(argv),
            "MGET" => self.cmd_mget(argv),
            "DBSIZE" => self.cmd_dbsize(argv),
            "FLUSHALL" => self.cmd_flushall(argv),
            _ => Frame::error(
                MagnetiteError::UnknownCommand(name.to_string()).to_resp_error(),
            ),
        }
    }

    // -- command implementations -------------------------------------------

    fn cmd_set(&self, argv: &[Bytes]) -> Frame {
        if argv.len() != 3 {
            return wrong_arity("set");
        }
        self.data
            .write()
            .insert(argv[1].clone(), argv[2].clone());
        Frame::simple("OK")
    }

    fn cmd_get(&self, argv: &[Bytes]) -> Frame {
        if argv.len() != 2 {
            return wrong_arity("get");
        }
        match self.data.read().get(&argv[1]) {
            Some(v) => Frame::bulk(v.clone()),
            None => Frame::null(),
        }
    }

    fn cmd_del(&self, argv: &[Bytes]) -> Frame {
        if argv.len() < 2 {
            return wrong_arity("del");
        }
        let mut data = self.data.write();
        let removed = argv[1..]
            .iter()
            .filter(|k| data.remove(*k).is_some())
            .count();
        Frame::integer(removed as i64)
    }

    fn cmd_exists(&self, argv: &[Bytes]) -> Frame {
        if argv.len() < 2 {
            return wrong_arity("exists");
        }
        let data = self.data.read();
        let found = argv[1..].iter().filter(|k| data.contains_key(*k)).count();
        Frame::integer(found as i64)
    }

    fn cmd_incrby(&self, argv: &[Bytes]) -> Frame {
        if argv.len() != 3 {
            return wrong_arity("incrby");
        }
        let Some(delta) = parse_i64(&argv[2]) else {
            return Frame::error(MagnetiteError::NotInteger.to_resp_error());
        };
        self.incr_key(&argv[1], delta)
    }

    fn cmd_incr_by(&self, argv: &[Bytes], delta: i64, arity: usize) -> Frame {
        if argv.len() != arity {
            return wrong_arity(if delta > 0 { "incr" } else { "decr" });
        }
        self.incr_key(&argv[1], delta)
    }

    fn incr_key(&self, key: &Bytes, delta: i64) -> Frame {
        let mut data = self.data.write();
        let current = match data.get(key) {
            Some(v) => match parse_i64(v) {
                Some(n) => n,
                None => return Frame::error(MagnetiteError::NotInteger.to_resp_error()),
            },
            None => 0,
        };
        let Some(next) = current.checked_add(delta) else {
            return Frame::error(MagnetiteError::NotInteger.to_resp_error());
        };
        data.insert(key.clone(), Bytes::from(next.to_string()));
        Frame::integer(next)
    }

    fn cmd_append(&self, argv: &[Bytes]) -> Frame {
        if argv.len() != 3 {
            return wrong_arity("append");
        }
        let mut data = self.data.write();
        let mut value = data.get(&argv[1]).map(|v| v.to_vec()).unwrap_or_default();
        value.extend_from_slice(&argv[2]);
        let len = value.len();
        data.insert(argv[1].clone(), Bytes::from(value));
        Frame::integer(len as i64)
    }

    fn cmd_strlen(&self, argv: &[Bytes]) -> Frame {
        if argv.len() != 2 {
            return wrong_arity("strlen");
        }
        let len = self.data.read().get(&argv[1]).map(|v| v.len()).unwrap_or(0);
        Frame::integer(len as i64)
    }

    fn cmd_mset(&self, argv: &[Bytes]) -> Frame {
        if argv.len() < 3 || argv.len() % 2 != 1 {
            return wrong_arity("mset");
        }
        let mut data = self.data.write();
        for pair in argv[1..].chunks_exact(2) {
            data.insert(pair[0].clone(), pair[1].clone());
        }
        Frame::simple("OK")
    }

    fn cmd_mget(&self, argv: &[Bytes]) -> Frame {
        if argv.len() < 2 {
            return wrong_arity("mget");
        }
        let data = self.data.read();
        let values = argv[1..]
            .iter()
            .map(|k| match data.get(k) {
                Some(v) => Frame::bulk(v.clone()),
                None => Frame::null(),
            })
            .collect();
        Frame::array(values)
    }

    fn cmd_dbsize(&self, argv: &[Bytes]) -> Frame {
        if argv.len() != 1 {
            return wrong_arity("dbsize");
        }
        Frame::integer(self.len() as i64)
    }

    fn cmd_flushall(&self, argv: &[Bytes]) -> Frame {
        if argv.len() != 1 {
            return wrong_arity("flushall");
        }
        self.data.write().clear();
        Frame::simple("OK")
    }
}

fn wrong_arity(cmd: &str) -> Frame {
    Frame::error(MagnetiteError::WrongArity(cmd.to_string()).to_resp_error())
}

fn parse_i64(b: &[u8]) -> Option<i64> {
    std::str::from_utf8(b).ok()?.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&[u8]]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p)).collect()
    }

    // -- basic commands ----------------------------------------------------

    #[test]
    fn set_get_del() {
        let store = Store::new();
        assert_eq!(
            store.execute(&argv(&[b"SET", b"k", b"v"])),
            Frame::simple("OK")
        );
        assert_eq!(store.execute(&argv(&[b"GET", b"k"])), Frame::bulk("v"));
        assert_eq!(store.execute(&argv(&[b"DEL", b"k"])), Frame::integer(1));
        assert_eq!(store.execute(&argv(&[b"GET", b"k"])), Frame::null());
        assert_eq!(store.execute(&argv(&[b"DEL", b"k"])), Frame::integer(0));
    }

    #[test]
    fn set_is_binary_safe() {
        let store = Store::new();
        store.execute(&argv(&[b"SET", b"bin", b"a\x00\x01b"]));
        assert_eq!(
            store.execute(&argv(&[b"GET", b"bin"])),
            Frame::bulk(Bytes::from_static(b"a\x00\x01b"))
        );
    }

    #[test]
    fn exists_counts_keys() {
        let store = Store::new();
        store.execute(&argv(&[b"SET", b"a", b"1"]));
        store.execute(&argv(&[b"SET", b"b", b"2"]));
        assert_eq!(
            store.execute(&argv(&[b"EXISTS", b"a", b"b", b"missing"])),
            Frame::integer(2)
        );
    }

    // -- counters ----------------------------------------------------------

    #[test]
    fn incr_decr() {
        let store = Store::new();
        assert_eq!(store.execute(&argv(&[b"INCR", b"n"])), Frame::integer(1));
        assert_eq!(store.execute(&argv(&[b"INCR", b"n"])), Frame::integer(2));
        assert_eq!(store.execute(&argv(&[b"DECR", b"n"])), Frame::integer(1));
        assert_eq!(
            store.execute(&argv(&[b"INCRBY", b"n", b"10"])),
            Frame::integer(11)
        );
    }

    #[test]
    fn incr_non_numeric_errors() {
        let store = Store::new();
        store.execute(&argv(&[b"SET", b"s", b"abc"]));
        assert!(store.execute(&argv(&[b"INCR", b"s"])).is_error());
    }

    // -- strings -----------------------------------------------------------

    #[test]
    fn append_and_strlen() {
        let store = Store::new();
        assert_eq!(
            store.execute(&argv(&[b"APPEND", b"s", b"foo"])),
            Frame::integer(3)
        );
        assert_eq!(
            store.execute(&argv(&[b"APPEND", b"s", b"bar"])),
            Frame::integer(6)
        );
        assert_eq!(
            store.execute(&argv(&[b"STRLEN", b"s"])),
            Frame::integer(6)
        );
        assert_eq!(store.execute(&argv(&[b"GET", b"s"])), Frame::bulk("foobar"));
    }

    // -- multi-key ---------------------------------------------------------

    #[test]
    fn mset_mget() {
        let store = Store::new();
        assert_eq!(
            store.execute(&argv(&[b"MSET", b"a", b"1", b"b", b"2"])),
            Frame::simple("OK")
        );
        assert_eq!(
            store.execute(&argv(&[b"MGET", b"a", b"missing", b"b"])),
            Frame::array(vec![Frame::bulk("1"), Frame::null(), Frame::bulk("2")])
        );
    }

    #[test]
    fn mset_odd_args_errors() {
        let store = Store::new();
        assert!(store.execute(&argv(&[b"MSET", b"a", b"1", b"b"])).is_error());
    }

    // -- admin -------------------------------------------------------------

    #[test]
    fn dbsize_and_flushall() {
        let store = Store::new();
        store.execute(&argv(&[b"SET", b"a", b"1"]));
        store.execute(&argv(&[b"SET", b"b", b"2"]));
        assert_eq!(store.execute(&argv(&[b"DBSIZE"])), Frame::integer(2));
        assert_eq!(store.execute(&argv(&[b"FLUSHALL"])), Frame::simple("OK"));
        assert_eq!(store.execute(&argv(&[b"DBSIZE"])), Frame::integer(0));
    }

    #[test]
    fn unknown_command_errors() {
        let store = Store::new();
        let reply = store.execute(&argv(&[b"FROBNICATE", b"x"]));
        assert!(reply.is_error());
    }

    #[test]
    fn command_names_are_case_insensitive() {
        let store = Store::new();
        assert_eq!(
            store.execute(&argv(&[b"set", b"k", b"v"])),
            Frame::simple("OK")
        );
        assert_eq!(store.execute(&argv(&[b"gEt", b"k"])), Frame::bulk("v"));
    }
}
