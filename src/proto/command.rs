//! Client command representation and classification.
//!
//! Commands are classified once, by name, into the classes the session state
//! machine dispatches on: locally answered, fan-out, multi-key, or general
//! single-key. The name table also records the read-only flag used for
//! replica routing.

use bytes::{Bytes, BytesMut};
use lazy_static::lazy_static;
use std::collections::HashMap;

use super::{RespError, RespValue};

lazy_static! {
    pub static ref CMD_READONLY: Command = Command::from_strs(&["READONLY"]);
    pub static ref CMD_ASKING: Command = Command::from_strs(&["ASKING"]);
    pub static ref CMD_CLUSTER_SLOTS: Command = Command::from_strs(&["CLUSTER", "SLOTS"]);
    pub static ref CMD_CLUSTER_NODES: Command = Command::from_strs(&["CLUSTER", "NODES"]);
}

/// A parsed client command: an argument vector plus the uppercased name
#[derive(Debug, Clone, Default)]
pub struct Command {
    args: Vec<Bytes>,
    name: String,
}

impl Command {
    /// Build a command from raw argument byte strings
    pub fn from_args(args: Vec<Bytes>) -> Result<Self, RespError> {
        if args.is_empty() {
            return Err(RespError::InvalidFormat("empty command".to_string()));
        }
        Ok(Self::from_parts(args))
    }

    /// Build a command from string literals (internal commands)
    pub fn from_strs(parts: &[&str]) -> Self {
        Self::from_parts(
            parts
                .iter()
                .map(|p| Bytes::copy_from_slice(p.as_bytes()))
                .collect(),
        )
    }

    /// Build a command from argument byte strings known to be non-empty
    pub(crate) fn from_parts(args: Vec<Bytes>) -> Self {
        let name = args
            .first()
            .map(|arg| String::from_utf8_lossy(arg).to_uppercase())
            .unwrap_or_default();
        Self { args, name }
    }

    /// Convert a parsed RESP value into a command. Clients send commands as
    /// arrays of bulk strings.
    pub fn from_resp(value: RespValue) -> Result<Self, RespError> {
        let elements = match value {
            RespValue::Array(Some(elements)) if !elements.is_empty() => elements,
            _ => {
                return Err(RespError::InvalidFormat(
                    "command must be a non-empty array".to_string(),
                ))
            }
        };
        let mut args = Vec::with_capacity(elements.len());
        for element in elements {
            match element {
                RespValue::BulkString(Some(data)) => args.push(data),
                _ => {
                    return Err(RespError::InvalidFormat(
                        "command arguments must be bulk strings".to_string(),
                    ))
                }
            }
        }
        Self::from_args(args)
    }

    /// Uppercased command name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg(&self, index: usize) -> Option<&Bytes> {
        self.args.get(index)
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// The key argument for single-key commands
    pub fn key(&self) -> Option<&Bytes> {
        self.args.get(1)
    }

    /// Encode to wire format (array of bulk strings)
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(format!("*{}\r\n", self.args.len()).as_bytes());
        for arg in &self.args {
            buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            buf.extend_from_slice(arg);
            buf.extend_from_slice(b"\r\n");
        }
        buf.freeze()
    }
}

/// How sub-replies of a scattered or fanned-out command recombine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalesceKind {
    /// One reply element per sub-command, in sub order (MGET)
    Gather,
    /// All simple-string OK, or the first error (MSET)
    AllOk,
    /// Integer sum of sub-replies (DEL, EXISTS, DBSIZE)
    Sum,
    /// Concatenation of sub-reply arrays (KEYS)
    Concat,
}

#[derive(Debug, Clone, Copy)]
enum CmdKind {
    General,
    MultiKey(CoalesceKind),
    ReadAll(CoalesceKind),
}

struct CmdEntry {
    kind: CmdKind,
    read_only: bool,
}

impl CmdEntry {
    const fn general(read_only: bool) -> Self {
        Self {
            kind: CmdKind::General,
            read_only,
        }
    }

    const fn multi_key(coalesce: CoalesceKind, read_only: bool) -> Self {
        Self {
            kind: CmdKind::MultiKey(coalesce),
            read_only,
        }
    }

    const fn read_all(coalesce: CoalesceKind) -> Self {
        Self {
            kind: CmdKind::ReadAll(coalesce),
            read_only: true,
        }
    }
}

lazy_static! {
    static ref CMD_TABLE: HashMap<&'static str, CmdEntry> = {
        let mut t = HashMap::new();
        // single-key reads
        for name in [
            "GET", "GETRANGE", "STRLEN", "TTL", "PTTL", "TYPE", "DUMP", "GETBIT", "BITCOUNT",
            "BITPOS", "LLEN", "LRANGE", "LINDEX", "SCARD", "SMEMBERS", "SISMEMBER",
            "SRANDMEMBER", "SSCAN", "HGET", "HMGET", "HGETALL", "HLEN", "HEXISTS", "HKEYS",
            "HVALS", "HSTRLEN", "HSCAN", "ZCARD", "ZCOUNT", "ZRANGE", "ZRANGEBYSCORE",
            "ZREVRANGE", "ZREVRANGEBYSCORE", "ZRANGEBYLEX", "ZLEXCOUNT", "ZRANK", "ZREVRANK",
            "ZSCORE", "ZSCAN", "PFCOUNT",
        ] {
            t.insert(name, CmdEntry::general(true));
        }
        // single-key writes
        for name in [
            "SET", "SETNX", "SETEX", "PSETEX", "SETRANGE", "APPEND", "GETSET", "GETDEL",
            "GETEX", "SETBIT", "INCR", "DECR", "INCRBY", "DECRBY", "INCRBYFLOAT", "EXPIRE",
            "PEXPIRE", "EXPIREAT", "PEXPIREAT", "PERSIST", "LPUSH", "RPUSH", "LPUSHX",
            "RPUSHX", "LPOP", "RPOP", "LSET", "LREM", "LINSERT", "LTRIM", "SADD", "SREM",
            "SPOP", "HSET", "HSETNX", "HMSET", "HDEL", "HINCRBY", "HINCRBYFLOAT", "ZADD",
            "ZREM", "ZINCRBY", "ZPOPMIN", "ZPOPMAX", "ZREMRANGEBYRANK", "ZREMRANGEBYSCORE",
            "ZREMRANGEBYLEX", "PFADD", "RESTORE", "SORT",
        ] {
            t.insert(name, CmdEntry::general(false));
        }
        // multi-key commands, split per key when more than one key is given
        t.insert("MGET", CmdEntry::multi_key(CoalesceKind::Gather, true));
        t.insert("MSET", CmdEntry::multi_key(CoalesceKind::AllOk, false));
        t.insert("DEL", CmdEntry::multi_key(CoalesceKind::Sum, false));
        t.insert("UNLINK", CmdEntry::multi_key(CoalesceKind::Sum, false));
        t.insert("EXISTS", CmdEntry::multi_key(CoalesceKind::Sum, true));
        t.insert("TOUCH", CmdEntry::multi_key(CoalesceKind::Sum, false));
        // fan-out to every shard
        t.insert("KEYS", CmdEntry::read_all(CoalesceKind::Concat));
        t.insert("DBSIZE", CmdEntry::read_all(CoalesceKind::Sum));
        t
    };
}

/// Dispatch class of a client command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    Auth,
    Select,
    Ping,
    Multi,
    Exec,
    Unknown,
    ReadAll(CoalesceKind),
    MultiKey {
        coalesce: CoalesceKind,
        num_keys: usize,
        read_only: bool,
    },
    General {
        read_only: bool,
    },
}

/// Classify a command by name (and, for multi-key commands, by arity)
pub fn classify(cmd: &Command) -> CommandClass {
    match cmd.name() {
        "AUTH" => CommandClass::Auth,
        "SELECT" => CommandClass::Select,
        "PING" => CommandClass::Ping,
        "MULTI" => CommandClass::Multi,
        "EXEC" => CommandClass::Exec,
        name => match CMD_TABLE.get(name) {
            None => CommandClass::Unknown,
            Some(entry) => match entry.kind {
                CmdKind::ReadAll(coalesce) => CommandClass::ReadAll(coalesce),
                CmdKind::MultiKey(coalesce) => {
                    let num_keys = num_keys(cmd);
                    if num_keys > 1 {
                        CommandClass::MultiKey {
                            coalesce,
                            num_keys,
                            read_only: entry.read_only,
                        }
                    } else {
                        CommandClass::General {
                            read_only: entry.read_only,
                        }
                    }
                }
                CmdKind::General => CommandClass::General {
                    read_only: entry.read_only,
                },
            },
        },
    }
}

/// True for every command that may not run before a successful AUTH
pub fn auth_required(cmd: &Command) -> bool {
    cmd.name() != "AUTH"
}

fn num_keys(cmd: &Command) -> usize {
    let tail = cmd.arg_count().saturating_sub(1);
    match cmd.name() {
        "MSET" => tail / 2,
        _ => tail,
    }
}
