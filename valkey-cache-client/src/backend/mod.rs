//! Command execution against one server.
//!
//! Clients speak to servers through [`Backend`], which executes typed
//! [`Command`]s and returns [`Reply`] values. [`PooledBackend`] sends them
//! over a pooled connection; [`MemoryBackend`] applies them to an in-process
//! store with the same reply shapes.

mod glob;
mod memory;
mod pooled;

pub use glob::glob_match;
pub use memory::MemoryBackend;
pub use pooled::PooledBackend;

use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use std::time::Duration;

/// Releases a lock only while it still holds the caller's token.
pub const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Resets a lock TTL only while it still holds the caller's token.
pub const COMPARE_AND_PEXPIRE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Increments only keys that already exist; replies nil otherwise.
pub const INCR_EXISTING_SCRIPT: &str = r#"
if redis.call("exists", KEYS[1]) == 1 then
    return redis.call("incrby", KEYS[1], ARGV[1])
else
    return false
end
"#;

/// Expiry attached to a `SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// `EX`
    Seconds(u64),
    /// `PX`
    Millis(u64),
    /// `KEEPTTL`
    KeepTtl,
}

/// Write condition attached to a `SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// `NX`: only when the key is absent.
    IfAbsent,
    /// `XX`: only when the key exists.
    IfPresent,
}

/// Whole milliseconds of `ttl`, at least one, for `PX`/`PEXPIRE`.
pub fn millis_at_least_one(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// A single server command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    Get { key: String },
    Set {
        key: String,
        value: Vec<u8>,
        expiry: Option<Expiry>,
        condition: Option<Condition>,
    },
    Del { keys: Vec<String> },
    Exists { keys: Vec<String> },
    Ttl { key: String },
    Pttl { key: String },
    Expire { key: String, seconds: i64 },
    PExpire { key: String, millis: i64 },
    ExpireAt { key: String, timestamp: i64 },
    PExpireAt { key: String, timestamp_ms: i64 },
    Persist { key: String },
    IncrBy { key: String, delta: i64 },
    DecrBy { key: String, delta: i64 },
    IncrByExisting { key: String, delta: i64 },
    MGet { keys: Vec<String> },
    MSet { items: Vec<(String, Vec<u8>)> },
    MSetNx { items: Vec<(String, Vec<u8>)> },
    Scan {
        cursor: u64,
        pattern: Option<String>,
        count: Option<usize>,
    },
    Keys { pattern: String },
    FlushDb,
    CompareAndDelete { key: String, token: Vec<u8> },
    CompareAndPExpire {
        key: String,
        token: Vec<u8>,
        millis: i64,
    },
    SAdd { key: String, members: Vec<Vec<u8>> },
    SRem { key: String, members: Vec<Vec<u8>> },
    SMembers { key: String },
    SIsMember { key: String, member: Vec<u8> },
    SCard { key: String },
    HSet {
        key: String,
        fields: Vec<(String, Vec<u8>)>,
    },
    HGet { key: String, field: String },
    HDel { key: String, fields: Vec<String> },
    HLen { key: String },
    HExists { key: String, field: String },
    HKeys { key: String },
}

impl Command {
    /// Command name as sent on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Get { .. } => "GET",
            Self::Set { .. } => "SET",
            Self::Del { .. } => "DEL",
            Self::Exists { .. } => "EXISTS",
            Self::Ttl { .. } => "TTL",
            Self::Pttl { .. } => "PTTL",
            Self::Expire { .. } => "EXPIRE",
            Self::PExpire { .. } => "PEXPIRE",
            Self::ExpireAt { .. } => "EXPIREAT",
            Self::PExpireAt { .. } => "PEXPIREAT",
            Self::Persist { .. } => "PERSIST",
            Self::IncrBy { .. } => "INCRBY",
            Self::DecrBy { .. } => "DECRBY",
            Self::MGet { .. } => "MGET",
            Self::MSet { .. } => "MSET",
            Self::MSetNx { .. } => "MSETNX",
            Self::Scan { .. } => "SCAN",
            Self::Keys { .. } => "KEYS",
            Self::FlushDb => "FLUSHDB",
            Self::CompareAndDelete { .. }
            | Self::CompareAndPExpire { .. }
            | Self::IncrByExisting { .. } => "EVAL",
            Self::SAdd { .. } => "SADD",
            Self::SRem { .. } => "SREM",
            Self::SMembers { .. } => "SMEMBERS",
            Self::SIsMember { .. } => "SISMEMBER",
            Self::SCard { .. } => "SCARD",
            Self::HSet { .. } => "HSET",
            Self::HGet { .. } => "HGET",
            Self::HDel { .. } => "HDEL",
            Self::HLen { .. } => "HLEN",
            Self::HExists { .. } => "HEXISTS",
            Self::HKeys { .. } => "HKEYS",
        }
    }
}

/// A server reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Status(String),
    Int(i64),
    Bulk(Vec<u8>),
    Array(Vec<Reply>),
}

impl Reply {
    fn unexpected(&self, wanted: &str) -> CacheError {
        CacheError::Command(format!("expected {} reply, got {:?}", wanted, self))
    }

    /// Bulk payload; `Nil` is `None`.
    pub fn into_bytes(self) -> CacheResult<Option<Vec<u8>>> {
        match self {
            Self::Nil => Ok(None),
            Self::Bulk(bytes) => Ok(Some(bytes)),
            Self::Status(s) => Ok(Some(s.into_bytes())),
            other => Err(other.unexpected("bulk")),
        }
    }

    /// Integer reply, also accepting a decimal bulk.
    pub fn into_int(self) -> CacheResult<i64> {
        match self {
            Self::Int(n) => Ok(n),
            Self::Bulk(ref bytes) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| self.unexpected("integer")),
            other => Err(other.unexpected("integer")),
        }
    }

    /// `OK` and non-zero integers are true; `Nil` and zero are false.
    pub fn into_bool(self) -> CacheResult<bool> {
        match self {
            Self::Nil => Ok(false),
            Self::Status(_) => Ok(true),
            Self::Int(n) => Ok(n != 0),
            other => Err(other.unexpected("boolean")),
        }
    }

    /// Array elements; `Nil` is empty.
    pub fn into_array(self) -> CacheResult<Vec<Reply>> {
        match self {
            Self::Nil => Ok(Vec::new()),
            Self::Array(items) => Ok(items),
            other => Err(other.unexpected("array")),
        }
    }

    /// Array of optional bulks, as returned by `MGET`.
    pub fn into_optional_bytes(self) -> CacheResult<Vec<Option<Vec<u8>>>> {
        self.into_array()?.into_iter().map(Reply::into_bytes).collect()
    }

    /// Array of bulks with `Nil` entries rejected.
    pub fn into_byte_list(self) -> CacheResult<Vec<Vec<u8>>> {
        self.into_array()?
            .into_iter()
            .map(|item| item.into_bytes()?.ok_or_else(|| CacheError::Command("nil in array reply".into())))
            .collect()
    }

    /// Array of UTF-8 strings.
    pub fn into_strings(self) -> CacheResult<Vec<String>> {
        self.into_byte_list()?
            .into_iter()
            .map(|bytes| {
                String::from_utf8(bytes).map_err(|e| CacheError::Command(format!("non UTF-8 key: {}", e)))
            })
            .collect()
    }

    /// `SCAN` reply: next cursor and the keys in this page.
    pub fn into_scan(self) -> CacheResult<(u64, Vec<String>)> {
        let mut parts = self.into_array()?.into_iter();
        match (parts.next(), parts.next()) {
            (Some(cursor), Some(keys)) => {
                let cursor = cursor.into_int()?;
                Ok((cursor as u64, keys.into_strings()?))
            }
            _ => Err(CacheError::Command("malformed SCAN reply".into())),
        }
    }
}

/// Executes commands against one server.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Run a single command.
    async fn execute(&self, command: Command) -> CacheResult<Reply>;

    /// Run commands in one round trip. An atomic pipeline is wrapped in
    /// `MULTI`/`EXEC` and applies all commands or none; otherwise a failure
    /// may leave earlier commands applied.
    async fn pipeline(&self, commands: Vec<Command>, atomic: bool) -> CacheResult<Vec<Reply>>;

    /// Human readable server description for logs.
    fn describe(&self) -> String;

    /// Release pooled connections. Later commands reconnect.
    fn disconnect(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_reply() {
        let reply = Reply::Array(vec![
            Reply::Bulk(b"17".to_vec()),
            Reply::Array(vec![Reply::Bulk(b"a".to_vec()), Reply::Bulk(b"b".to_vec())]),
        ]);
        let (cursor, keys) = reply.into_scan().unwrap();
        assert_eq!(cursor, 17);
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_bool_replies() {
        assert!(Reply::Status("OK".into()).into_bool().unwrap());
        assert!(!Reply::Nil.into_bool().unwrap());
        assert!(!Reply::Int(0).into_bool().unwrap());
        assert!(Reply::Bulk(vec![]).into_bool().is_err());
    }

    #[test]
    fn test_millis_clamp() {
        assert_eq!(millis_at_least_one(Duration::from_micros(10)), 1);
        assert_eq!(millis_at_least_one(Duration::from_secs(2)), 2000);
    }

    #[test]
    fn test_mget_reply_keeps_gaps() {
        let reply = Reply::Array(vec![Reply::Bulk(b"1".to_vec()), Reply::Nil]);
        assert_eq!(reply.into_optional_bytes().unwrap(), vec![Some(b"1".to_vec()), None]);
    }
}
