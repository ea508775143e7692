//! Backend speaking to a server through a connection pool.

use super::{
    Backend, COMPARE_AND_DELETE_SCRIPT, COMPARE_AND_PEXPIRE_SCRIPT, Command, Condition, Expiry,
    INCR_EXISTING_SCRIPT, Reply,
};
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use redis::Value;
use std::future::Future;
use tracing::{debug, warn};
use valkey_cache_pool::{ConnectionPool, PooledValkeyConnection};

/// Backend checking out a pooled connection per call.
///
/// Every command is bounded by the pool's socket timeout. A connection that
/// timed out or failed at the I/O level is marked broken and discarded.
#[derive(Debug, Clone)]
pub struct PooledBackend {
    pool: ConnectionPool,
}

impl PooledBackend {
    /// Wrap a pool.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    async fn run<T, F>(&self, conn: &mut PooledValkeyConnection, what: &str, fut: F) -> CacheResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        let outcome = match self.pool.socket_timeout() {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    conn.mark_broken();
                    warn!(server = %self.pool.params(), command = what, "Command timed out");
                    return Err(CacheError::Timeout(format!(
                        "{} on {} exceeded {:?}",
                        what,
                        self.pool.params(),
                        limit
                    )));
                }
            },
            None => fut.await,
        };
        outcome.map_err(|e| {
            let err = CacheError::from(e);
            if err.is_connection_error() {
                conn.mark_broken();
            }
            err
        })
    }
}

/// Build the wire form of a command.
pub(crate) fn to_cmd(command: &Command) -> redis::Cmd {
    let mut cmd = redis::cmd(command.name());
    match command {
        Command::Ping | Command::FlushDb => {}
        Command::Get { key }
        | Command::Ttl { key }
        | Command::Pttl { key }
        | Command::Persist { key }
        | Command::SMembers { key }
        | Command::SCard { key }
        | Command::HLen { key }
        | Command::HKeys { key } => {
            cmd.arg(key);
        }
        Command::Set {
            key,
            value,
            expiry,
            condition,
        } => {
            cmd.arg(key).arg(value.as_slice());
            match expiry {
                Some(Expiry::Seconds(secs)) => {
                    cmd.arg("EX").arg(*secs);
                }
                Some(Expiry::Millis(millis)) => {
                    cmd.arg("PX").arg(*millis);
                }
                Some(Expiry::KeepTtl) => {
                    cmd.arg("KEEPTTL");
                }
                None => {}
            }
            match condition {
                Some(Condition::IfAbsent) => {
                    cmd.arg("NX");
                }
                Some(Condition::IfPresent) => {
                    cmd.arg("XX");
                }
                None => {}
            }
        }
        Command::Del { keys } | Command::Exists { keys } | Command::MGet { keys } => {
            cmd.arg(keys.as_slice());
        }
        Command::Expire { key, seconds } => {
            cmd.arg(key).arg(*seconds);
        }
        Command::PExpire { key, millis } => {
            cmd.arg(key).arg(*millis);
        }
        Command::ExpireAt { key, timestamp } => {
            cmd.arg(key).arg(*timestamp);
        }
        Command::PExpireAt { key, timestamp_ms } => {
            cmd.arg(key).arg(*timestamp_ms);
        }
        Command::IncrBy { key, delta } | Command::DecrBy { key, delta } => {
            cmd.arg(key).arg(*delta);
        }
        Command::IncrByExisting { key, delta } => {
            cmd.arg(INCR_EXISTING_SCRIPT).arg(1).arg(key).arg(*delta);
        }
        Command::MSet { items } | Command::MSetNx { items } => {
            for (key, value) in items {
                cmd.arg(key).arg(value.as_slice());
            }
        }
        Command::Scan {
            cursor,
            pattern,
            count,
        } => {
            cmd.arg(*cursor);
            if let Some(pattern) = pattern {
                cmd.arg("MATCH").arg(pattern);
            }
            if let Some(count) = count {
                cmd.arg("COUNT").arg(*count);
            }
        }
        Command::Keys { pattern } => {
            cmd.arg(pattern);
        }
        Command::CompareAndDelete { key, token } => {
            cmd.arg(COMPARE_AND_DELETE_SCRIPT)
                .arg(1)
                .arg(key)
                .arg(token.as_slice());
        }
        Command::CompareAndPExpire { key, token, millis } => {
            cmd.arg(COMPARE_AND_PEXPIRE_SCRIPT)
                .arg(1)
                .arg(key)
                .arg(token.as_slice())
                .arg(*millis);
        }
        Command::SAdd { key, members } | Command::SRem { key, members } => {
            cmd.arg(key);
            for member in members {
                cmd.arg(member.as_slice());
            }
        }
        Command::SIsMember { key, member } => {
            cmd.arg(key).arg(member.as_slice());
        }
        Command::HSet { key, fields } => {
            cmd.arg(key);
            for (field, value) in fields {
                cmd.arg(field).arg(value.as_slice());
            }
        }
        Command::HGet { key, field } | Command::HExists { key, field } => {
            cmd.arg(key).arg(field);
        }
        Command::HDel { key, fields } => {
            cmd.arg(key).arg(fields.as_slice());
        }
    }
    cmd
}

/// Convert a protocol value into a [`Reply`].
pub(crate) fn to_reply(value: Value) -> CacheResult<Reply> {
    Ok(match value {
        Value::Nil => Reply::Nil,
        Value::Int(n) => Reply::Int(n),
        Value::BulkString(bytes) => Reply::Bulk(bytes),
        Value::SimpleString(s) => Reply::Status(s),
        Value::Okay => Reply::Status("OK".to_string()),
        Value::Boolean(b) => Reply::Int(b as i64),
        Value::Double(d) => Reply::Bulk(d.to_string().into_bytes()),
        Value::Array(items) | Value::Set(items) => {
            Reply::Array(items.into_iter().map(to_reply).collect::<CacheResult<_>>()?)
        }
        Value::Map(pairs) => {
            let mut flat = Vec::with_capacity(pairs.len() * 2);
            for (k, v) in pairs {
                flat.push(to_reply(k)?);
                flat.push(to_reply(v)?);
            }
            Reply::Array(flat)
        }
        other => {
            return Err(CacheError::Command(format!("unsupported reply {:?}", other)));
        }
    })
}

#[async_trait]
impl Backend for PooledBackend {
    async fn execute(&self, command: Command) -> CacheResult<Reply> {
        let cmd = to_cmd(&command);
        let mut conn = self.pool.get().await?;
        let mut mux = (**conn).clone();
        let fut = cmd.query_async::<Value>(&mut mux);
        let value = self.run(&mut conn, command.name(), fut).await?;
        to_reply(value)
    }

    async fn pipeline(&self, commands: Vec<Command>, atomic: bool) -> CacheResult<Vec<Reply>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        if atomic {
            pipe.atomic();
        }
        for command in &commands {
            pipe.add_command(to_cmd(command));
        }
        debug!(server = %self.pool.params(), commands = commands.len(), atomic, "Sending pipeline");

        let mut conn = self.pool.get().await?;
        let mut mux = (**conn).clone();
        let fut = pipe.query_async::<Vec<Value>>(&mut mux);
        let values = self.run(&mut conn, "pipeline", fut).await?;
        values.into_iter().map(to_reply).collect()
    }

    fn describe(&self) -> String {
        self.pool.params().to_string()
    }

    fn disconnect(&self) {
        self.pool.disconnect();
    }
}
