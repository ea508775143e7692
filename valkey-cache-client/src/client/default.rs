//! Verb implementations shared by every client variant.

use super::herd::{HerdPolicy, HerdRead};
use super::topology::{Access, Replicated, Topology};
use super::{CacheClient, ClientKind};
use crate::backend::{Backend, Command, Condition, Expiry, Reply, millis_at_least_one};
use crate::error::{CacheError, CacheResult};
use crate::key::CacheKey;
use crate::lock::{Lock, LockOptions};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Client with a primary and optional read replicas.
pub type DefaultClient = Client<Replicated>;

/// A cache client routing over topology `T`.
pub struct Client<T: Topology> {
    kind: ClientKind,
    topology: T,
    herd: Option<HerdPolicy>,
}

impl<T: Topology> Client<T> {
    /// Create a client of `kind` over `topology`.
    pub fn new(kind: ClientKind, topology: T) -> Self {
        Self {
            kind,
            topology,
            herd: None,
        }
    }

    /// Protect values written with a TTL from thundering herds.
    pub fn with_herd(mut self, policy: HerdPolicy) -> Self {
        self.herd = Some(policy);
        self
    }

    /// Server layout.
    pub fn topology(&self) -> &T {
        &self.topology
    }

    /// Herd policy, when enabled.
    pub fn herd(&self) -> Option<&HerdPolicy> {
        self.herd.as_ref()
    }

    fn read(&self, key: &CacheKey) -> Arc<dyn Backend> {
        self.topology.route(key, Access::Read)
    }

    fn write(&self, key: &CacheKey) -> Arc<dyn Backend> {
        self.topology.route(key, Access::Write)
    }

    fn unsupported(&self, operation: &str) -> CacheError {
        CacheError::Unsupported(format!(
            "{} is not available on the {} client",
            operation, self.kind
        ))
    }

    fn reject_herd(&self, operation: &str) -> CacheResult<()> {
        match self.herd {
            Some(_) => Err(self.unsupported(operation)),
            None => Ok(()),
        }
    }

    fn reject_sharded(&self, operation: &str) -> CacheResult<()> {
        if T::SHARDED {
            return Err(self.unsupported(operation));
        }
        Ok(())
    }

    /// Positions of `keys` grouped by the shard that owns them.
    fn group(&self, keys: &[CacheKey]) -> BTreeMap<usize, Vec<usize>> {
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (position, key) in keys.iter().enumerate() {
            groups.entry(self.topology.shard_for(key)).or_default().push(position);
        }
        groups
    }

    fn unpack(&self, stored: Option<Vec<u8>>) -> Option<Vec<u8>> {
        match (stored, &self.herd) {
            (Some(bytes), Some(herd)) => match herd.unpack(bytes) {
                HerdRead::Fresh(value) => Some(value),
                HerdRead::Refresh => None,
            },
            (stored, _) => stored,
        }
    }

    /// The write a `set` turns into. Zero TTLs become a delete.
    fn write_command(
        &self,
        key: &CacheKey,
        value: Vec<u8>,
        ttl: Option<Duration>,
        condition: Option<Condition>,
    ) -> Command {
        if ttl.is_some_and(|t| t.is_zero()) {
            return Command::Del {
                keys: vec![key.as_str().to_string()],
            };
        }
        let (value, ttl) = match &self.herd {
            Some(herd) => herd.pack(value, ttl),
            None => (value, ttl),
        };
        Command::Set {
            key: key.as_str().to_string(),
            value,
            expiry: ttl.map(|t| Expiry::Millis(millis_at_least_one(t))),
            condition,
        }
    }

    async fn ttl_reply(&self, command: Command, key: &CacheKey) -> CacheResult<Option<u64>> {
        match self.read(key).execute(command).await?.into_int()? {
            -2 => Ok(Some(0)),
            -1 => Ok(None),
            remaining => Ok(Some(remaining.max(0) as u64)),
        }
    }

    async fn count(&self, key: &CacheKey, command: Command, access: Access) -> CacheResult<u64> {
        let n = self.topology.route(key, access).execute(command).await?.into_int()?;
        Ok(n.max(0) as u64)
    }
}

fn unix_secs(when: SystemTime) -> i64 {
    when.duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

fn unix_millis(when: SystemTime) -> i64 {
    when.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn scan_backend(
    backend: Arc<dyn Backend>,
    pattern: String,
    itersize: usize,
) -> BoxStream<'static, CacheResult<String>> {
    stream::try_unfold(Some(0u64), move |cursor| {
        let backend = backend.clone();
        let pattern = pattern.clone();
        async move {
            let Some(cursor) = cursor else {
                return Ok(None);
            };
            let (next, keys) = backend
                .execute(Command::Scan {
                    cursor,
                    pattern: Some(pattern),
                    count: Some(itersize),
                })
                .await?
                .into_scan()?;
            let next = (next != 0).then_some(next);
            Ok::<_, CacheError>(Some((keys, next)))
        }
    })
    .map_ok(|keys| stream::iter(keys.into_iter().map(Ok::<String, CacheError>)))
    .try_flatten()
    .boxed()
}

#[async_trait]
impl<T: Topology> CacheClient for Client<T> {
    fn kind(&self) -> ClientKind {
        self.kind
    }

    async fn get(&self, key: &CacheKey) -> CacheResult<Option<Vec<u8>>> {
        let stored = self
            .read(key)
            .execute(Command::Get {
                key: key.as_str().to_string(),
            })
            .await?
            .into_bytes()?;
        Ok(self.unpack(stored))
    }

    async fn set(
        &self,
        key: &CacheKey,
        value: Vec<u8>,
        ttl: Option<Duration>,
        condition: Option<Condition>,
    ) -> CacheResult<bool> {
        if ttl.is_some_and(|t| t.is_zero()) && condition == Some(Condition::IfAbsent) {
            return Ok(!self.has_key(key).await?);
        }
        let reply = self
            .write(key)
            .execute(self.write_command(key, value, ttl, condition))
            .await?;
        reply.into_bool()
    }

    async fn delete(&self, key: &CacheKey) -> CacheResult<bool> {
        let command = Command::Del {
            keys: vec![key.as_str().to_string()],
        };
        Ok(self.count(key, command, Access::Write).await? > 0)
    }

    async fn delete_many(&self, keys: &[CacheKey]) -> CacheResult<u64> {
        let mut deleted = 0;
        for (shard, positions) in self.group(keys) {
            let command = Command::Del {
                keys: positions.iter().map(|&i| keys[i].as_str().to_string()).collect(),
            };
            let n = self
                .topology
                .backend(shard, Access::Write)
                .execute(command)
                .await?
                .into_int()?;
            deleted += n.max(0) as u64;
        }
        Ok(deleted)
    }

    async fn has_key(&self, key: &CacheKey) -> CacheResult<bool> {
        self.read(key)
            .execute(Command::Exists {
                keys: vec![key.as_str().to_string()],
            })
            .await?
            .into_bool()
    }

    async fn ttl(&self, key: &CacheKey) -> CacheResult<Option<u64>> {
        let command = Command::Ttl {
            key: key.as_str().to_string(),
        };
        self.ttl_reply(command, key).await
    }

    async fn pttl(&self, key: &CacheKey) -> CacheResult<Option<u64>> {
        let command = Command::Pttl {
            key: key.as_str().to_string(),
        };
        self.ttl_reply(command, key).await
    }

    async fn expire(&self, key: &CacheKey, ttl: Duration) -> CacheResult<bool> {
        let command = Command::Expire {
            key: key.as_str().to_string(),
            seconds: ttl.as_secs() as i64,
        };
        self.write(key).execute(command).await?.into_bool()
    }

    async fn pexpire(&self, key: &CacheKey, ttl: Duration) -> CacheResult<bool> {
        let command = Command::PExpire {
            key: key.as_str().to_string(),
            millis: ttl.as_millis() as i64,
        };
        self.write(key).execute(command).await?.into_bool()
    }

    async fn expire_at(&self, key: &CacheKey, when: SystemTime) -> CacheResult<bool> {
        let command = Command::ExpireAt {
            key: key.as_str().to_string(),
            timestamp: unix_secs(when),
        };
        self.write(key).execute(command).await?.into_bool()
    }

    async fn pexpire_at(&self, key: &CacheKey, when: SystemTime) -> CacheResult<bool> {
        let command = Command::PExpireAt {
            key: key.as_str().to_string(),
            timestamp_ms: unix_millis(when),
        };
        self.write(key).execute(command).await?.into_bool()
    }

    async fn persist(&self, key: &CacheKey) -> CacheResult<bool> {
        let command = Command::Persist {
            key: key.as_str().to_string(),
        };
        self.write(key).execute(command).await?.into_bool()
    }

    async fn move_value(&self, from: &CacheKey, to: &CacheKey) -> CacheResult<bool> {
        let source = self.write(from);
        let stored = source
            .execute(Command::Get {
                key: from.as_str().to_string(),
            })
            .await?
            .into_bytes()?;
        let Some(stored) = stored else {
            return Ok(false);
        };
        let expiry = match source
            .execute(Command::Pttl {
                key: from.as_str().to_string(),
            })
            .await?
            .into_int()?
        {
            -2 => return Ok(false),
            -1 => None,
            remaining => Some(Expiry::Millis((remaining as u64).max(1))),
        };
        self.write(to)
            .execute(Command::Set {
                key: to.as_str().to_string(),
                value: stored,
                expiry,
                condition: None,
            })
            .await?;
        source
            .execute(Command::Del {
                keys: vec![from.as_str().to_string()],
            })
            .await?;
        Ok(true)
    }

    async fn touch(&self, key: &CacheKey, ttl: Option<Duration>) -> CacheResult<bool> {
        let backend = self.write(key);
        if let Some(herd) = &self.herd {
            let stored = backend
                .execute(Command::Get {
                    key: key.as_str().to_string(),
                })
                .await?
                .into_bytes()?;
            let Some(stored) = stored else {
                return Ok(false);
            };
            let value = herd.strip(stored);
            backend.execute(self.write_command(key, value, ttl, None)).await?;
            return Ok(true);
        }
        match ttl {
            None => {
                if self.persist(key).await? {
                    return Ok(true);
                }
                self.has_key(key).await
            }
            Some(ttl) => {
                let command = Command::PExpire {
                    key: key.as_str().to_string(),
                    millis: ttl.as_millis() as i64,
                };
                backend.execute(command).await?.into_bool()
            }
        }
    }

    async fn incr(&self, key: &CacheKey, delta: i64, ignore_key_check: bool) -> CacheResult<i64> {
        self.reject_herd("incr")?;
        let key_name = key.as_str().to_string();
        let command = if ignore_key_check {
            Command::IncrBy { key: key_name, delta }
        } else {
            Command::IncrByExisting { key: key_name, delta }
        };
        match self.write(key).execute(command).await? {
            Reply::Nil => Err(CacheError::KeyNotFound(key.raw().to_string())),
            reply => reply.into_int(),
        }
    }

    async fn decr(&self, key: &CacheKey, delta: i64, ignore_key_check: bool) -> CacheResult<i64> {
        self.reject_herd("decr")?;
        if ignore_key_check {
            let command = Command::DecrBy {
                key: key.as_str().to_string(),
                delta,
            };
            return self.write(key).execute(command).await?.into_int();
        }
        let delta = delta
            .checked_neg()
            .ok_or_else(|| CacheError::Command("decrement is out of range".into()))?;
        self.incr(key, delta, false).await
    }

    async fn get_many(&self, keys: &[CacheKey]) -> CacheResult<Vec<Option<Vec<u8>>>> {
        let mut values = vec![None; keys.len()];
        for (shard, positions) in self.group(keys) {
            let commands = positions
                .iter()
                .map(|&i| Command::Get {
                    key: keys[i].as_str().to_string(),
                })
                .collect();
            let replies = self
                .topology
                .backend(shard, Access::Read)
                .pipeline(commands, false)
                .await?;
            for (position, reply) in positions.into_iter().zip(replies) {
                values[position] = self.unpack(reply.into_bytes()?);
            }
        }
        Ok(values)
    }

    async fn set_many(&self, items: Vec<(CacheKey, Vec<u8>)>, ttl: Option<Duration>) -> CacheResult<()> {
        let mut per_shard: BTreeMap<usize, Vec<Command>> = BTreeMap::new();
        for (key, value) in items {
            let command = self.write_command(&key, value, ttl, None);
            per_shard
                .entry(self.topology.shard_for(&key))
                .or_default()
                .push(command);
        }
        for (shard, commands) in per_shard {
            self.topology
                .backend(shard, Access::Write)
                .pipeline(commands, false)
                .await?;
        }
        Ok(())
    }

    async fn mget(&self, keys: &[CacheKey]) -> CacheResult<Vec<Option<Vec<u8>>>> {
        self.reject_sharded("mget")?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let command = Command::MGet {
            keys: keys.iter().map(|k| k.as_str().to_string()).collect(),
        };
        let stored = self
            .topology
            .backend(0, Access::Read)
            .execute(command)
            .await?
            .into_optional_bytes()?;
        Ok(stored.into_iter().map(|s| self.unpack(s)).collect())
    }

    async fn mset(&self, items: Vec<(CacheKey, Vec<u8>)>) -> CacheResult<()> {
        self.reject_sharded("mset")?;
        if items.is_empty() {
            return Ok(());
        }
        let command = Command::MSet {
            items: items
                .into_iter()
                .map(|(key, value)| (key.as_str().to_string(), value))
                .collect(),
        };
        self.topology.backend(0, Access::Write).execute(command).await?;
        Ok(())
    }

    async fn mget_nonatomic(&self, keys: &[CacheKey]) -> CacheResult<Vec<Option<Vec<u8>>>> {
        let mut values = vec![None; keys.len()];
        for (shard, positions) in self.group(keys) {
            let command = Command::MGet {
                keys: positions.iter().map(|&i| keys[i].as_str().to_string()).collect(),
            };
            let stored = self
                .topology
                .backend(shard, Access::Read)
                .execute(command)
                .await?
                .into_optional_bytes()?;
            for (position, stored) in positions.into_iter().zip(stored) {
                values[position] = self.unpack(stored);
            }
        }
        Ok(values)
    }

    async fn mset_nonatomic(&self, items: Vec<(CacheKey, Vec<u8>)>) -> CacheResult<()> {
        let mut per_shard: BTreeMap<usize, Vec<(String, Vec<u8>)>> = BTreeMap::new();
        for (key, value) in items {
            per_shard
                .entry(self.topology.shard_for(&key))
                .or_default()
                .push((key.as_str().to_string(), value));
        }
        for (shard, items) in per_shard {
            self.topology
                .backend(shard, Access::Write)
                .execute(Command::MSet { items })
                .await?;
        }
        Ok(())
    }

    async fn msetnx(&self, items: Vec<(CacheKey, Vec<u8>)>) -> CacheResult<bool> {
        if items.is_empty() {
            return Ok(true);
        }
        if !T::SHARDED {
            let command = Command::MSetNx {
                items: items
                    .into_iter()
                    .map(|(key, value)| (key.as_str().to_string(), value))
                    .collect(),
            };
            return self.topology.backend(0, Access::Write).execute(command).await?.into_bool();
        }
        let mut all_set = true;
        for (key, value) in items {
            let command = Command::Set {
                key: key.as_str().to_string(),
                value,
                expiry: None,
                condition: Some(Condition::IfAbsent),
            };
            all_set &= self.write(&key).execute(command).await?.into_bool()?;
        }
        Ok(all_set)
    }

    async fn delete_pattern(&self, pattern: &str, itersize: usize) -> CacheResult<u64> {
        let mut deleted = 0;
        for shard in 0..self.topology.shard_count() {
            let backend = self.topology.backend(shard, Access::Write);
            let mut cursor = 0;
            loop {
                let (next, keys) = backend
                    .execute(Command::Scan {
                        cursor,
                        pattern: Some(pattern.to_string()),
                        count: Some(itersize),
                    })
                    .await?
                    .into_scan()?;
                if !keys.is_empty() {
                    let n = backend.execute(Command::Del { keys }).await?.into_int()?;
                    deleted += n.max(0) as u64;
                }
                if next == 0 {
                    break;
                }
                cursor = next;
            }
        }
        debug!(pattern, deleted, "Deleted keys by pattern");
        Ok(deleted)
    }

    fn iter_keys(&self, pattern: &str, itersize: usize) -> BoxStream<'static, CacheResult<String>> {
        let scans: Vec<_> = (0..self.topology.shard_count())
            .map(|shard| {
                scan_backend(
                    self.topology.backend(shard, Access::Read),
                    pattern.to_string(),
                    itersize,
                )
            })
            .collect();
        stream::iter(scans).flatten().boxed()
    }

    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut keys = Vec::new();
        for shard in 0..self.topology.shard_count() {
            let found = self
                .topology
                .backend(shard, Access::Read)
                .execute(Command::Keys {
                    pattern: pattern.to_string(),
                })
                .await?
                .into_strings()?;
            keys.extend(found);
        }
        Ok(keys)
    }

    async fn clear(&self) -> CacheResult<()> {
        for shard in 0..self.topology.shard_count() {
            self.topology
                .backend(shard, Access::Write)
                .execute(Command::FlushDb)
                .await?;
        }
        Ok(())
    }

    fn lock(&self, key: &CacheKey, options: LockOptions) -> Lock {
        Lock::new(self.write(key), key.as_str(), options)
    }

    fn get_client(&self, write: bool) -> CacheResult<Arc<dyn Backend>> {
        self.reject_sharded("get_client")?;
        let access = if write { Access::Write } else { Access::Read };
        Ok(self.topology.backend(0, access))
    }

    fn raw_client(&self, key: Option<&CacheKey>) -> CacheResult<Arc<dyn Backend>> {
        match key {
            Some(key) => Ok(self.write(key)),
            None if T::SHARDED => Err(CacheError::Config(
                "raw_client needs a key to choose a shard".into(),
            )),
            None => Ok(self.topology.backend(0, Access::Write)),
        }
    }

    fn close(&self) {
        let backends = self.topology.backends();
        for backend in &backends {
            backend.disconnect();
        }
        info!(client = %self.kind, servers = backends.len(), "Cache client closed");
    }

    async fn sadd(&self, key: &CacheKey, members: Vec<Vec<u8>>) -> CacheResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let command = Command::SAdd {
            key: key.as_str().to_string(),
            members,
        };
        self.count(key, command, Access::Write).await
    }

    async fn srem(&self, key: &CacheKey, members: Vec<Vec<u8>>) -> CacheResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let command = Command::SRem {
            key: key.as_str().to_string(),
            members,
        };
        self.count(key, command, Access::Write).await
    }

    async fn smembers(&self, key: &CacheKey) -> CacheResult<Vec<Vec<u8>>> {
        self.read(key)
            .execute(Command::SMembers {
                key: key.as_str().to_string(),
            })
            .await?
            .into_byte_list()
    }

    async fn sismember(&self, key: &CacheKey, member: Vec<u8>) -> CacheResult<bool> {
        self.read(key)
            .execute(Command::SIsMember {
                key: key.as_str().to_string(),
                member,
            })
            .await?
            .into_bool()
    }

    async fn scard(&self, key: &CacheKey) -> CacheResult<u64> {
        let command = Command::SCard {
            key: key.as_str().to_string(),
        };
        self.count(key, command, Access::Read).await
    }

    async fn hset(&self, key: &CacheKey, fields: Vec<(String, Vec<u8>)>) -> CacheResult<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        let command = Command::HSet {
            key: key.as_str().to_string(),
            fields,
        };
        self.count(key, command, Access::Write).await
    }

    async fn hget(&self, key: &CacheKey, field: &str) -> CacheResult<Option<Vec<u8>>> {
        self.read(key)
            .execute(Command::HGet {
                key: key.as_str().to_string(),
                field: field.to_string(),
            })
            .await?
            .into_bytes()
    }

    async fn hdel(&self, key: &CacheKey, fields: Vec<String>) -> CacheResult<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        let command = Command::HDel {
            key: key.as_str().to_string(),
            fields,
        };
        self.count(key, command, Access::Write).await
    }

    async fn hlen(&self, key: &CacheKey) -> CacheResult<u64> {
        let command = Command::HLen {
            key: key.as_str().to_string(),
        };
        self.count(key, command, Access::Read).await
    }

    async fn hexists(&self, key: &CacheKey, field: &str) -> CacheResult<bool> {
        self.read(key)
            .execute(Command::HExists {
                key: key.as_str().to_string(),
                field: field.to_string(),
            })
            .await?
            .into_bool()
    }

    async fn hkeys(&self, key: &CacheKey) -> CacheResult<Vec<String>> {
        self.read(key)
            .execute(Command::HKeys {
                key: key.as_str().to_string(),
            })
            .await?
            .into_strings()
    }
}
