//! In-process backend.
//!
//! Applies commands to a local keyspace with server semantics: lazy expiry,
//! cursor-based `SCAN`, typed values and `WRONGTYPE` errors. Expiry runs on
//! [`tokio::time::Instant`], so paused-clock tests can advance it.
//! Connection failures can be injected with [`MemoryBackend::fail_after`].

use super::{Backend, Command, Condition, Expiry, Reply, glob_match};
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::trace;

const DEFAULT_SCAN_COUNT: usize = 10;
/// Open SCAN cursors kept before the oldest is forgotten.
const MAX_OPEN_SCANS: usize = 1024;

#[derive(Debug, Clone)]
enum Value {
    Str(Vec<u8>),
    Set(BTreeSet<Vec<u8>>),
    Hash(BTreeMap<String, Vec<u8>>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    /// Commands left before injected failures start.
    budget: Option<usize>,
    executed: u64,
    /// Last key returned for each open SCAN cursor.
    scans: BTreeMap<u64, String>,
    last_cursor: u64,
}

/// Backend keeping its keyspace in memory.
#[derive(Debug)]
pub struct MemoryBackend {
    name: String,
    state: Mutex<State>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty keyspace.
    pub fn new() -> Self {
        Self::named("default")
    }

    /// Create an empty keyspace with a name used in logs and errors.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Let the next `commands` commands succeed, then fail every command
    /// with a connection error until [`MemoryBackend::clear_faults`].
    pub fn fail_after(&self, commands: usize) {
        self.state.lock().budget = Some(commands);
    }

    /// Stop injecting failures.
    pub fn clear_faults(&self) {
        self.state.lock().budget = None;
    }

    /// Commands applied so far.
    pub fn commands_executed(&self) -> u64 {
        self.state.lock().executed
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let mut state = self.state.lock();
        state.purge_all(Instant::now());
        state.entries.len()
    }

    /// Whether the keyspace holds no live key.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn charge(&self, state: &mut State, commands: usize) -> CacheResult<()> {
        match state.budget {
            Some(left) if left < commands => {
                state.budget = Some(0);
                Err(CacheError::Connection(format!(
                    "connection to memory://{} lost",
                    self.name
                )))
            }
            Some(left) => {
                state.budget = Some(left - commands);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn execute(&self, command: Command) -> CacheResult<Reply> {
        let mut state = self.state.lock();
        self.charge(&mut state, 1)?;
        trace!(backend = %self.name, command = command.name(), "Executing");
        state.apply(command, Instant::now())
    }

    async fn pipeline(&self, commands: Vec<Command>, atomic: bool) -> CacheResult<Vec<Reply>> {
        let mut state = self.state.lock();
        if atomic {
            self.charge(&mut state, commands.len())?;
        }
        let now = Instant::now();
        let mut replies = Vec::with_capacity(commands.len());
        for command in commands {
            if !atomic {
                self.charge(&mut state, 1)?;
            }
            replies.push(state.apply(command, now)?);
        }
        Ok(replies)
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.name)
    }
}

fn wrong_type() -> CacheError {
    CacheError::Command("WRONGTYPE Operation against a key holding the wrong kind of value".into())
}

fn not_integer() -> CacheError {
    CacheError::Command("ERR value is not an integer or out of range".into())
}

fn bulk_array<I: IntoIterator<Item = Vec<u8>>>(items: I) -> Reply {
    Reply::Array(items.into_iter().map(Reply::Bulk).collect())
}

fn unix_millis_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl State {
    fn purge(&mut self, key: &str, now: Instant) {
        if let Some(entry) = self.entries.get(key)
            && entry.expires_at.is_some_and(|at| at <= now)
        {
            self.entries.remove(key);
        }
    }

    fn open_scan(&mut self, last: String) -> u64 {
        if self.scans.len() >= MAX_OPEN_SCANS {
            self.scans.pop_first();
        }
        self.last_cursor = self.last_cursor.wrapping_add(1).max(1);
        self.scans.insert(self.last_cursor, last);
        self.last_cursor
    }

    fn purge_all(&mut self, now: Instant) {
        self.entries
            .retain(|_, entry| entry.expires_at.is_none_or(|at| at > now));
    }

    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        self.purge(key, now);
        self.entries.get_mut(key)
    }

    fn set_deadline(&mut self, key: &str, millis: i64, now: Instant) -> Reply {
        if self.live(key, now).is_none() {
            return Reply::Int(0);
        }
        if millis <= 0 {
            self.entries.remove(key);
        } else if let Some(entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(now + Duration::from_millis(millis as u64));
        }
        Reply::Int(1)
    }

    fn string(&mut self, key: &str, now: Instant) -> CacheResult<Option<&Vec<u8>>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(bytes),
                ..
            }) => Ok(Some(bytes)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn set_mut(&mut self, key: &str, now: Instant) -> CacheResult<&mut BTreeSet<Vec<u8>>> {
        self.purge(key, now);
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(BTreeSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Set(set) => Ok(set),
            _ => Err(wrong_type()),
        }
    }

    fn hash_mut(&mut self, key: &str, now: Instant) -> CacheResult<&mut BTreeMap<String, Vec<u8>>> {
        self.purge(key, now);
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(BTreeMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(hash) => Ok(hash),
            _ => Err(wrong_type()),
        }
    }

    fn set_ref(&mut self, key: &str, now: Instant) -> CacheResult<Option<&BTreeSet<Vec<u8>>>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(Some(set)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn hash_ref(&mut self, key: &str, now: Instant) -> CacheResult<Option<&BTreeMap<String, Vec<u8>>>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(Some(hash)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|e| &e.value) {
            Some(Value::Set(set)) => set.is_empty(),
            Some(Value::Hash(hash)) => hash.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    fn incr_by(&mut self, key: &str, delta: i64, now: Instant) -> CacheResult<Reply> {
        let current = match self.string(key, now)? {
            None => 0,
            Some(bytes) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(not_integer)?,
        };
        let next = current.checked_add(delta).ok_or_else(not_integer)?;
        let expires_at = self.entries.get(key).and_then(|e| e.expires_at);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(next.to_string().into_bytes()),
                expires_at,
            },
        );
        Ok(Reply::Int(next))
    }

    fn apply(&mut self, command: Command, now: Instant) -> CacheResult<Reply> {
        self.executed += 1;
        let reply = match command {
            Command::Ping => Reply::Status("PONG".into()),
            Command::Get { key } => match self.string(&key, now)? {
                Some(bytes) => Reply::Bulk(bytes.clone()),
                None => Reply::Nil,
            },
            Command::Set {
                key,
                value,
                expiry,
                condition,
            } => {
                self.purge(&key, now);
                let existing = self.entries.get(&key);
                match (condition, existing.is_some()) {
                    (Some(Condition::IfAbsent), true) | (Some(Condition::IfPresent), false) => {
                        return Ok(Reply::Nil);
                    }
                    _ => {}
                }
                let expires_at = match expiry {
                    None => None,
                    Some(Expiry::KeepTtl) => existing.and_then(|e| e.expires_at),
                    Some(Expiry::Seconds(0)) | Some(Expiry::Millis(0)) => {
                        return Err(CacheError::Command("ERR invalid expire time in 'set' command".into()));
                    }
                    Some(Expiry::Seconds(secs)) => Some(now + Duration::from_secs(secs)),
                    Some(Expiry::Millis(millis)) => Some(now + Duration::from_millis(millis)),
                };
                self.entries.insert(
                    key,
                    Entry {
                        value: Value::Str(value),
                        expires_at,
                    },
                );
                Reply::Status("OK".into())
            }
            Command::Del { keys } => {
                let mut removed = 0;
                for key in keys {
                    self.purge(&key, now);
                    if self.entries.remove(&key).is_some() {
                        removed += 1;
                    }
                }
                Reply::Int(removed)
            }
            Command::Exists { keys } => {
                let mut found = 0;
                for key in keys {
                    if self.live(&key, now).is_some() {
                        found += 1;
                    }
                }
                Reply::Int(found)
            }
            Command::Ttl { key } => match self.live(&key, now) {
                None => Reply::Int(-2),
                Some(Entry { expires_at: None, .. }) => Reply::Int(-1),
                Some(Entry {
                    expires_at: Some(at),
                    ..
                }) => {
                    let millis = at.saturating_duration_since(now).as_millis() as i64;
                    Reply::Int((millis + 500) / 1000)
                }
            },
            Command::Pttl { key } => match self.live(&key, now) {
                None => Reply::Int(-2),
                Some(Entry { expires_at: None, .. }) => Reply::Int(-1),
                Some(Entry {
                    expires_at: Some(at),
                    ..
                }) => Reply::Int(at.saturating_duration_since(now).as_millis() as i64),
            },
            Command::Expire { key, seconds } => self.set_deadline(&key, seconds.saturating_mul(1000), now),
            Command::PExpire { key, millis } => self.set_deadline(&key, millis, now),
            Command::ExpireAt { key, timestamp } => {
                let millis = timestamp.saturating_mul(1000) - unix_millis_now();
                self.set_deadline(&key, millis, now)
            }
            Command::PExpireAt { key, timestamp_ms } => {
                let millis = timestamp_ms - unix_millis_now();
                self.set_deadline(&key, millis, now)
            }
            Command::Persist { key } => match self.live(&key, now) {
                Some(entry) if entry.expires_at.is_some() => {
                    entry.expires_at = None;
                    Reply::Int(1)
                }
                _ => Reply::Int(0),
            },
            Command::IncrBy { key, delta } => self.incr_by(&key, delta, now)?,
            Command::DecrBy { key, delta } => {
                let delta = delta.checked_neg().ok_or_else(not_integer)?;
                self.incr_by(&key, delta, now)?
            }
            Command::IncrByExisting { key, delta } => {
                if self.live(&key, now).is_none() {
                    Reply::Nil
                } else {
                    self.incr_by(&key, delta, now)?
                }
            }
            Command::MGet { keys } => Reply::Array(
                keys.iter()
                    .map(|key| match self.string(key, now) {
                        Ok(Some(bytes)) => Reply::Bulk(bytes.clone()),
                        _ => Reply::Nil,
                    })
                    .collect(),
            ),
            Command::MSet { items } => {
                for (key, value) in items {
                    self.entries.insert(
                        key,
                        Entry {
                            value: Value::Str(value),
                            expires_at: None,
                        },
                    );
                }
                Reply::Status("OK".into())
            }
            Command::MSetNx { items } => {
                for (key, _) in &items {
                    if self.live(key, now).is_some() {
                        return Ok(Reply::Int(0));
                    }
                }
                for (key, value) in items {
                    self.entries.insert(
                        key,
                        Entry {
                            value: Value::Str(value),
                            expires_at: None,
                        },
                    );
                }
                Reply::Int(1)
            }
            Command::Scan {
                cursor,
                pattern,
                count,
            } => {
                self.purge_all(now);
                let count = count.unwrap_or(DEFAULT_SCAN_COUNT).max(1);
                // An unknown cursor restarts the walk; SCAN allows duplicates.
                let after = match cursor {
                    0 => None,
                    cursor => self.scans.remove(&cursor),
                };
                let lower = match &after {
                    Some(key) => Bound::Excluded(key.as_str()),
                    None => Bound::Unbounded,
                };
                let mut walked = self
                    .entries
                    .range::<str, _>((lower, Bound::Unbounded))
                    .map(|(key, _)| key);
                let examined: Vec<&String> = walked.by_ref().take(count).collect();
                let more = walked.next().is_some();
                let page: Vec<Vec<u8>> = examined
                    .iter()
                    .filter(|key| pattern.as_deref().is_none_or(|p| glob_match(p, key)))
                    .map(|key| key.as_bytes().to_vec())
                    .collect();
                let resume = examined.last().filter(|_| more).map(|key| (*key).clone());
                let next = match resume {
                    Some(last) => self.open_scan(last),
                    None => 0,
                };
                Reply::Array(vec![
                    Reply::Bulk(next.to_string().into_bytes()),
                    bulk_array(page),
                ])
            }
            Command::Keys { pattern } => {
                self.purge_all(now);
                bulk_array(
                    self.entries
                        .keys()
                        .filter(|key| glob_match(&pattern, key))
                        .map(|key| key.clone().into_bytes()),
                )
            }
            Command::FlushDb => {
                self.entries.clear();
                Reply::Status("OK".into())
            }
            Command::CompareAndDelete { key, token } => {
                if self.string(&key, now)? == Some(&token) {
                    self.entries.remove(&key);
                    Reply::Int(1)
                } else {
                    Reply::Int(0)
                }
            }
            Command::CompareAndPExpire { key, token, millis } => {
                if self.string(&key, now)? == Some(&token) {
                    self.set_deadline(&key, millis, now)
                } else {
                    Reply::Int(0)
                }
            }
            Command::SAdd { key, members } => {
                let set = self.set_mut(&key, now)?;
                let added = members.into_iter().filter(|m| set.insert(m.clone())).count();
                Reply::Int(added as i64)
            }
            Command::SRem { key, members } => {
                let removed = if self.set_ref(&key, now)?.is_some() {
                    let set = self.set_mut(&key, now)?;
                    members.iter().filter(|m| set.remove(*m)).count()
                } else {
                    0
                };
                self.drop_if_empty(&key);
                Reply::Int(removed as i64)
            }
            Command::SMembers { key } => match self.set_ref(&key, now)? {
                None => Reply::Array(Vec::new()),
                Some(set) => bulk_array(set.iter().cloned()),
            },
            Command::SIsMember { key, member } => {
                let found = self.set_ref(&key, now)?.is_some_and(|set| set.contains(&member));
                Reply::Int(found as i64)
            }
            Command::SCard { key } => {
                Reply::Int(self.set_ref(&key, now)?.map_or(0, |set| set.len() as i64))
            }
            Command::HSet { key, fields } => {
                let hash = self.hash_mut(&key, now)?;
                let added = fields
                    .into_iter()
                    .filter(|(field, value)| hash.insert(field.clone(), value.clone()).is_none())
                    .count();
                Reply::Int(added as i64)
            }
            Command::HGet { key, field } => match self.hash_ref(&key, now)?.and_then(|h| h.get(&field)) {
                Some(value) => Reply::Bulk(value.clone()),
                None => Reply::Nil,
            },
            Command::HDel { key, fields } => {
                let removed = if self.hash_ref(&key, now)?.is_some() {
                    let hash = self.hash_mut(&key, now)?;
                    fields.iter().filter(|f| hash.remove(*f).is_some()).count()
                } else {
                    0
                };
                self.drop_if_empty(&key);
                Reply::Int(removed as i64)
            }
            Command::HLen { key } => {
                Reply::Int(self.hash_ref(&key, now)?.map_or(0, |hash| hash.len() as i64))
            }
            Command::HExists { key, field } => {
                let found = self.hash_ref(&key, now)?.is_some_and(|hash| hash.contains_key(&field));
                Reply::Int(found as i64)
            }
            Command::HKeys { key } => match self.hash_ref(&key, now)? {
                None => Reply::Array(Vec::new()),
                Some(hash) => bulk_array(hash.keys().map(|k| k.clone().into_bytes())),
            },
        };
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &str, value: &str) -> Command {
        Command::Set {
            key: key.into(),
            value: value.as_bytes().to_vec(),
            expiry: None,
            condition: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_follows_tokio_clock() {
        let backend = MemoryBackend::new();
        backend
            .execute(Command::Set {
                key: "k".into(),
                value: b"v".to_vec(),
                expiry: Some(Expiry::Seconds(22)),
                condition: None,
            })
            .await
            .unwrap();
        let ttl = backend.execute(Command::Ttl { key: "k".into() }).await.unwrap();
        assert_eq!(ttl, Reply::Int(22));

        tokio::time::advance(Duration::from_secs(23)).await;
        let value = backend.execute(Command::Get { key: "k".into() }).await.unwrap();
        assert_eq!(value, Reply::Nil);
    }

    #[tokio::test]
    async fn test_nx_and_xx_conditions() {
        let backend = MemoryBackend::new();
        let nx = |v: &str| Command::Set {
            key: "k".into(),
            value: v.as_bytes().to_vec(),
            expiry: None,
            condition: Some(Condition::IfAbsent),
        };
        assert_eq!(backend.execute(nx("a")).await.unwrap(), Reply::Status("OK".into()));
        assert_eq!(backend.execute(nx("b")).await.unwrap(), Reply::Nil);

        let xx = Command::Set {
            key: "missing".into(),
            value: b"x".to_vec(),
            expiry: None,
            condition: Some(Condition::IfPresent),
        };
        assert_eq!(backend.execute(xx).await.unwrap(), Reply::Nil);
        assert_eq!(
            backend.execute(Command::Get { key: "k".into() }).await.unwrap(),
            Reply::Bulk(b"a".to_vec())
        );
    }

    #[tokio::test]
    async fn test_scan_walks_whole_keyspace() {
        let backend = MemoryBackend::new();
        for i in 0..25 {
            backend.execute(set(&format!("foo_{i}"), "1")).await.unwrap();
        }
        backend.execute(set("bar", "1")).await.unwrap();

        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let reply = backend
                .execute(Command::Scan {
                    cursor,
                    pattern: Some("foo_*".into()),
                    count: Some(7),
                })
                .await
                .unwrap();
            let (next, keys) = reply.into_scan().unwrap();
            seen.extend(keys);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(seen.len(), 25);
    }

    #[tokio::test]
    async fn test_scan_survives_deleting_each_page() {
        let backend = MemoryBackend::new();
        for i in 0..25 {
            backend.execute(set(&format!("foo_{i}"), "1")).await.unwrap();
        }

        let mut cursor = 0;
        let mut deleted = 0;
        loop {
            let reply = backend
                .execute(Command::Scan {
                    cursor,
                    pattern: Some("foo_*".into()),
                    count: Some(10),
                })
                .await
                .unwrap();
            let (next, keys) = reply.into_scan().unwrap();
            for key in keys {
                if backend.execute(Command::Del { keys: vec![key] }).await.unwrap() == Reply::Int(1) {
                    deleted += 1;
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(deleted, 25);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_scan_cursor_restarts() {
        let backend = MemoryBackend::new();
        backend.execute(set("a", "1")).await.unwrap();
        let reply = backend
            .execute(Command::Scan {
                cursor: 4242,
                pattern: None,
                count: None,
            })
            .await
            .unwrap();
        let (next, keys) = reply.into_scan().unwrap();
        assert_eq!(next, 0);
        assert_eq!(keys, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_wrong_type_and_non_integer() {
        let backend = MemoryBackend::new();
        backend
            .execute(Command::SAdd {
                key: "s".into(),
                members: vec![b"m".to_vec()],
            })
            .await
            .unwrap();
        assert!(backend.execute(Command::Get { key: "s".into() }).await.is_err());

        backend.execute(set("t", "text")).await.unwrap();
        let err = backend
            .execute(Command::IncrBy {
                key: "t".into(),
                delta: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Command(_)));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let backend = MemoryBackend::new();
        backend.fail_after(1);
        backend.execute(Command::Ping).await.unwrap();
        let err = backend.execute(Command::Ping).await.unwrap_err();
        assert!(err.is_connection_error());

        backend.clear_faults();
        backend.execute(Command::Ping).await.unwrap();
    }

    #[tokio::test]
    async fn test_atomic_pipeline_is_all_or_nothing() {
        let backend = MemoryBackend::new();
        backend.fail_after(1);
        let result = backend
            .pipeline(vec![set("a", "1"), set("b", "2")], true)
            .await;
        assert!(result.is_err());
        backend.clear_faults();
        assert!(backend.is_empty());

        backend.fail_after(1);
        let result = backend
            .pipeline(vec![set("a", "1"), set("b", "2")], false)
            .await;
        assert!(result.is_err());
        backend.clear_faults();
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let backend = MemoryBackend::new();
        backend.execute(set("lock", "token-a")).await.unwrap();
        let wrong = Command::CompareAndDelete {
            key: "lock".into(),
            token: b"token-b".to_vec(),
        };
        assert_eq!(backend.execute(wrong).await.unwrap(), Reply::Int(0));
        let right = Command::CompareAndDelete {
            key: "lock".into(),
            token: b"token-a".to_vec(),
        };
        assert_eq!(backend.execute(right).await.unwrap(), Reply::Int(1));
        assert!(backend.is_empty());
    }

    #[test]
    fn test_hash_and_set_commands() {
        let backend = MemoryBackend::new();
        let added = tokio_test::block_on(backend.execute(Command::SAdd {
            key: "s".into(),
            members: vec![b"a".to_vec(), b"b".to_vec(), b"a".to_vec()],
        }));
        assert_eq!(tokio_test::assert_ok!(added), Reply::Int(2));

        let fields = vec![("f".to_string(), b"1".to_vec())];
        let set = tokio_test::block_on(backend.execute(Command::HSet {
            key: "h".into(),
            fields,
        }));
        assert_eq!(tokio_test::assert_ok!(set), Reply::Int(1));

        let wrong = tokio_test::block_on(backend.execute(Command::SCard { key: "h".into() }));
        tokio_test::assert_err!(wrong);
    }
}
