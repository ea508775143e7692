//! Distributed locks.
//!
//! A lock is a key set with `SET NX [PX]` holding a random token. Release and
//! extension run a compare-and-act script so a holder whose lock expired and
//! was taken over cannot touch the new holder's key.

use crate::backend::{Backend, Command, Condition, Expiry, millis_at_least_one};
use crate::error::{CacheError, CacheResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default pause between acquisition attempts.
pub const DEFAULT_LOCK_SLEEP: Duration = Duration::from_millis(100);

/// Lock settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Lock TTL; `None` holds until released.
    pub timeout: Option<Duration>,
    /// Pause between attempts.
    pub sleep: Duration,
    /// Wait for the lock instead of failing at once.
    pub blocking: bool,
    /// Give up waiting after this long; `None` waits forever.
    pub blocking_timeout: Option<Duration>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            sleep: DEFAULT_LOCK_SLEEP,
            blocking: true,
            blocking_timeout: None,
        }
    }
}

impl LockOptions {
    /// Expire the lock after `ttl`.
    pub fn timeout(mut self, ttl: Duration) -> Self {
        self.timeout = Some(ttl);
        self
    }

    /// Retry every `sleep` while waiting.
    pub fn sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    /// Fail immediately when the lock is held.
    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }

    /// Stop waiting after `limit`.
    pub fn blocking_timeout(mut self, limit: Duration) -> Self {
        self.blocking_timeout = Some(limit);
        self
    }
}

/// A named lock on one server.
#[derive(Clone)]
pub struct Lock {
    backend: Arc<dyn Backend>,
    name: String,
    options: LockOptions,
}

impl Lock {
    /// Create a lock handle; nothing is sent until acquisition.
    pub fn new(backend: Arc<dyn Backend>, name: impl Into<String>, options: LockOptions) -> Self {
        Self {
            backend,
            name: name.into(),
            options,
        }
    }

    /// Server key of the lock.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Settings of this lock.
    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Make one acquisition attempt.
    pub async fn try_acquire(&self) -> CacheResult<Option<LockGuard>> {
        let token = Uuid::new_v4().to_string().into_bytes();
        let acquired = self
            .backend
            .execute(Command::Set {
                key: self.name.clone(),
                value: token.clone(),
                expiry: self.options.timeout.map(|t| Expiry::Millis(millis_at_least_one(t))),
                condition: Some(Condition::IfAbsent),
            })
            .await?
            .into_bool()?;

        if !acquired {
            return Ok(None);
        }
        debug!(lock = %self.name, "Lock acquired");
        Ok(Some(LockGuard {
            backend: self.backend.clone(),
            name: self.name.clone(),
            token,
            released: false,
        }))
    }

    /// Acquire the lock, waiting as the options allow.
    pub async fn acquire(&self) -> CacheResult<LockGuard> {
        let started = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire().await? {
                return Ok(guard);
            }
            if !self.options.blocking {
                return Err(CacheError::LockTimeout(format!("lock '{}' is held", self.name)));
            }
            let mut pause = self.options.sleep;
            if let Some(limit) = self.options.blocking_timeout {
                let waited = started.elapsed();
                if waited >= limit {
                    return Err(CacheError::LockTimeout(format!(
                        "lock '{}' not acquired within {:?}",
                        self.name, limit
                    )));
                }
                pause = pause.min(limit - waited);
            }
            tokio::time::sleep(pause).await;
        }
    }

    /// Run `f` while holding the lock. The lock is released whether `f`
    /// succeeds or fails; an error from `f` takes precedence over a release
    /// error.
    pub async fn with_lock<F, Fut, T>(&self, f: F) -> CacheResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        let guard = self.acquire().await?;
        let result = f().await;
        let released = guard.release().await;
        let value = result?;
        released?;
        Ok(value)
    }

    /// Whether anyone holds the lock.
    pub async fn is_locked(&self) -> CacheResult<bool> {
        self.backend
            .execute(Command::Exists {
                keys: vec![self.name.clone()],
            })
            .await?
            .into_bool()
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("name", &self.name)
            .field("server", &self.backend.describe())
            .field("options", &self.options)
            .finish()
    }
}

/// Proof of holding a lock.
///
/// Dropping a guard without [`LockGuard::release`] schedules a best-effort
/// release on the current runtime; outside a runtime the lock is left to
/// its TTL.
pub struct LockGuard {
    backend: Arc<dyn Backend>,
    name: String,
    token: Vec<u8>,
    released: bool,
}

impl LockGuard {
    /// Server key of the lock.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The random token stored in the lock key.
    pub fn token(&self) -> &[u8] {
        &self.token
    }

    /// Release the lock. Fails with [`CacheError::LockNotHeld`] when the lock
    /// expired or changed hands.
    pub async fn release(mut self) -> CacheResult<()> {
        self.released = true;
        let deleted = self
            .backend
            .execute(Command::CompareAndDelete {
                key: self.name.clone(),
                token: self.token.clone(),
            })
            .await?
            .into_bool()?;
        if !deleted {
            return Err(CacheError::LockNotHeld(self.name.clone()));
        }
        debug!(lock = %self.name, "Lock released");
        Ok(())
    }

    /// Reset the lock TTL to `ttl` while still holding it.
    pub async fn extend(&self, ttl: Duration) -> CacheResult<()> {
        let extended = self
            .backend
            .execute(Command::CompareAndPExpire {
                key: self.name.clone(),
                token: self.token.clone(),
                millis: millis_at_least_one(ttl) as i64,
            })
            .await?
            .into_bool()?;
        if !extended {
            return Err(CacheError::LockNotHeld(self.name.clone()));
        }
        Ok(())
    }

    /// Whether the server still holds this guard's token.
    pub async fn is_owned(&self) -> CacheResult<bool> {
        let current = self
            .backend
            .execute(Command::Get {
                key: self.name.clone(),
            })
            .await?
            .into_bytes()?;
        Ok(current.as_deref() == Some(self.token.as_slice()))
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(lock = %self.name, "Lock dropped outside a runtime; left to expire");
            return;
        };
        let backend = self.backend.clone();
        let key = std::mem::take(&mut self.name);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            let command = Command::CompareAndDelete {
                key: key.clone(),
                token,
            };
            if let Err(e) = backend.execute(command).await {
                error!(lock = %key, error = %e, "Failed to release dropped lock");
            }
        });
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("released", &self.released)
            .finish()
    }
}
