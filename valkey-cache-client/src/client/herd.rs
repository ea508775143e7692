//! Thundering-herd protection.
//!
//! Values written with a finite TTL are wrapped with their logical expiry
//! and stored for `ttl + herd_timeout`. Once the logical expiry passes, a
//! read still returns the stale value, but each reader reports a miss with
//! a probability that grows over the grace window. One reader then
//! recomputes while the rest keep the stale value.

use rand::Rng;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default grace window in seconds.
pub const DEFAULT_HERD_TIMEOUT: u64 = 60;

const MARKER: [u8; 4] = [0xFF, b'H', b'R', b'D'];
const HEADER_LEN: usize = MARKER.len() + 8;

/// Outcome of reading a possibly wrapped value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HerdRead {
    /// Serve this value.
    Fresh(Vec<u8>),
    /// Report a miss so the caller refreshes.
    Refresh,
}

/// Grace window and packing for herd-protected values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HerdPolicy {
    herd_timeout: Duration,
}

impl Default for HerdPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_HERD_TIMEOUT))
    }
}

impl HerdPolicy {
    /// Policy with the given grace window.
    pub fn new(herd_timeout: Duration) -> Self {
        Self { herd_timeout }
    }

    /// Grace window.
    pub fn herd_timeout(&self) -> Duration {
        self.herd_timeout
    }

    /// Wrap `value` for a write with `ttl`. Returns the stored bytes and the
    /// TTL to give the server. Values without a finite positive TTL are
    /// stored as-is.
    pub fn pack(&self, value: Vec<u8>, ttl: Option<Duration>) -> (Vec<u8>, Option<Duration>) {
        match ttl {
            Some(ttl) if !ttl.is_zero() => {
                let expires_at = unix_millis(SystemTime::now()).saturating_add(ttl.as_millis() as u64);
                let mut packed = Vec::with_capacity(HEADER_LEN + value.len());
                packed.extend_from_slice(&MARKER);
                packed.extend_from_slice(&expires_at.to_be_bytes());
                packed.extend_from_slice(&value);
                (packed, Some(ttl + self.herd_timeout))
            }
            other => (value, other),
        }
    }

    /// Unwrap a stored value read now.
    pub fn unpack(&self, stored: Vec<u8>) -> HerdRead {
        let roll = rand::rng().random_range(1..=self.window_millis());
        self.unpack_at(stored, unix_millis(SystemTime::now()), roll)
    }

    /// Unwrap a stored value read at `now_ms` with the random draw `roll`
    /// in `1..=herd_timeout` milliseconds.
    pub fn unpack_at(&self, stored: Vec<u8>, now_ms: u64, roll: u64) -> HerdRead {
        let Some(expires_at) = logical_expiry(&stored) else {
            return HerdRead::Fresh(stored);
        };
        if now_ms > expires_at && self.is_expired(now_ms - expires_at, roll) {
            return HerdRead::Refresh;
        }
        HerdRead::Fresh(stored[HEADER_LEN..].to_vec())
    }

    /// Strip the wrapper without the refresh decision.
    pub fn strip(&self, stored: Vec<u8>) -> Vec<u8> {
        match logical_expiry(&stored) {
            Some(_) => stored[HEADER_LEN..].to_vec(),
            None => stored,
        }
    }

    fn window_millis(&self) -> u64 {
        (self.herd_timeout.as_millis() as u64).max(1)
    }

    /// A reader `overdue_ms` past the logical expiry refreshes when the draw
    /// pushes it past the end of the window.
    fn is_expired(&self, overdue_ms: u64, roll: u64) -> bool {
        let window = self.window_millis();
        overdue_ms >= window || overdue_ms + roll >= window
    }
}

fn logical_expiry(stored: &[u8]) -> Option<u64> {
    if stored.len() < HEADER_LEN || stored[..MARKER.len()] != MARKER {
        return None;
    }
    let mut expiry = [0u8; 8];
    expiry.copy_from_slice(&stored[MARKER.len()..HEADER_LEN]);
    Some(u64::from_be_bytes(expiry))
}

fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
