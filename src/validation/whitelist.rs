//! TTL cache of validation verdicts keyed by (worker, task signature).

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Proven,
    Refused,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    verdict: Verdict,
    expires_at: Instant,
}

/// Process-local record of which workers recently proved (or failed to
/// prove) they can serve a capability signature.
///
/// Losing it only costs extra validation rounds.
pub struct WhitelistCache {
    entries: Mutex<HashMap<(String, String), Entry>>,
    whitelist_ttl: Duration,
    blacklist_ttl: Duration,
}

impl WhitelistCache {
    pub fn new(whitelist_ttl: Duration, blacklist_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            whitelist_ttl,
            blacklist_ttl,
        }
    }

    /// Poisoning is ignored: every critical section is a single map operation.
    fn entries(&self) -> MutexGuard<'_, HashMap<(String, String), Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a verdict, replacing any earlier one for the pair.
    pub fn record(&self, worker_id: &str, signature: &str, proven: bool) {
        let (verdict, ttl) = if proven {
            (Verdict::Proven, self.whitelist_ttl)
        } else {
            (Verdict::Refused, self.blacklist_ttl)
        };
        let entry = Entry {
            verdict,
            expires_at: Instant::now() + ttl,
        };
        self.entries()
            .insert((worker_id.to_string(), signature.to_string()), entry);
        debug!(worker_id, signature, proven, "Validation verdict cached");
    }

    pub fn is_whitelisted(&self, worker_id: &str, signature: &str) -> bool {
        self.verdict(worker_id, signature) == Some(Verdict::Proven)
    }

    pub fn is_blacklisted(&self, worker_id: &str, signature: &str) -> bool {
        self.verdict(worker_id, signature) == Some(Verdict::Refused)
    }

    fn verdict(&self, worker_id: &str, signature: &str) -> Option<Verdict> {
        let mut entries = self.entries();
        let key = (worker_id.to_string(), signature.to_string());
        match entries.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.verdict),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Drop lapsed entries. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.entries();
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
