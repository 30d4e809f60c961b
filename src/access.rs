//! # Access Recorder
//!
//! Per-key sliding-window access counters. A key whose recent access
//! count clears the policy threshold is considered hot and becomes a
//! candidate for promotion back into the memory tier. The map grows with
//! the distinct-key count; [`AccessRecorder::prune`] lets long-lived
//! caches sweep idle entries.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Policy that decides when a key is hot enough to promote.
#[derive(Debug, Clone)]
pub struct PromotionPolicy {
    /// Accesses within the window required to count as hot
    pub freq_threshold: u32,

    /// Sliding window length
    pub window: Duration,

    /// Payloads larger than this are never promoted
    pub size_limit: u64,
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self {
            freq_threshold: 4,
            window: Duration::from_secs(60),
            size_limit: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
struct AccessPattern {
    count: u32,
    last_access: Instant,
}

struct AccessInner {
    patterns: HashMap<String, AccessPattern>,
    policy: PromotionPolicy,
}

/// Sliding-window access tracker.
pub struct AccessRecorder {
    inner: RwLock<AccessInner>,
}

impl Default for AccessRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessRecorder {
    /// Create a recorder with the default policy.
    pub fn new() -> Self {
        Self::with_policy(PromotionPolicy::default())
    }

    /// Create a recorder with a custom policy.
    pub fn with_policy(policy: PromotionPolicy) -> Self {
        Self {
            inner: RwLock::new(AccessInner {
                patterns: HashMap::new(),
                policy,
            }),
        }
    }

    /// Record one access to `key`.
    ///
    /// An access after the window has elapsed restarts the count at 1;
    /// an access inside the window increments it.
    pub fn record(&self, key: &str) {
        let mut inner = self.inner.write();
        let window = inner.policy.window;
        let now = Instant::now();
        match inner.patterns.get_mut(key) {
            Some(pattern) => {
                if now.duration_since(pattern.last_access) > window {
                    pattern.count = 1;
                } else {
                    pattern.count += 1;
                }
                pattern.last_access = now;
            }
            None => {
                inner.patterns.insert(
                    key.to_string(),
                    AccessPattern {
                        count: 1,
                        last_access: now,
                    },
                );
            }
        }
    }

    /// Whether `key` is hot under the current policy.
    pub fn is_hot(&self, key: &str) -> bool {
        let inner = self.inner.read();
        match inner.patterns.get(key) {
            Some(pattern) => {
                pattern.last_access.elapsed() <= inner.policy.window
                    && pattern.count >= inner.policy.freq_threshold
            }
            None => false,
        }
    }

    /// Time since `key` was last accessed, if it was ever recorded.
    pub fn idle_for(&self, key: &str) -> Option<Duration> {
        self.inner
            .read()
            .patterns
            .get(key)
            .map(|p| p.last_access.elapsed())
    }

    /// Replace the promotion policy.
    pub fn set_policy(&self, policy: PromotionPolicy) {
        self.inner.write().policy = policy;
    }

    /// Current policy.
    pub fn policy(&self) -> PromotionPolicy {
        self.inner.read().policy.clone()
    }

    /// Forget a single key.
    pub fn remove(&self, key: &str) {
        self.inner.write().patterns.remove(key);
    }

    /// Sweep entries idle for longer than `max_idle`, returning the
    /// number removed.
    pub fn prune(&self, max_idle: Duration) -> usize {
        let mut inner = self.inner.write();
        let before = inner.patterns.len();
        inner
            .patterns
            .retain(|_, p| p.last_access.elapsed() <= max_idle);
        before - inner.patterns.len()
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.inner.read().patterns.len()
    }

    /// Whether the recorder tracks no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every pattern.
    pub fn clear(&self) {
        self.inner.write().patterns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cold_until_threshold() {
        let recorder = AccessRecorder::new();
        recorder.record("k");
        recorder.record("k");
        recorder.record("k");
        assert!(!recorder.is_hot("k"));
        recorder.record("k");
        assert!(recorder.is_hot("k"));
    }

    #[test]
    fn test_unknown_key_is_cold() {
        let recorder = AccessRecorder::new();
        assert!(!recorder.is_hot("never-seen"));
    }

    #[test]
    fn test_window_expiry_resets_count() {
        let recorder = AccessRecorder::with_policy(PromotionPolicy {
            freq_threshold: 2,
            window: Duration::from_millis(20),
            size_limit: 1024,
        });

        recorder.record("k");
        std::thread::sleep(Duration::from_millis(40));
        recorder.record("k");
        // The second access restarted the count, so one more is needed.
        assert!(!recorder.is_hot("k"));
        recorder.record("k");
        assert!(recorder.is_hot("k"));
    }

    #[test]
    fn test_policy_override() {
        let recorder = AccessRecorder::new();
        recorder.set_policy(PromotionPolicy {
            freq_threshold: 1,
            window: Duration::from_secs(60),
            size_limit: 1024,
        });
        recorder.record("k");
        assert!(recorder.is_hot("k"));
    }

    #[test]
    fn test_prune_sweeps_idle_entries() {
        let recorder = AccessRecorder::new();
        recorder.record("old");
        std::thread::sleep(Duration::from_millis(30));
        recorder.record("fresh");

        let removed = recorder.prune(Duration::from_millis(15));
        assert_eq!(removed, 1);
        assert_eq!(recorder.len(), 1);
        assert!(recorder.idle_for("fresh").is_some());
        assert!(recorder.idle_for("old").is_none());
    }
}
