// src/eviction.rs

//! Pluggable eviction for the in-memory result cache and run store.
//!
//! Both containers keep their entries in insertion order and ask the policy,
//! after every insert, whether the oldest evictable entry should go.
//! The default policy never evicts, so both stay unbounded for the lifetime
//! of the process unless configured otherwise.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

pub trait EvictionPolicy: Send + Sync + Debug {
    /// Whether the oldest evictable entry should be dropped, given how many
    /// evictable entries exist and how long ago the oldest was inserted.
    fn should_evict(&self, len: usize, oldest_age: Duration) -> bool;
}

/// Keep everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEviction;

impl EvictionPolicy for NoEviction {
    fn should_evict(&self, _len: usize, _oldest_age: Duration) -> bool {
        false
    }
}

/// Keep at most `n` entries.
#[derive(Debug, Clone, Copy)]
pub struct MaxEntries(pub usize);

impl EvictionPolicy for MaxEntries {
    fn should_evict(&self, len: usize, _oldest_age: Duration) -> bool {
        len > self.0
    }
}

/// Drop entries older than the given age (checked on insert).
#[derive(Debug, Clone, Copy)]
pub struct MaxAge(pub Duration);

impl EvictionPolicy for MaxAge {
    fn should_evict(&self, len: usize, oldest_age: Duration) -> bool {
        len > 0 && oldest_age > self.0
    }
}

/// Policy for a configured entry limit where `0` means unbounded.
pub fn policy_for_limit(max_entries: usize) -> Arc<dyn EvictionPolicy> {
    if max_entries == 0 {
        Arc::new(NoEviction)
    } else {
        Arc::new(MaxEntries(max_entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policies_decide_as_documented() {
        let zero = Duration::ZERO;
        assert!(!NoEviction.should_evict(usize::MAX, Duration::from_secs(3600)));
        assert!(!MaxEntries(2).should_evict(2, zero));
        assert!(MaxEntries(2).should_evict(3, zero));
        assert!(MaxAge(Duration::from_secs(1)).should_evict(1, Duration::from_secs(2)));
        assert!(!MaxAge(Duration::from_secs(1)).should_evict(0, Duration::from_secs(2)));
        assert!(!policy_for_limit(0).should_evict(1_000, zero));
        assert!(policy_for_limit(1).should_evict(2, zero));
    }
}
