//! ---
//! apm_section: "02-commands-scheduling"
//! apm_subsection: "module"
//! apm_type: "source"
//! apm_scope: "code"
//! apm_description: "Command scheduling: queue, dedup cache, executor dispatch."
//! apm_version: "v0.0.0-prealpha"
//! apm_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

/// Bounded FIFO set of recently executed command serial numbers.
///
/// Backs the at-most-once dispatch guarantee: a serial that reappears while
/// still cached is suppressed. The bound means a serial can recur after 64
/// distinct newer serials have evicted it; that window is accepted.
#[derive(Debug, Clone)]
pub struct SerialNumberCache {
    inner: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl SerialNumberCache {
    pub const DEFAULT_CAPACITY: usize = 64;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Record a serial, evicting the oldest entry first when at capacity.
    /// Re-adding a cached serial is a no-op, keeping entries unique.
    pub fn add(&self, serial: impl Into<String>) {
        let serial = serial.into();
        let mut queue = self.inner.lock();
        if queue.contains(&serial) {
            return;
        }
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(serial);
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.inner.lock().iter().any(|cached| cached == serial)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for SerialNumberCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_the_oldest_entry_at_capacity() {
        let cache = SerialNumberCache::with_capacity(3);
        cache.add("s-1");
        cache.add("s-2");
        cache.add("s-3");
        assert!(cache.contains("s-1"));

        cache.add("s-4");
        assert!(!cache.contains("s-1"), "oldest entry evicted");
        assert!(cache.contains("s-2"));
        assert!(cache.contains("s-4"));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn duplicate_adds_do_not_consume_capacity() {
        let cache = SerialNumberCache::with_capacity(2);
        cache.add("s-1");
        cache.add("s-1");
        cache.add("s-2");
        assert_eq!(cache.len(), 2);
        assert!(cache.contains("s-1"));
        assert!(cache.contains("s-2"));
    }

    #[test]
    fn a_serial_can_recur_once_evicted() {
        let cache = SerialNumberCache::with_capacity(2);
        cache.add("s-1");
        cache.add("s-2");
        cache.add("s-3");
        assert!(!cache.contains("s-1"));
        cache.add("s-1");
        assert!(cache.contains("s-1"));
    }
}
