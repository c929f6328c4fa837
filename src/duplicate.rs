// Copyright (c) 2024 The Ruby Link Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! C2: duplicate detector.
//!
//! Diversity receivers (more than one radio interface assigned to the same
//! local radio link) commonly see the same over-the-air frame more than
//! once. The first interface to present a given `(source, stream,
//! packet_index)` tuple wins; later copies on other interfaces are counted
//! for quality statistics but never delivered to the router.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default size of the per-source recent-packet LRU.
const DEFAULT_CAPACITY: usize = 64;
/// Entries older than this are no longer considered for dedup.
const DEFAULT_WINDOW: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct Key {
    source: u32,
    stream_id: u32,
    packet_index: u32,
}

struct Entry {
    key: Key,
    seen_at: Instant,
    first_interface: usize,
}

/// Tracks recently accepted `(source, stream, packet_index)` tuples to drop
/// duplicates arriving on a second diversity interface.
pub struct DuplicateDetector {
    recent: VecDeque<Entry>,
    capacity: usize,
    window: Duration,
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_WINDOW)
    }
}

impl DuplicateDetector {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            recent: VecDeque::with_capacity(capacity),
            capacity,
            window,
        }
    }

    fn evict_stale(&mut self, now: Instant) {
        while let Some(front) = self.recent.front() {
            if now.duration_since(front.seen_at) > self.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Checks `(interface, source, stream_id, packet_index)` against the
    /// recent window. Returns `true` (duplicate, drop it) if the same tuple
    /// was already accepted from a *different* interface within the window;
    /// the call that first observes a tuple always returns `false` and
    /// records it as the tuple's owning interface.
    pub fn is_duplicate(
        &mut self,
        interface: usize,
        source: u32,
        stream_id: u32,
        packet_index: u32,
        now: Instant,
    ) -> bool {
        self.evict_stale(now);

        let key = Key {
            source,
            stream_id,
            packet_index,
        };

        if let Some(existing) = self.recent.iter().find(|e| e.key == key) {
            return existing.first_interface != interface;
        }

        if self.recent.len() >= self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(Entry {
            key,
            seen_at: now,
            first_interface: interface,
        });
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_interface_wins_later_duplicates_are_dropped() {
        let mut dedup = DuplicateDetector::default();
        let now = Instant::now();

        assert!(!dedup.is_duplicate(0, 1, 2, 100, now));
        assert!(dedup.is_duplicate(1, 1, 2, 100, now));
        // Same interface re-presenting its own packet is not a "duplicate"
        // in the diversity sense; it is just re-observed.
        assert!(!dedup.is_duplicate(0, 1, 2, 100, now));
    }

    #[test]
    fn distinct_packet_indexes_are_not_duplicates() {
        let mut dedup = DuplicateDetector::default();
        let now = Instant::now();
        assert!(!dedup.is_duplicate(0, 1, 2, 100, now));
        assert!(!dedup.is_duplicate(1, 1, 2, 101, now));
    }

    #[test]
    fn entries_outside_the_window_expire() {
        let mut dedup = DuplicateDetector::new(64, Duration::from_millis(10));
        let t0 = Instant::now();
        assert!(!dedup.is_duplicate(0, 1, 2, 100, t0));
        let t1 = t0 + Duration::from_millis(50);
        // Past the window: treated as a fresh observation, not a duplicate.
        assert!(!dedup.is_duplicate(1, 1, 2, 100, t1));
    }
}
