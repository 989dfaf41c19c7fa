//! Per-author message-rate guard used to keep keyword engagement away from
//! noisy users. Only keyword replies consult this; mention/reply responses
//! are never suppressed by it.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Trailing observation window.
const SPAM_WINDOW: Duration = Duration::from_secs(30);
/// More than this many messages inside the window flags the author.
const SPAM_THRESHOLD: usize = 3;
/// Two messages closer together than this flag the author.
const MIN_MESSAGE_GAP: Duration = Duration::from_secs(5);

pub struct SpamGuard {
    windows: DashMap<String, Vec<Instant>>,
    window: Duration,
    threshold: usize,
    min_gap: Duration,
}

impl Default for SpamGuard {
    fn default() -> Self {
        SpamGuard::new(SPAM_WINDOW, SPAM_THRESHOLD, MIN_MESSAGE_GAP)
    }
}

impl SpamGuard {
    pub fn new(window: Duration, threshold: usize, min_gap: Duration) -> Self {
        SpamGuard {
            windows: DashMap::new(),
            window,
            threshold,
            min_gap,
        }
    }

    /// Record an observation for the author and report whether they are
    /// currently flagged. Side-effecting: every call counts as a message.
    pub fn is_spam(&self, author_id: &str) -> bool {
        self.is_spam_at(author_id, Instant::now())
    }

    pub fn is_spam_at(&self, author_id: &str, now: Instant) -> bool {
        let mut entry = self.windows.entry(author_id.to_string()).or_default();
        entry.push(now);
        entry.retain(|t| now.saturating_duration_since(*t) <= self.window);

        if entry.len() > self.threshold {
            log::warn!(
                "SpamGuard: user {} sent too many messages within {:?}",
                author_id,
                self.window
            );
            return true;
        }

        if entry.len() >= 2 {
            let last_two = &entry[entry.len() - 2..];
            if last_two[1].saturating_duration_since(last_two[0]) < self.min_gap {
                log::warn!(
                    "SpamGuard: user {} sent messages less than {:?} apart",
                    author_id,
                    self.min_gap
                );
                return true;
            }
        }

        false
    }
}
