//! Shared run state for response coordination.
//!
//! Everything the polling loop, the reply dispatcher, and the playback
//! driver agree on lives here behind a single mutex: which message ids were
//! already evaluated, which messages this system sent itself, the latest
//! human-sent ("manual") message per managed identity, per-bot answered
//! message sets, the scripted round-robin cursors, and the keyword
//! engagement epoch. Check-then-insert and increment-then-compare sequences
//! hold the lock for their whole read-modify-write, so concurrent reply
//! tasks cannot double-respond or miss a cancellation.

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Compare two message ids by recency. Platform ids are numeric snowflakes;
/// fall back to (length, lexicographic) when either side does not parse,
/// which preserves the same ordering for well-formed ids.
pub fn cmp_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => (a.len(), a).cmp(&(b.len(), b)),
    }
}

/// True if `a` is strictly newer than `b`.
pub fn id_newer(a: &str, b: &str) -> bool {
    cmp_ids(a, b) == Ordering::Greater
}

/// Outcome of offering a message id to the dedup tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    New,
    AlreadyProcessed,
}

/// A keyword reply claimed for a specific bot, plus whether this claim
/// filled the engagement window and suspended detection.
#[derive(Debug, Clone)]
pub struct KeywordClaim {
    pub bot_identity: String,
    pub reply: String,
    pub suspended_detection: bool,
}

#[derive(Default)]
struct KeywordEpoch {
    /// Detection on/off. Starts active; switched off when the engaged-user
    /// cap is reached, back on after the cooldown.
    suspended_at: Option<Instant>,
    /// Distinct non-bot authors engaged this epoch.
    engaged_users: HashSet<String>,
    /// author -> number of distinct bots that replied to them this epoch.
    bots_served: HashMap<String, usize>,
    /// keyword -> replies already emitted this epoch.
    used_replies: HashMap<String, HashSet<String>>,
    /// author -> rotating bot index. Survives epoch resets.
    rotation: HashMap<String, usize>,
}

#[derive(Default)]
struct Inner {
    processed: HashSet<String>,
    auto: HashSet<String>,
    /// bot identity -> latest message id seen from that identity that this
    /// system did not send.
    manual: HashMap<String, String>,
    /// bot identity -> message ids the bot has already answered.
    responded: HashMap<String, HashSet<String>>,
    /// template key -> next round-robin index.
    scripted_cursors: HashMap<String, usize>,
    keyword: KeywordEpoch,
}

pub struct CoordinationState {
    inner: Mutex<Inner>,
}

impl Default for CoordinationState {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinationState {
    pub fn new() -> Self {
        CoordinationState {
            inner: Mutex::new(Inner::default()),
        }
    }

    // ----- Dedup / manual tracking -----

    /// Check-then-insert into the processed set, atomically.
    pub fn observe(&self, message_id: &str) -> Observation {
        let mut inner = self.inner.lock();
        if inner.processed.contains(message_id) {
            Observation::AlreadyProcessed
        } else {
            inner.processed.insert(message_id.to_string());
            Observation::New
        }
    }

    /// Record a human-sent message for a managed identity. The id is also
    /// marked processed so the decision engine never evaluates it.
    pub fn record_manual(&self, bot_identity: &str, message_id: &str) {
        let mut inner = self.inner.lock();
        inner
            .manual
            .insert(bot_identity.to_string(), message_id.to_string());
        inner.processed.insert(message_id.to_string());
    }

    pub fn record_auto(&self, message_id: &str) {
        self.inner.lock().auto.insert(message_id.to_string());
    }

    pub fn is_auto(&self, message_id: &str) -> bool {
        self.inner.lock().auto.contains(message_id)
    }

    /// A pending reply from `bot_identity` referencing `reference_id` is
    /// canceled when a strictly newer message from that identity was seen
    /// and that message was not sent by this system.
    pub fn is_canceled(&self, bot_identity: &str, reference_id: &str) -> bool {
        let inner = self.inner.lock();
        match inner.manual.get(bot_identity) {
            Some(manual_id) => {
                id_newer(manual_id, reference_id) && !inner.auto.contains(manual_id)
            }
            None => false,
        }
    }

    // ----- Per-bot responded sets -----

    pub fn has_responded(&self, bot_identity: &str, message_id: &str) -> bool {
        self.inner
            .lock()
            .responded
            .get(bot_identity)
            .map(|set| set.contains(message_id))
            .unwrap_or(false)
    }

    pub fn record_response(&self, bot_identity: &str, message_id: &str) {
        self.inner
            .lock()
            .responded
            .entry(bot_identity.to_string())
            .or_default()
            .insert(message_id.to_string());
    }

    // ----- Scripted reply pools (round-robin) -----

    /// Take the next reply from a scripted pool, advancing the key's cursor.
    /// The cursor visits the pool in order and wraps after exactly
    /// `pool.len()` selections.
    pub fn next_scripted_reply(&self, key: &str, pool: &[String]) -> Option<String> {
        if pool.is_empty() {
            return None;
        }
        let mut inner = self.inner.lock();
        let cursor = inner.scripted_cursors.entry(key.to_string()).or_insert(0);
        let reply = pool[*cursor % pool.len()].clone();
        *cursor = (*cursor + 1) % pool.len();
        Some(reply)
    }

    // ----- Keyword engagement epoch -----

    pub fn keyword_active(&self) -> bool {
        self.inner.lock().keyword.suspended_at.is_none()
    }

    /// True when the author has already been served by every managed bot
    /// this epoch.
    pub fn keyword_author_saturated(&self, author_id: &str, bot_count: usize) -> bool {
        self.inner
            .lock()
            .keyword
            .bots_served
            .get(author_id)
            .map(|&n| n >= bot_count)
            .unwrap_or(false)
    }

    /// Atomically claim a keyword reply for the author's next bot in
    /// rotation. Returns `None` when detection is suspended, the author is
    /// saturated, or the rotation lands on a bot that already answered this
    /// message (the rotation does not advance in that case).
    pub fn claim_keyword_reply(
        &self,
        author_id: &str,
        message_id: &str,
        bot_identities: &[String],
        keyword: &str,
        pool: &[String],
        max_keyword_users: usize,
    ) -> Option<KeywordClaim> {
        if bot_identities.is_empty() || pool.is_empty() {
            return None;
        }
        let mut inner = self.inner.lock();
        if inner.keyword.suspended_at.is_some() {
            return None;
        }
        let served = inner
            .keyword
            .bots_served
            .get(author_id)
            .copied()
            .unwrap_or(0);
        if served >= bot_identities.len() {
            return None;
        }

        let rotation = *inner.keyword.rotation.get(author_id).unwrap_or(&0);
        let bot_identity = bot_identities[rotation % bot_identities.len()].clone();
        let already_responded = inner
            .responded
            .get(&bot_identity)
            .map(|set| set.contains(message_id))
            .unwrap_or(false);
        if already_responded {
            return None;
        }

        // Random draw without replacement; an exhausted pool resets.
        let used = inner
            .keyword
            .used_replies
            .entry(keyword.to_string())
            .or_default();
        let mut available: Vec<&String> = pool.iter().filter(|r| !used.contains(*r)).collect();
        if available.is_empty() {
            used.clear();
            available = pool.iter().collect();
        }
        let reply = match available.choose(&mut rand::thread_rng()) {
            Some(r) => (*r).clone(),
            None => return None,
        };
        used.insert(reply.clone());

        inner
            .keyword
            .rotation
            .insert(author_id.to_string(), rotation + 1);
        *inner
            .keyword
            .bots_served
            .entry(author_id.to_string())
            .or_insert(0) += 1;
        inner.keyword.engaged_users.insert(author_id.to_string());
        inner
            .responded
            .entry(bot_identity.clone())
            .or_default()
            .insert(message_id.to_string());

        let suspended_detection = inner.keyword.engaged_users.len() >= max_keyword_users;
        if suspended_detection {
            inner.keyword.suspended_at = Some(Instant::now());
        }

        Some(KeywordClaim {
            bot_identity,
            reply,
            suspended_detection,
        })
    }

    /// Reactivate keyword detection once the cooldown has elapsed, clearing
    /// the epoch state (engaged users, per-user bot counts, per-keyword
    /// usage) in the same critical section. Returns true when detection
    /// flipped back on.
    pub fn reactivate_keyword_if_due(&self, cooldown: Duration) -> bool {
        let mut inner = self.inner.lock();
        match inner.keyword.suspended_at {
            Some(suspended_at) if suspended_at.elapsed() >= cooldown => {
                inner.keyword.suspended_at = None;
                inner.keyword.engaged_users.clear();
                inner.keyword.bots_served.clear();
                inner.keyword.used_replies.clear();
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub fn engaged_user_count(&self) -> usize {
        self.inner.lock().keyword.engaged_users.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn id_ordering_is_numeric_with_length_fallback() {
        assert!(id_newer("1000", "999"));
        assert!(!id_newer("999", "1000"));
        assert!(!id_newer("500", "500"));
        // Non-numeric ids: longer wins, then lexicographic
        assert!(id_newer("zzz", "abc"));
        assert!(id_newer("aaaa", "zzz"));
    }

    #[test]
    fn observe_is_idempotent() {
        let state = CoordinationState::new();
        assert_eq!(state.observe("42"), Observation::New);
        assert_eq!(state.observe("42"), Observation::AlreadyProcessed);
        assert_eq!(state.observe("42"), Observation::AlreadyProcessed);
        assert_eq!(state.observe("43"), Observation::New);
    }

    #[test]
    fn manual_messages_cancel_older_references() {
        let state = CoordinationState::new();
        // No manual message recorded: nothing cancels
        assert!(!state.is_canceled("bot-1", "100"));

        state.record_manual("bot-1", "150");
        assert!(state.is_canceled("bot-1", "100"));
        // The reference is newer than the manual message: not canceled
        assert!(!state.is_canceled("bot-1", "200"));
        // Other identities are unaffected
        assert!(!state.is_canceled("bot-2", "100"));
    }

    #[test]
    fn auto_messages_never_cancel() {
        let state = CoordinationState::new();
        state.record_auto("150");
        state.record_manual("bot-1", "150");
        // The "manual" id was actually sent by us, so it cannot cancel
        assert!(!state.is_canceled("bot-1", "100"));
    }

    #[test]
    fn record_manual_marks_processed() {
        let state = CoordinationState::new();
        state.record_manual("bot-1", "77");
        assert_eq!(state.observe("77"), Observation::AlreadyProcessed);
    }

    #[test]
    fn scripted_cursor_wraps_in_order() {
        let state = CoordinationState::new();
        let pool = strings(&["a", "b", "c"]);
        let picks: Vec<String> = (0..6)
            .map(|_| state.next_scripted_reply("hey", &pool).unwrap())
            .collect();
        assert_eq!(picks, strings(&["a", "b", "c", "a", "b", "c"]));
        // Cursors are independent per key
        assert_eq!(state.next_scripted_reply("other", &pool).unwrap(), "a");
        assert!(state.next_scripted_reply("hey", &[]).is_none());
    }

    #[test]
    fn keyword_claim_rotates_bots_per_author() {
        let state = CoordinationState::new();
        let bots = strings(&["b1", "b2"]);
        let pool = strings(&["r1", "r2", "r3"]);

        let first = state
            .claim_keyword_reply("user", "m1", &bots, "wen", &pool, 10)
            .unwrap();
        assert_eq!(first.bot_identity, "b1");
        let second = state
            .claim_keyword_reply("user", "m2", &bots, "wen", &pool, 10)
            .unwrap();
        assert_eq!(second.bot_identity, "b2");
        // Every bot has now served this author
        assert!(state.keyword_author_saturated("user", 2));
        assert!(state
            .claim_keyword_reply("user", "m3", &bots, "wen", &pool, 10)
            .is_none());
    }

    #[test]
    fn keyword_claim_skips_bot_that_answered_message() {
        let state = CoordinationState::new();
        let bots = strings(&["b1", "b2"]);
        let pool = strings(&["r1"]);
        // b1 already answered m1 via the scripted path
        state.record_response("b1", "m1");
        assert!(state
            .claim_keyword_reply("user", "m1", &bots, "wen", &pool, 10)
            .is_none());
        // The rotation did not advance: a fresh message still starts at b1
        let claim = state
            .claim_keyword_reply("user", "m2", &bots, "wen", &pool, 10)
            .unwrap();
        assert_eq!(claim.bot_identity, "b1");
    }

    #[test]
    fn keyword_pool_resets_after_exhaustion() {
        let state = CoordinationState::new();
        let bots = strings(&["b1", "b2", "b3"]);
        let pool = strings(&["r1", "r2"]);
        let mut seen = Vec::new();
        for i in 0..3 {
            let claim = state
                .claim_keyword_reply("user", &format!("m{}", i), &bots, "wen", &pool, 10)
                .unwrap();
            seen.push(claim.reply);
        }
        // First two draws exhaust the pool without repeats; the third comes
        // from the reset pool.
        assert_ne!(seen[0], seen[1]);
        assert!(pool.contains(&seen[2]));
    }

    #[test]
    fn engagement_cap_suspends_and_cooldown_resets() {
        let state = CoordinationState::new();
        let bots = strings(&["b1"]);
        let pool = strings(&["r1"]);

        let claim = state
            .claim_keyword_reply("alice", "m1", &bots, "wen", &pool, 1)
            .unwrap();
        assert!(claim.suspended_detection);
        assert!(!state.keyword_active());
        // Detection is off: nobody else gets a claim
        assert!(state
            .claim_keyword_reply("bob", "m2", &bots, "wen", &pool, 1)
            .is_none());

        // Cooldown not yet elapsed
        assert!(!state.reactivate_keyword_if_due(Duration::from_secs(3600)));
        assert!(!state.keyword_active());

        // Zero cooldown elapses immediately; epoch state resets
        assert!(state.reactivate_keyword_if_due(Duration::ZERO));
        assert!(state.keyword_active());
        assert_eq!(state.engaged_user_count(), 0);
        assert!(!state.keyword_author_saturated("alice", 1));
        let again = state
            .claim_keyword_reply("bob", "m3", &bots, "wen", &pool, 1)
            .unwrap();
        assert_eq!(again.bot_identity, "b1");
    }
}
