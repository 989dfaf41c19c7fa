//! Decides who answers an incoming message.
//!
//! Two independent paths: the scripted path answers replies-to-bot and
//! @mentions out of the scripted template pools; the keyword path
//! opportunistically engages organic traffic out of the keyword pools while
//! the engagement epoch is active. Both consult the shared coordination
//! state so a bot never answers the same message twice and manual traffic
//! cancels pending machine replies.

use crate::coordination::{CoordinationState, Observation};
use crate::discord::ChannelMessage;
use crate::models::{PlannedReply, ReplyKind, Roster};
use crate::spam::SpamGuard;
use crate::templates::TemplateStore;
use std::collections::HashSet;
use std::sync::Arc;

pub struct ResponderEngine {
    roster: Arc<Roster>,
    state: Arc<CoordinationState>,
    templates: Arc<TemplateStore>,
    keywords: Arc<TemplateStore>,
    spam: Arc<SpamGuard>,
    max_keyword_users: usize,
}

impl ResponderEngine {
    pub fn new(
        roster: Arc<Roster>,
        state: Arc<CoordinationState>,
        templates: Arc<TemplateStore>,
        keywords: Arc<TemplateStore>,
        spam: Arc<SpamGuard>,
        max_keyword_users: usize,
    ) -> Self {
        ResponderEngine {
            roster,
            state,
            templates,
            keywords,
            spam,
            max_keyword_users,
        }
    }

    /// Which managed identities owe a response: the reply-target first, then
    /// mentioned identities in order of appearance, each subject to the
    /// manual-message cancellation rule. Returns an empty list for already
    /// processed messages, edits, and messages authored by managed bots.
    pub fn decide(&self, message: &ChannelMessage) -> Vec<String> {
        if self.state.observe(&message.id) == Observation::AlreadyProcessed {
            return Vec::new();
        }
        // Edits never trigger replies, but stay marked as processed.
        if message.edited_timestamp.is_some() {
            return Vec::new();
        }
        if self.roster.contains(&message.author.id) {
            return Vec::new();
        }

        let mut responders: Vec<String> = Vec::new();

        if let Some(referenced) = &message.referenced_message {
            let target = &referenced.author.id;
            if self.roster.contains(target) {
                if self.state.is_canceled(target, &message.id) {
                    log::info!(
                        "Bot {} will not respond due to a more recent manual message",
                        target
                    );
                } else {
                    responders.push(target.clone());
                }
            }
        }

        for mentioned in &message.mentions {
            if self.roster.contains(&mentioned.id) && !responders.contains(&mentioned.id) {
                if self.state.is_canceled(&mentioned.id, &message.id) {
                    log::info!(
                        "Bot {} will not respond due to a more recent manual message",
                        mentioned.id
                    );
                } else {
                    responders.push(mentioned.id.clone());
                }
            }
        }

        responders
    }

    /// Run the scripted path end to end: decide the responders, then assign
    /// each a distinct template key and draw its round-robin reply. A bot
    /// with no remaining matching key stays silent.
    pub fn plan_scripted(&self, message: &ChannelMessage) -> Vec<PlannedReply> {
        let responders = self.decide(message);
        if responders.is_empty() {
            return Vec::new();
        }

        log::info!(
            "Message from {}: '{}'",
            message.author.username,
            message.content
        );

        let mut used_keys: HashSet<String> = HashSet::new();
        let mut planned = Vec::new();

        for bot_identity in responders {
            let name = self
                .roster
                .get(&bot_identity)
                .map(|b| b.name.clone())
                .unwrap_or_else(|| bot_identity.clone());

            if self.state.has_responded(&bot_identity, &message.id) {
                log::info!(
                    "Bot {} already responded to message {}",
                    bot_identity,
                    message.id
                );
                continue;
            }

            let key = match self
                .templates
                .first_match_excluding(&message.content, &used_keys)
            {
                Some(key) => key.to_string(),
                None => {
                    log::warn!("[{}] No matching template or keyword already used", name);
                    continue;
                }
            };
            let pool = self.templates.pool(&key).unwrap_or(&[]);
            let text = match self.state.next_scripted_reply(&key, pool) {
                Some(text) => text,
                None => {
                    log::warn!("[{}] Template key '{}' has an empty pool", name, key);
                    continue;
                }
            };

            used_keys.insert(key);
            self.state.record_response(&bot_identity, &message.id);
            planned.push(PlannedReply {
                bot_identity,
                text,
                kind: ReplyKind::Scripted,
                reference_id: message.id.clone(),
            });
        }

        planned
    }

    /// The opportunistic keyword path. Applies only to organic, non-reply
    /// traffic while the engagement epoch is active; noisy authors and
    /// authors already served by every bot are skipped.
    pub fn plan_keyword(&self, message: &ChannelMessage) -> Option<PlannedReply> {
        if !self.state.keyword_active() {
            return None;
        }
        if self.roster.contains(&message.author.id) {
            return None;
        }
        if message.referenced_message.is_some() {
            return None;
        }
        if self.spam.is_spam(&message.author.id) {
            return None;
        }
        if self
            .state
            .keyword_author_saturated(&message.author.id, self.roster.len())
        {
            log::info!(
                "User {} has been responded to by all bots",
                message.author.id
            );
            return None;
        }

        let keyword = self.keywords.first_match(&message.content)?.to_string();
        let pool = self.keywords.pool(&keyword).unwrap_or(&[]);
        let identities = self.roster.identities();
        let claim = self.state.claim_keyword_reply(
            &message.author.id,
            &message.id,
            &identities,
            &keyword,
            pool,
            self.max_keyword_users,
        )?;

        let name = self
            .roster
            .get(&claim.bot_identity)
            .map(|b| b.name.clone())
            .unwrap_or_else(|| claim.bot_identity.clone());
        log::info!(
            "[{}] Detected keyword '{}' from {}: '{}'",
            name,
            keyword,
            message.author.username,
            message.content
        );
        if claim.suspended_detection {
            log::info!("Keyword detection paused: engaged-user cap reached");
        }

        Some(PlannedReply {
            bot_identity: claim.bot_identity,
            text: claim.reply,
            kind: ReplyKind::Keyword,
            reference_id: message.id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discord::testutil::{message, with_mention, with_reference};
    use crate::models::BotProfile;
    use std::time::Duration;

    fn roster() -> Arc<Roster> {
        Arc::new(
            Roster::new(vec![
                BotProfile {
                    identity: "100".into(),
                    name: "alpha".into(),
                    token: "tok-a".into(),
                },
                BotProfile {
                    identity: "200".into(),
                    name: "beta".into(),
                    token: "tok-b".into(),
                },
            ])
            .unwrap(),
        )
    }

    fn engine_with(templates: &str, keywords: &str, max_keyword_users: usize) -> ResponderEngine {
        ResponderEngine::new(
            roster(),
            Arc::new(CoordinationState::new()),
            Arc::new(TemplateStore::parse(templates)),
            Arc::new(TemplateStore::parse(keywords)),
            // Wide-open guard so keyword tests are not rate limited
            Arc::new(SpamGuard::new(
                Duration::from_secs(30),
                1000,
                Duration::ZERO,
            )),
            max_keyword_users,
        )
    }

    const TEMPLATES: &str = "[hello]\nhi back\nhello again\n\n[price]\nno idea\n";
    const KEYWORDS: &str = "[airdrop]\nnice\ncool\n";

    #[test]
    fn decide_orders_reply_target_before_mentions() {
        let engine = engine_with(TEMPLATES, KEYWORDS, 5);
        let referenced = message("50", "200", "beta", "earlier");
        let msg = with_mention(
            with_reference(message("60", "900", "user", "hello @alpha"), referenced),
            "100",
        );
        assert_eq!(engine.decide(&msg), vec!["200".to_string(), "100".to_string()]);
    }

    #[test]
    fn decide_skips_bot_authors_edits_and_duplicates() {
        let engine = engine_with(TEMPLATES, KEYWORDS, 5);

        let from_bot = with_mention(message("10", "100", "alpha", "hello"), "200");
        assert!(engine.decide(&from_bot).is_empty());

        let mut edited = with_mention(message("11", "900", "user", "hello"), "100");
        edited.edited_timestamp = Some("2024-01-01T00:00:00Z".to_string());
        assert!(engine.decide(&edited).is_empty());
        // The edit was still marked processed
        let replay = with_mention(message("11", "900", "user", "hello"), "100");
        assert!(engine.decide(&replay).is_empty());

        let fresh = with_mention(message("12", "900", "user", "hello"), "100");
        assert_eq!(engine.decide(&fresh), vec!["100".to_string()]);
        // Second evaluation of the same id decides nothing
        let again = with_mention(message("12", "900", "user", "hello"), "100");
        assert!(engine.decide(&again).is_empty());
    }

    #[test]
    fn decide_honors_manual_cancellation() {
        let engine = engine_with(TEMPLATES, KEYWORDS, 5);
        engine.state.record_manual("100", "70");

        let msg = with_mention(message("60", "900", "user", "hello"), "100");
        assert!(engine.decide(&msg).is_empty());

        // A message newer than the manual one still gets a response
        let newer = with_mention(message("80", "900", "user", "hello"), "100");
        assert_eq!(engine.decide(&newer), vec!["100".to_string()]);
    }

    #[test]
    fn plan_scripted_assigns_distinct_keys() {
        let engine = engine_with(TEMPLATES, KEYWORDS, 5);
        let msg = with_mention(
            with_mention(message("90", "900", "user", "hello, what price?"), "100"),
            "200",
        );
        let planned = engine.plan_scripted(&msg);
        assert_eq!(planned.len(), 2);
        // First matching key (enumeration order) goes to the first bot
        assert_eq!(planned[0].bot_identity, "100");
        assert_eq!(planned[0].text, "hi back");
        // Second bot gets the other matching key, not a duplicate
        assert_eq!(planned[1].bot_identity, "200");
        assert_eq!(planned[1].text, "no idea");
        assert!(planned.iter().all(|p| p.kind == ReplyKind::Scripted));
        assert!(planned.iter().all(|p| p.reference_id == "90"));
    }

    #[test]
    fn plan_scripted_single_key_leaves_second_bot_silent() {
        let engine = engine_with(TEMPLATES, KEYWORDS, 5);
        let msg = with_mention(
            with_mention(message("91", "900", "user", "hello there"), "100"),
            "200",
        );
        let planned = engine.plan_scripted(&msg);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].bot_identity, "100");
    }

    #[test]
    fn plan_scripted_round_robins_the_pool() {
        let engine = engine_with(TEMPLATES, KEYWORDS, 5);
        let mut texts = Vec::new();
        for i in 0..3 {
            let msg = with_mention(
                message(&format!("10{}", i), "900", "user", "hello"),
                "100",
            );
            let planned = engine.plan_scripted(&msg);
            texts.push(planned[0].text.clone());
        }
        assert_eq!(texts, vec!["hi back", "hello again", "hi back"]);
    }

    #[test]
    fn plan_keyword_rotates_and_respects_gates() {
        let engine = engine_with(TEMPLATES, KEYWORDS, 5);

        // Replies are excluded from the keyword path
        let reply = with_reference(
            message("300", "900", "user", "airdrop wen"),
            message("299", "901", "other", "x"),
        );
        assert!(engine.plan_keyword(&reply).is_none());

        // Managed authors are excluded
        let from_bot = message("301", "100", "alpha", "airdrop");
        assert!(engine.plan_keyword(&from_bot).is_none());

        // No keyword in content
        assert!(engine
            .plan_keyword(&message("302", "900", "user", "nothing here"))
            .is_none());

        let first = engine
            .plan_keyword(&message("303", "900", "user", "any airdrop?"))
            .unwrap();
        assert_eq!(first.bot_identity, "100");
        assert_eq!(first.kind, ReplyKind::Keyword);

        let second = engine
            .plan_keyword(&message("304", "900", "user", "airdrop pls"))
            .unwrap();
        assert_eq!(second.bot_identity, "200");

        // Served by every bot now
        assert!(engine
            .plan_keyword(&message("305", "900", "user", "airdrop again"))
            .is_none());
    }

    #[test]
    fn plan_keyword_cap_suspends_until_cooldown() {
        let engine = engine_with(TEMPLATES, KEYWORDS, 1);

        assert!(engine
            .plan_keyword(&message("400", "900", "user", "airdrop"))
            .is_some());
        // Cap of one user reached: detection suspended for everyone else
        assert!(engine
            .plan_keyword(&message("401", "901", "user2", "airdrop"))
            .is_none());

        assert!(engine.state.reactivate_keyword_if_due(Duration::ZERO));
        assert!(engine
            .plan_keyword(&message("402", "901", "user2", "airdrop"))
            .is_some());
    }

    #[test]
    fn plan_keyword_skips_flagged_authors() {
        let strict_spam = Arc::new(SpamGuard::new(
            Duration::from_secs(30),
            0,
            Duration::ZERO,
        ));
        let engine = ResponderEngine::new(
            roster(),
            Arc::new(CoordinationState::new()),
            Arc::new(TemplateStore::parse(TEMPLATES)),
            Arc::new(TemplateStore::parse(KEYWORDS)),
            strict_spam,
            5,
        );
        // Threshold zero: every author is immediately flagged
        assert!(engine
            .plan_keyword(&message("500", "900", "user", "airdrop"))
            .is_none());
    }
}
