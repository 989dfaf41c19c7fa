//! Schedules delayed, cancelable reply sends.
//!
//! Each planned reply becomes its own task: a fast cancellation check, a
//! randomized pre-send delay, a late cancellation check (manual traffic may
//! have arrived during the delay), then the send. Only a successful send
//! touches shared state, by recording the new message id as automatic.

use crate::coordination::CoordinationState;
use crate::discord::ChatClient;
use crate::models::{DelayWindow, PlannedReply, ReplyKind, Roster};
use std::sync::Arc;

pub struct ReplyDispatcher {
    client: ChatClient,
    state: Arc<CoordinationState>,
    roster: Arc<Roster>,
    scripted_window: DelayWindow,
    keyword_window: DelayWindow,
    typing_per_word: DelayWindow,
}

impl ReplyDispatcher {
    pub fn new(
        client: ChatClient,
        state: Arc<CoordinationState>,
        roster: Arc<Roster>,
        scripted_window: DelayWindow,
        keyword_window: DelayWindow,
        typing_per_word: DelayWindow,
    ) -> Self {
        ReplyDispatcher {
            client,
            state,
            roster,
            scripted_window,
            keyword_window,
            typing_per_word,
        }
    }

    /// Spawn the delayed send for a planned reply. Returns immediately.
    pub fn schedule(&self, reply: PlannedReply) {
        let profile = match self.roster.get(&reply.bot_identity) {
            Some(profile) => profile.clone(),
            None => {
                log::error!(
                    "Dispatcher: no account for identity {}, dropping reply",
                    reply.bot_identity
                );
                return;
            }
        };

        let window = match reply.kind {
            ReplyKind::Scripted => self.scripted_window,
            ReplyKind::Keyword => self.keyword_window,
        };
        let delay = window.sample();

        let client = self.client.clone();
        let state = self.state.clone();
        let typing = self.typing_per_word;

        tokio::spawn(async move {
            if state.is_canceled(&profile.identity, &reply.reference_id) {
                log::info!(
                    "[{}] Automatic message canceled due to a more recent manual message",
                    profile.name
                );
                return;
            }

            log::info!(
                "[{}] Waiting {:.2} seconds before replying...",
                profile.name,
                delay.as_secs_f64()
            );
            tokio::time::sleep(delay).await;

            // Manual traffic may have arrived while we were waiting.
            if state.is_canceled(&profile.identity, &reply.reference_id) {
                log::info!(
                    "[{}] Automatic message canceled due to a more recent manual message",
                    profile.name
                );
                return;
            }

            match client
                .deliver(
                    &profile.name,
                    &profile.token,
                    &reply.text,
                    Some(&reply.reference_id),
                    &typing,
                )
                .await
            {
                Ok(id) => state.record_auto(&id),
                Err(e) => log::error!("[{}] Failed to send reply: {}", profile.name, e),
            }
        });
    }
}
