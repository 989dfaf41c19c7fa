//! Long-running consumer of channel traffic.
//!
//! Every tick fetches one page of messages after the last-seen id and walks
//! it in arrival order: manual-message detection first, then the scripted
//! decision path, then the keyword path, advancing the cursor per message.
//! A failed fetch is logged and retried on the next tick; the cursor never
//! regresses.

use crate::coordination::{id_newer, CoordinationState};
use crate::discord::{ChannelMessage, ChatClient};
use crate::dispatcher::ReplyDispatcher;
use crate::models::Roster;
use crate::responder::ResponderEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::interval;

pub struct Poller {
    client: ChatClient,
    engine: ResponderEngine,
    dispatcher: Arc<ReplyDispatcher>,
    state: Arc<CoordinationState>,
    roster: Arc<Roster>,
    poll_interval: Duration,
    page_size: usize,
    keyword_cooldown: Duration,
    cursor: Option<String>,
}

impl Poller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: ChatClient,
        engine: ResponderEngine,
        dispatcher: Arc<ReplyDispatcher>,
        state: Arc<CoordinationState>,
        roster: Arc<Roster>,
        poll_interval: Duration,
        page_size: usize,
        keyword_cooldown: Duration,
        cursor: Option<String>,
    ) -> Self {
        Poller {
            client,
            engine,
            dispatcher,
            state,
            roster,
            poll_interval,
            page_size,
            keyword_cooldown,
            cursor,
        }
    }

    pub async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>) {
        log::info!(
            "Poller: starting (interval {:.1}s, page size {}, cursor {:?})",
            self.poll_interval.as_secs_f64(),
            self.page_size,
            self.cursor
        );

        let mut ticker = interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    log::info!("Poller: received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        log::info!("Poller: stopped");
    }

    pub(crate) async fn tick(&mut self) {
        if self.state.reactivate_keyword_if_due(self.keyword_cooldown) {
            log::info!("Poller: keyword detection is active again");
        }

        let token = self.roster.primary().token.clone();
        match self
            .client
            .fetch_after(&token, self.cursor.as_deref(), self.page_size)
            .await
        {
            Ok(messages) => {
                for message in messages {
                    self.handle_message(&message);
                    // Commit the cursor after the message was evaluated
                    let advance = match self.cursor.as_deref() {
                        Some(current) => id_newer(&message.id, current),
                        None => true,
                    };
                    if advance {
                        self.cursor = Some(message.id.clone());
                    }
                }
            }
            Err(e) => {
                log::warn!("Poller: failed to fetch messages: {}", e);
            }
        }
    }

    fn handle_message(&self, message: &ChannelMessage) {
        // A managed identity authored this and we did not send it: a human
        // is driving that account. Record it so pending machine replies for
        // the identity get canceled.
        if self.roster.contains(&message.author.id) && !self.state.is_auto(&message.id) {
            self.state.record_manual(&message.author.id, &message.id);
            log::info!(
                "Poller: manual message detected from bot {}: '{}' (id {})",
                message.author.id,
                message.content,
                message.id
            );
        }

        for reply in self.engine.plan_scripted(message) {
            self.dispatcher.schedule(reply);
        }

        if let Some(reply) = self.engine.plan_keyword(message) {
            self.dispatcher.schedule(reply);
        }
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }
}
