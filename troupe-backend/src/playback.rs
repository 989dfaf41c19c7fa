//! Drives the pre-authored dialogue across the run.
//!
//! Lines are sent strictly in order. After each send the driver either
//! sleeps the line's explicit delay (skipping milestone bookkeeping, as an
//! authored beat) or sleeps a randomized interval for the sending account,
//! counts the message, pauses at configured milestones, and applies any
//! interval change registered for the milestone that was just passed. A
//! failed send is fatal to the whole run.

use crate::config::Dialogue;
use crate::coordination::CoordinationState;
use crate::discord::ChatClient;
use crate::models::{Account, DelayWindow};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub struct PlaybackDriver {
    client: ChatClient,
    state: Arc<CoordinationState>,
    accounts: Vec<Account>,
    dialogue: Dialogue,
    typing_per_word: DelayWindow,
}

impl PlaybackDriver {
    pub fn new(
        client: ChatClient,
        state: Arc<CoordinationState>,
        accounts: Vec<Account>,
        dialogue: Dialogue,
        typing_per_word: DelayWindow,
    ) -> Self {
        PlaybackDriver {
            client,
            state,
            accounts,
            dialogue,
            typing_per_word,
        }
    }

    pub async fn run(mut self) -> Result<(), String> {
        let interval_changes = self.dialogue.validated_interval_changes()?;
        // sender slot -> id of that slot's most recent sent message
        let mut last_per_sender: HashMap<usize, String> = HashMap::new();
        let mut sent_count: usize = 0;
        let mut milestone_cursor: usize = 0;

        log::info!(
            "Playback: starting, {} lines across {} accounts",
            self.dialogue.lines.len(),
            self.accounts.len()
        );

        for (index, line) in self.dialogue.lines.clone().into_iter().enumerate() {
            let account = self
                .accounts
                .get(line.sender)
                .cloned()
                .ok_or_else(|| format!("Playback: sender index {} is out of bounds", line.sender))?;

            let reference = line
                .reply_to
                .and_then(|slot| last_per_sender.get(&slot).cloned());

            let message_id = self
                .client
                .deliver(
                    &account.name,
                    &account.token,
                    &line.text,
                    reference.as_deref(),
                    &self.typing_per_word,
                )
                .await
                .map_err(|e| {
                    format!("Playback: [{}] failed to send line {}: {}", account.name, index, e)
                })?;

            last_per_sender.insert(line.sender, message_id.clone());
            self.state.record_auto(&message_id);

            if let Some(custom_delay) = line.delay {
                log::info!("Playback: custom delay of {:.2} seconds", custom_delay);
                tokio::time::sleep(Duration::from_secs_f64(custom_delay)).await;
                continue;
            }

            let wait = account.interval.sample();
            log::info!(
                "Playback: waiting {:.2} seconds before the next message...",
                wait.as_secs_f64()
            );
            tokio::time::sleep(wait).await;

            sent_count += 1;

            if let Some(milestone) = self.dialogue.milestones.get(milestone_cursor) {
                if sent_count >= milestone.after_messages {
                    log::info!(
                        "Playback: pausing for {:.2} seconds ({}/{})",
                        milestone.pause_secs,
                        milestone_cursor + 1,
                        self.dialogue.milestones.len()
                    );
                    tokio::time::sleep(Duration::from_secs_f64(milestone.pause_secs.max(0.0)))
                        .await;
                    milestone_cursor += 1;
                }
            }

            // The change applies to the current line's sender only; other
            // accounts pick it up when their own lines come around.
            if let Some(window) = interval_changes.get(&milestone_cursor) {
                if self.accounts[line.sender].interval != *window {
                    self.accounts[line.sender].interval = *window;
                    log::info!(
                        "Playback: [{}] interval changed to {:.0}-{:.0} seconds after pause {}",
                        account.name,
                        window.min_secs,
                        window.max_secs,
                        milestone_cursor
                    );
                }
            }
        }

        log::info!("Playback: conversation completed");
        Ok(())
    }
}
