use dotenv::dotenv;
use futures_util::future::join_all;
use std::io::Write;
use std::sync::Arc;

mod config;
mod coordination;
mod discord;
mod dispatcher;
mod http;
mod models;
mod playback;
mod poller;
mod responder;
mod spam;
mod templates;


use config::RunConfig;
use coordination::CoordinationState;
use discord::ChatClient;
use dispatcher::ReplyDispatcher;
use models::{BotProfile, Roster};
use playback::PlaybackDriver;
use poller::Poller;
use responder::ResponderEngine;
use spam::SpamGuard;
use templates::TemplateStore;

/// Writes every log line to stderr and appends it to the activity log file.
struct TeeWriter {
    file: std::fs::File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = std::io::stderr().write_all(buf);
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let _ = std::io::stderr().flush();
        self.file.flush()
    }
}

fn init_logger() {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{}] {:5} {}",
            chrono::Local::now().format("%H:%M:%S"),
            record.level(),
            record.args()
        )
    });

    if let Ok(path) = std::env::var(config::env_vars::ACTIVITY_LOG) {
        if !path.is_empty() {
            match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => {
                    builder.target(env_logger::Target::Pipe(Box::new(TeeWriter { file })));
                }
                Err(e) => eprintln!("Failed to open activity log {}: {}", path, e),
            }
        }
    }

    builder.init();
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    init_logger();

    if let Err(e) = run().await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let config = RunConfig::from_env()?;

    let accounts = config::load_accounts(&config.accounts_file)?;
    let dialogue = config::load_dialogue(&config.dialogue_file)?;
    dialogue.validate(accounts.len())?;
    dialogue.validated_interval_changes()?;
    let templates = Arc::new(TemplateStore::load(&config.templates_file)?);
    let keywords = Arc::new(TemplateStore::load(&config.keywords_file)?);
    log::info!(
        "Loaded {} accounts, {} dialogue lines, {} template keys, {} keyword keys",
        accounts.len(),
        dialogue.lines.len(),
        templates.len(),
        keywords.len()
    );

    let client = ChatClient::http(&config.channel_id);

    // Validate every credential and resolve its identity before anything
    // runs; a single invalid account aborts the whole run.
    let resolutions = join_all(
        accounts
            .iter()
            .map(|account| client.resolve_identity(&account.token)),
    )
    .await;
    let mut bots = Vec::with_capacity(accounts.len());
    for (account, resolution) in accounts.iter().zip(resolutions) {
        let identity = resolution
            .map_err(|e| format!("Account {} failed validation: {}", account.name, e))?;
        log::info!(
            "Account {} validated as {} ({})",
            account.name,
            identity.username,
            identity.id
        );
        bots.push(BotProfile {
            identity: identity.id,
            name: account.name.clone(),
            token: account.token.clone(),
        });
    }
    let roster = Arc::new(Roster::new(bots)?);
    for (bot, account) in roster.iter().zip(&accounts) {
        log::info!(
            "Managed account {} ({}) with interval {:.0}-{:.0}s",
            bot.name,
            bot.identity,
            account.interval.min_secs,
            account.interval.max_secs
        );
    }

    let cursor = client
        .latest_message_id(&roster.primary().token)
        .await
        .map_err(|e| format!("Failed to get the latest message id: {}", e))?;
    if cursor.is_none() {
        log::warn!("Channel has no messages yet; reacting to everything from here on");
    }

    let state = Arc::new(CoordinationState::new());
    let spam = Arc::new(SpamGuard::default());
    let engine = ResponderEngine::new(
        roster.clone(),
        state.clone(),
        templates,
        keywords,
        spam,
        config.max_keyword_users,
    );
    let dispatcher = Arc::new(ReplyDispatcher::new(
        client.clone(),
        state.clone(),
        roster.clone(),
        config.scripted_reply_window,
        config.keyword_reply_window,
        config.typing_per_word,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let poller = Poller::new(
        client.clone(),
        engine,
        dispatcher,
        state.clone(),
        roster.clone(),
        config.poll_interval,
        config.fetch_page_size,
        config.keyword_cooldown,
        cursor,
    );
    tokio::spawn(poller.run(shutdown_rx));

    if !config.start_delay.is_zero() {
        log::info!(
            "Starting in {:.0} seconds...",
            config.start_delay.as_secs_f64()
        );
        tokio::time::sleep(config.start_delay).await;
    }

    log::info!("Starting automatic conversation...");
    let playback = PlaybackDriver::new(
        client,
        state,
        accounts,
        dialogue,
        config.typing_per_word,
    );
    let result = playback.run().await;

    // Playback is over (or failed): stop reacting to the channel. Any
    // still-pending scheduled replies are abandoned with the process.
    let _ = shutdown_tx.send(());

    result
}
