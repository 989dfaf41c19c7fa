//! Run configuration: environment variables plus the accounts and dialogue
//! files. Everything is resolved once at startup; a malformed value is fatal
//! before the run begins.

use crate::models::{Account, DelayWindow};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable names - single source of truth
pub mod env_vars {
    pub const CHANNEL_ID: &str = "TROUPE_CHANNEL_ID";
    pub const ACCOUNTS_FILE: &str = "TROUPE_ACCOUNTS_FILE";
    pub const DIALOGUE_FILE: &str = "TROUPE_DIALOGUE_FILE";
    pub const TEMPLATES_FILE: &str = "TROUPE_TEMPLATES_FILE";
    pub const KEYWORDS_FILE: &str = "TROUPE_KEYWORDS_FILE";
    pub const START_DELAY_SECS: &str = "TROUPE_START_DELAY_SECS";
    pub const REPLY_DELAY_MIN_SECS: &str = "TROUPE_REPLY_DELAY_MIN_SECS";
    pub const REPLY_DELAY_MAX_SECS: &str = "TROUPE_REPLY_DELAY_MAX_SECS";
    pub const KEYWORD_DELAY_MIN_SECS: &str = "TROUPE_KEYWORD_DELAY_MIN_SECS";
    pub const KEYWORD_DELAY_MAX_SECS: &str = "TROUPE_KEYWORD_DELAY_MAX_SECS";
    pub const MAX_KEYWORD_USERS: &str = "TROUPE_MAX_KEYWORD_USERS";
    pub const KEYWORD_COOLDOWN_SECS: &str = "TROUPE_KEYWORD_COOLDOWN_SECS";
    pub const POLL_INTERVAL_SECS: &str = "TROUPE_POLL_INTERVAL_SECS";
    pub const FETCH_PAGE_SIZE: &str = "TROUPE_FETCH_PAGE_SIZE";
    pub const TYPING_SECS_PER_WORD_MIN: &str = "TROUPE_TYPING_SECS_PER_WORD_MIN";
    pub const TYPING_SECS_PER_WORD_MAX: &str = "TROUPE_TYPING_SECS_PER_WORD_MAX";
    pub const ACTIVITY_LOG: &str = "TROUPE_ACTIVITY_LOG";
}

/// Default values
pub mod defaults {
    pub const ACCOUNTS_FILE: &str = "accounts.txt";
    pub const DIALOGUE_FILE: &str = "dialogue.json";
    pub const TEMPLATES_FILE: &str = "templates.txt";
    pub const KEYWORDS_FILE: &str = "keywords.txt";
    pub const START_DELAY_SECS: f64 = 0.0;
    pub const REPLY_DELAY_MIN_SECS: f64 = 15.0;
    pub const REPLY_DELAY_MAX_SECS: f64 = 60.0;
    pub const KEYWORD_DELAY_MIN_SECS: f64 = 20.0;
    pub const KEYWORD_DELAY_MAX_SECS: f64 = 90.0;
    pub const MAX_KEYWORD_USERS: usize = 5;
    pub const KEYWORD_COOLDOWN_SECS: f64 = 1800.0;
    pub const POLL_INTERVAL_SECS: f64 = 5.0;
    pub const FETCH_PAGE_SIZE: usize = 100;
    pub const TYPING_SECS_PER_WORD_MIN: f64 = 0.4;
    pub const TYPING_SECS_PER_WORD_MAX: f64 = 0.7;
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Full run configuration consumed by main.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub channel_id: String,
    pub accounts_file: String,
    pub dialogue_file: String,
    pub templates_file: String,
    pub keywords_file: String,
    pub start_delay: Duration,
    /// Pre-send delay window for scripted (mention/reply) responses.
    pub scripted_reply_window: DelayWindow,
    /// Pre-send delay window for keyword responses.
    pub keyword_reply_window: DelayWindow,
    /// Typing simulation, seconds per word.
    pub typing_per_word: DelayWindow,
    pub max_keyword_users: usize,
    pub keyword_cooldown: Duration,
    pub poll_interval: Duration,
    pub fetch_page_size: usize,
}

impl RunConfig {
    pub fn from_env() -> Result<Self, String> {
        let channel_id = std::env::var(env_vars::CHANNEL_ID)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| format!("{} is not set", env_vars::CHANNEL_ID))?;
        if !channel_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!(
                "{} must be a numeric channel id (got '{}')",
                env_vars::CHANNEL_ID,
                channel_id
            ));
        }

        let start_delay_secs = env_parse(env_vars::START_DELAY_SECS, defaults::START_DELAY_SECS);
        if start_delay_secs < 0.0 {
            return Err("start delay cannot be negative".to_string());
        }

        let scripted_reply_window = DelayWindow::new(
            env_parse(env_vars::REPLY_DELAY_MIN_SECS, defaults::REPLY_DELAY_MIN_SECS),
            env_parse(env_vars::REPLY_DELAY_MAX_SECS, defaults::REPLY_DELAY_MAX_SECS),
        )
        .map_err(|e| format!("invalid scripted reply delay window: {}", e))?;

        let keyword_reply_window = DelayWindow::new(
            env_parse(env_vars::KEYWORD_DELAY_MIN_SECS, defaults::KEYWORD_DELAY_MIN_SECS),
            env_parse(env_vars::KEYWORD_DELAY_MAX_SECS, defaults::KEYWORD_DELAY_MAX_SECS),
        )
        .map_err(|e| format!("invalid keyword reply delay window: {}", e))?;

        let typing_per_word = DelayWindow::new(
            env_parse(
                env_vars::TYPING_SECS_PER_WORD_MIN,
                defaults::TYPING_SECS_PER_WORD_MIN,
            ),
            env_parse(
                env_vars::TYPING_SECS_PER_WORD_MAX,
                defaults::TYPING_SECS_PER_WORD_MAX,
            ),
        )
        .map_err(|e| format!("invalid typing window: {}", e))?;

        let poll_interval_secs: f64 =
            env_parse(env_vars::POLL_INTERVAL_SECS, defaults::POLL_INTERVAL_SECS);
        if poll_interval_secs <= 0.0 {
            return Err("poll interval must be positive".to_string());
        }

        let fetch_page_size: usize =
            env_parse(env_vars::FETCH_PAGE_SIZE, defaults::FETCH_PAGE_SIZE);
        if fetch_page_size == 0 {
            return Err("fetch page size must be at least 1".to_string());
        }

        Ok(RunConfig {
            channel_id,
            accounts_file: env_string(env_vars::ACCOUNTS_FILE, defaults::ACCOUNTS_FILE),
            dialogue_file: env_string(env_vars::DIALOGUE_FILE, defaults::DIALOGUE_FILE),
            templates_file: env_string(env_vars::TEMPLATES_FILE, defaults::TEMPLATES_FILE),
            keywords_file: env_string(env_vars::KEYWORDS_FILE, defaults::KEYWORDS_FILE),
            start_delay: Duration::from_secs_f64(start_delay_secs),
            scripted_reply_window,
            keyword_reply_window,
            typing_per_word,
            max_keyword_users: env_parse(env_vars::MAX_KEYWORD_USERS, defaults::MAX_KEYWORD_USERS),
            keyword_cooldown: Duration::from_secs_f64(
                env_parse(env_vars::KEYWORD_COOLDOWN_SECS, defaults::KEYWORD_COOLDOWN_SECS)
                    .max(0.0),
            ),
            poll_interval: Duration::from_secs_f64(poll_interval_secs),
            fetch_page_size,
        })
    }
}

/// Parse the accounts file: one `name:token:min_interval:max_interval` per
/// line. Blank lines are skipped. At least two accounts are required.
pub fn parse_accounts(text: &str) -> Result<Vec<Account>, String> {
    let mut accounts = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() != 4 {
            return Err(format!(
                "accounts file line {}: expected name:token:min_interval:max_interval",
                lineno + 1
            ));
        }
        let min: f64 = parts[2].parse().map_err(|_| {
            format!(
                "accounts file line {}: min_interval must be a number (got '{}')",
                lineno + 1,
                parts[2]
            )
        })?;
        let max: f64 = parts[3].parse().map_err(|_| {
            format!(
                "accounts file line {}: max_interval must be a number (got '{}')",
                lineno + 1,
                parts[3]
            )
        })?;
        let interval = DelayWindow::new(min, max)
            .map_err(|e| format!("accounts file line {}: {}", lineno + 1, e))?;
        accounts.push(Account {
            name: parts[0].to_string(),
            token: parts[1].to_string(),
            interval,
        });
    }
    if accounts.len() < 2 {
        return Err("accounts file must contain at least 2 accounts".to_string());
    }
    Ok(accounts)
}

pub fn load_accounts(path: &str) -> Result<Vec<Account>, String> {
    let text = std::fs::read_to_string(Path::new(path))
        .map_err(|e| format!("failed to read accounts file {}: {}", path, e))?;
    parse_accounts(&text)
}

/// One authored dialogue line.
#[derive(Debug, Clone, Deserialize)]
pub struct DialogueLine {
    pub sender: usize,
    pub text: String,
    /// Reply target by sender slot, resolved to that slot's latest sent id.
    #[serde(default)]
    pub reply_to: Option<usize>,
    /// Fixed post-send delay in seconds, overriding the randomized interval.
    #[serde(default)]
    pub delay: Option<f64>,
}

/// Pause the playback after a cumulative number of interval-counted sends.
#[derive(Debug, Clone, Deserialize)]
pub struct Milestone {
    pub after_messages: usize,
    pub pause_secs: f64,
}

/// New [min,max] interval applied once the given milestone has passed.
#[derive(Debug, Clone, Deserialize)]
pub struct IntervalChange {
    pub after_milestone: usize,
    pub min_secs: f64,
    pub max_secs: f64,
}

/// The authored dialogue document: lines plus the pause/interval schedules.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Dialogue {
    pub lines: Vec<DialogueLine>,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
    #[serde(default)]
    pub interval_changes: Vec<IntervalChange>,
}

impl Dialogue {
    pub fn parse(text: &str) -> Result<Self, String> {
        let dialogue: Dialogue =
            serde_json::from_str(text).map_err(|e| format!("invalid dialogue document: {}", e))?;
        if dialogue.lines.is_empty() {
            return Err("dialogue document has no lines".to_string());
        }
        Ok(dialogue)
    }

    /// Validate sender slots against the configured account count.
    pub fn validate(&self, account_count: usize) -> Result<(), String> {
        for (i, line) in self.lines.iter().enumerate() {
            if line.sender >= account_count {
                return Err(format!(
                    "dialogue line {}: sender index {} is out of bounds ({} accounts)",
                    i, line.sender, account_count
                ));
            }
            if let Some(delay) = line.delay {
                if delay < 0.0 {
                    return Err(format!("dialogue line {}: delay cannot be negative", i));
                }
            }
        }
        Ok(())
    }

    /// The interval change registered for a milestone index, if any.
    pub fn interval_change_for(&self, milestone: usize) -> Option<&IntervalChange> {
        self.interval_changes
            .iter()
            .find(|c| c.after_milestone == milestone)
    }

    /// Interval-change windows validated and indexed by milestone.
    pub fn validated_interval_changes(&self) -> Result<HashMap<usize, DelayWindow>, String> {
        let mut map = HashMap::new();
        for change in &self.interval_changes {
            let window = DelayWindow::new(change.min_secs, change.max_secs).map_err(|e| {
                format!(
                    "interval change after milestone {}: {}",
                    change.after_milestone, e
                )
            })?;
            map.insert(change.after_milestone, window);
        }
        Ok(map)
    }
}

pub fn load_dialogue(path: &str) -> Result<Dialogue, String> {
    let text = std::fs::read_to_string(Path::new(path))
        .map_err(|e| format!("failed to read dialogue file {}: {}", path, e))?;
    Dialogue::parse(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accounts_happy_path() {
        let accounts = parse_accounts("alpha:tok-a:10:20\nbeta:tok-b:5:15\n").unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].name, "alpha");
        assert_eq!(accounts[1].token, "tok-b");
        assert_eq!(accounts[1].interval.min_secs, 5.0);
        assert_eq!(accounts[1].interval.max_secs, 15.0);
    }

    #[test]
    fn parse_accounts_rejects_bad_lines() {
        assert!(parse_accounts("just-a-name\n").is_err());
        assert!(parse_accounts("a:t:x:20\nb:t:1:2\n").is_err());
        assert!(parse_accounts("a:t:20:10\nb:t:1:2\n").is_err());
        // Fewer than two accounts
        assert!(parse_accounts("a:t:1:2\n").is_err());
    }

    #[test]
    fn dialogue_parse_and_validate() {
        let doc = r#"{
            "lines": [
                {"sender": 0, "text": "hi"},
                {"sender": 1, "text": "hey", "reply_to": 0},
                {"sender": 0, "text": "later", "delay": 3.5}
            ],
            "milestones": [{"after_messages": 2, "pause_secs": 60}],
            "interval_changes": [{"after_milestone": 1, "min_secs": 30, "max_secs": 45}]
        }"#;
        let dialogue = Dialogue::parse(doc).unwrap();
        assert_eq!(dialogue.lines.len(), 3);
        assert_eq!(dialogue.lines[1].reply_to, Some(0));
        assert_eq!(dialogue.lines[2].delay, Some(3.5));
        assert!(dialogue.validate(2).is_ok());
        // Sender 1 is out of bounds with a single account
        assert!(dialogue.validate(1).is_err());

        let changes = dialogue.validated_interval_changes().unwrap();
        assert_eq!(changes[&1].min_secs, 30.0);
        assert!(dialogue.interval_change_for(2).is_none());
    }

    #[test]
    fn dialogue_rejects_empty() {
        assert!(Dialogue::parse(r#"{"lines": []}"#).is_err());
        assert!(Dialogue::parse("not json").is_err());
    }

    #[test]
    fn load_accounts_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.txt");
        std::fs::write(&path, "alpha:tok-a:10:20\nbeta:tok-b:5:15\n").unwrap();
        let accounts = load_accounts(path.to_str().unwrap()).unwrap();
        assert_eq!(accounts.len(), 2);
        assert!(load_accounts("/nonexistent/accounts.txt").is_err());
    }
}
