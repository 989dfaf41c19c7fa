//! Domain types shared across the run: managed accounts, the resolved bot
//! roster, delay windows, and planned replies handed to the dispatcher.

use rand::Rng;
use std::time::Duration;

/// Inclusive [min, max] delay range in seconds, sampled uniformly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayWindow {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl DelayWindow {
    pub fn new(min_secs: f64, max_secs: f64) -> Result<Self, String> {
        if min_secs < 0.0 {
            return Err(format!("delay window min must be >= 0 (got {})", min_secs));
        }
        if max_secs < min_secs {
            return Err(format!(
                "delay window max must be >= min (got {}-{})",
                min_secs, max_secs
            ));
        }
        Ok(DelayWindow { min_secs, max_secs })
    }

    /// Draw a uniform duration from the window.
    pub fn sample(&self) -> Duration {
        let secs = if self.max_secs > self.min_secs {
            rand::thread_rng().gen_range(self.min_secs..self.max_secs)
        } else {
            self.min_secs
        };
        Duration::from_secs_f64(secs)
    }

    /// Scale both bounds by a factor (e.g. seconds-per-word × word count).
    pub fn scaled(&self, factor: f64) -> DelayWindow {
        DelayWindow {
            min_secs: self.min_secs * factor,
            max_secs: self.max_secs * factor,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.max_secs <= 0.0
    }
}

/// One managed account as configured: display name, credential, and the
/// randomized inter-message interval used by the playback driver.
/// The interval is mutable over the run (interval-change events).
#[derive(Debug, Clone)]
pub struct Account {
    pub name: String,
    pub token: String,
    pub interval: DelayWindow,
}

/// An account with its platform identity resolved at startup.
#[derive(Debug, Clone)]
pub struct BotProfile {
    pub identity: String,
    pub name: String,
    pub token: String,
}

/// The set of managed bot identities, in account-file order.
#[derive(Debug, Clone)]
pub struct Roster {
    bots: Vec<BotProfile>,
}

impl Roster {
    pub fn new(bots: Vec<BotProfile>) -> Result<Self, String> {
        if bots.is_empty() {
            return Err("roster must contain at least one account".to_string());
        }
        Ok(Roster { bots })
    }

    pub fn len(&self) -> usize {
        self.bots.len()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.bots.iter().any(|b| b.identity == identity)
    }

    pub fn get(&self, identity: &str) -> Option<&BotProfile> {
        self.bots.iter().find(|b| b.identity == identity)
    }

    pub fn by_index(&self, index: usize) -> Option<&BotProfile> {
        self.bots.get(index)
    }

    /// The account whose credential is used for channel reads.
    pub fn primary(&self) -> &BotProfile {
        &self.bots[0]
    }

    pub fn identities(&self) -> Vec<String> {
        self.bots.iter().map(|b| b.identity.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BotProfile> {
        self.bots.iter()
    }
}

/// Which reply pool a planned reply came from; selects the delay window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Scripted,
    Keyword,
}

/// A fully decided response, ready for the dispatcher.
#[derive(Debug, Clone)]
pub struct PlannedReply {
    pub bot_identity: String,
    pub text: String,
    pub kind: ReplyKind,
    /// The incoming message this reply references (and replies to).
    pub reference_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_window_rejects_inverted_bounds() {
        assert!(DelayWindow::new(10.0, 5.0).is_err());
        assert!(DelayWindow::new(-1.0, 5.0).is_err());
        assert!(DelayWindow::new(5.0, 5.0).is_ok());
    }

    #[test]
    fn delay_window_sample_stays_in_bounds() {
        let window = DelayWindow::new(0.5, 2.0).unwrap();
        for _ in 0..50 {
            let d = window.sample().as_secs_f64();
            assert!((0.5..2.0).contains(&d), "sample {} out of bounds", d);
        }
        // Degenerate window always returns min
        let fixed = DelayWindow::new(1.5, 1.5).unwrap();
        assert_eq!(fixed.sample(), Duration::from_secs_f64(1.5));
    }

    #[test]
    fn roster_lookups() {
        let roster = Roster::new(vec![
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
        .unwrap();

        assert_eq!(roster.len(), 2);
        assert!(roster.contains("100"));
        assert!(!roster.contains("300"));
        assert_eq!(roster.get("200").unwrap().name, "beta");
        assert_eq!(roster.primary().name, "alpha");
        assert_eq!(roster.by_index(1).unwrap().identity, "200");
        assert!(roster.by_index(2).is_none());
    }
}
