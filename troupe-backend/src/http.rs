//! Shared HTTP client for all platform calls.

use once_cell::sync::Lazy;
use std::time::Duration;

static SHARED_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Get the shared reqwest client. Reusing one client keeps connection
/// pooling effective across the poller, dispatcher, and playback sends.
pub fn shared_client() -> &'static reqwest::Client {
    &SHARED_CLIENT
}
