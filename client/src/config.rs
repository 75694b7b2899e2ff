use crate::{Error, Result};
use std::time::Duration;
use url::Url;

/// Connection and timing settings for a session controller.
#[derive(Clone, Debug)]
pub struct Config {
    /// Event channel endpoint (`ws://` or `wss://`).
    pub server_url: Url,
    /// How long a request waits for its acknowledgement.
    pub ack_timeout: Duration,
    /// Pause between reconnection attempts.
    pub reconnect_delay: Duration,
    /// How long to wait for a win before reporting a loss.
    pub outcome_timeout: Duration,
    /// Countdown decrement period.
    pub countdown_period: Duration,
    /// Capacity of the inbound event channel.
    pub event_capacity: usize,
}

impl Config {
    pub fn new(server_url: &str) -> Result<Self> {
        Ok(Self {
            server_url: channel_url(server_url)?,
            ack_timeout: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(2),
            outcome_timeout: Duration::from_secs(6),
            countdown_period: Duration::from_secs(1),
            event_capacity: 1024,
        })
    }

    /// Read `CLAW_*` overrides on top of the defaults.
    pub fn from_env(server_url: &str) -> Result<Self> {
        let url = std::env::var("CLAW_SERVER_URL").unwrap_or_else(|_| server_url.to_string());
        let defaults = Self::new(&url)?;
        Ok(Self {
            ack_timeout: read_ms("CLAW_ACK_TIMEOUT_MS", defaults.ack_timeout),
            reconnect_delay: read_ms("CLAW_RECONNECT_DELAY_MS", defaults.reconnect_delay),
            outcome_timeout: read_ms("CLAW_OUTCOME_TIMEOUT_MS", defaults.outcome_timeout),
            event_capacity: read_usize("CLAW_EVENT_CAPACITY", defaults.event_capacity),
            ..defaults
        })
    }

    pub fn with_outcome_timeout(mut self, timeout: Duration) -> Self {
        self.outcome_timeout = timeout;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

/// Parse a channel URL, mapping `http(s)` to `ws(s)`.
fn channel_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw)?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => return Err(Error::InvalidScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::InvalidScheme(url.scheme().to_string()))?;
    Ok(url)
}

fn read_ms(key: &str, fallback: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(fallback)
}

fn read_usize(key: &str, fallback: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<usize>().ok())
        .unwrap_or(fallback)
}
