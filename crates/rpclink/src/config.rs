//! Endpoint configuration.
//!
//! All durations are milliseconds, the same unit the handshake negotiates
//! in. Absent or zero means "use the default"; a negative keepalive or
//! reconnect value disables that feature.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_AUTHORIZATION_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(3_000);
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(5_000);
/// Upper bound for the reconnect window.
pub const MAX_RECONNECT_TIMEOUT: Duration = Duration::from_millis(3_600_000);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointOptions {
    /// How long a handshake may take.
    pub authorization_timeout: Option<i64>,
    /// How long a client keeps trying to resume a lost session. Capped at
    /// one hour. The server uses twice this value as its sweep period.
    pub reconnect_timeout: Option<i64>,
    /// Pause between reconnect attempts.
    pub reconnect_interval: Option<i64>,
    /// Unanswered keepalive time after which a transport is dropped.
    pub keepalive_timeout: Option<i64>,
    /// Ping period.
    pub keepalive_interval: Option<i64>,
    /// Server only: whether a new login under an existing name evicts the
    /// old session (default) or is refused.
    pub kick_out: Option<bool>,
}

impl EndpointOptions {
    pub fn from_toml_str(source: &str) -> Result<Self, Error> {
        let mut options: Self = toml::from_str(source).map_err(|e| Error::Config(e.to_string()))?;
        options.reconnect_timeout = options.reconnect_timeout.map(cap_reconnect_timeout);
        Ok(options)
    }

    pub fn with_authorization_timeout(mut self, timeout: Duration) -> Self {
        self.authorization_timeout = Some(millis(timeout));
        self
    }

    pub fn with_reconnect(mut self, timeout: Duration, interval: Duration) -> Self {
        self.reconnect_timeout = Some(cap_reconnect_timeout(millis(timeout)));
        self.reconnect_interval = Some(millis(interval));
        self
    }

    /// Turn off reconnecting: a lost transport closes the client.
    pub fn without_reconnect(mut self) -> Self {
        self.reconnect_timeout = Some(-1);
        self
    }

    pub fn with_keepalive(mut self, timeout: Duration, interval: Duration) -> Self {
        self.keepalive_timeout = Some(millis(timeout));
        self.keepalive_interval = Some(millis(interval));
        self
    }

    /// Turn off keepalive pings.
    pub fn without_keepalive(mut self) -> Self {
        self.keepalive_interval = Some(-1);
        self
    }

    pub fn with_kick_out(mut self, kick_out: bool) -> Self {
        self.kick_out = Some(kick_out);
        self
    }

    pub fn authorization_timeout(&self) -> Duration {
        positive(self.authorization_timeout).unwrap_or(DEFAULT_AUTHORIZATION_TIMEOUT)
    }

    pub fn kick_out(&self) -> bool {
        self.kick_out.unwrap_or(true)
    }

    /// Server sweep period: twice the reconnect window.
    pub fn check_session_interval(&self) -> Duration {
        positive(self.reconnect_timeout).unwrap_or(MAX_RECONNECT_TIMEOUT) * 2
    }
}

/// Keepalive timing of one session. A zero interval disables pings; a zero
/// timeout keeps pinging without ever giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Keepalive {
    /// Resolve the first configured value of each field, in order.
    pub fn resolve(timeout: &[Option<i64>], interval: &[Option<i64>]) -> Self {
        Self {
            timeout: first_configured(timeout, DEFAULT_KEEPALIVE_TIMEOUT),
            interval: first_configured(interval, DEFAULT_KEEPALIVE_INTERVAL),
        }
    }

    /// Unanswered pings that trigger a disconnect, or `None` if pings never
    /// time out.
    pub fn threshold(&self) -> Option<usize> {
        if self.timeout.is_zero() || self.interval.is_zero() {
            return None;
        }
        let ratio = self.timeout.as_millis().div_ceil(self.interval.as_millis());
        Some(usize::try_from(ratio).unwrap_or(usize::MAX).max(1))
    }
}

/// How a client retries after losing its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPlan {
    pub attempts: u32,
    pub interval: Duration,
}

impl ReconnectPlan {
    pub fn resolve(timeout: Option<i64>, interval: Option<i64>) -> Self {
        let interval = positive(interval).unwrap_or(DEFAULT_RECONNECT_INTERVAL);
        let attempts = match timeout {
            Some(ms) if ms < 0 => 0,
            _ => {
                let timeout = positive(timeout).unwrap_or(MAX_RECONNECT_TIMEOUT);
                let ratio = timeout.as_millis().div_ceil(interval.as_millis());
                u32::try_from(ratio).unwrap_or(u32::MAX)
            }
        };
        Self { attempts, interval }
    }
}

fn first_configured(candidates: &[Option<i64>], default: Duration) -> Duration {
    match candidates.iter().flatten().find(|ms| **ms != 0) {
        Some(ms) if *ms < 0 => Duration::ZERO,
        Some(ms) => Duration::from_millis(ms.unsigned_abs()),
        None => default,
    }
}

fn positive(ms: Option<i64>) -> Option<Duration> {
    ms.filter(|ms| *ms > 0).map(|ms| Duration::from_millis(ms.unsigned_abs()))
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn cap_reconnect_timeout(ms: i64) -> i64 {
    ms.min(millis(MAX_RECONNECT_TIMEOUT))
}
