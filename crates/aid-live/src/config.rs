use aid_core::event_wire::DEFAULT_MAX_FRAME_BYTES;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const DEFAULT_DEDUP_WINDOW: usize = 20;
pub const DEFAULT_REFRESH_DEBOUNCE_MS: u64 = 1000;
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;

/// Capped exponential backoff for channel reconnects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-indexed): `base * 2^attempt`, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[derive(Clone, Debug)]
pub struct LiveConfig {
    pub api_base_url: String,
    pub reconnect: ReconnectPolicy,
    pub refresh_debounce: Duration,
    pub dedup_window: usize,
    pub event_queue_capacity: usize,
    pub max_frame_bytes: usize,
    pub request_timeout: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            reconnect: ReconnectPolicy::default(),
            refresh_debounce: Duration::from_millis(DEFAULT_REFRESH_DEBOUNCE_MS),
            dedup_window: DEFAULT_DEDUP_WINDOW,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl LiveConfig {
    /// Defaults overlaid with `AID_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let api_base_url = lookup("AID_API_URL")
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or(defaults.api_base_url);
        let reconnect = ReconnectPolicy {
            base_delay: Duration::from_millis(resolve_number(
                &lookup,
                "AID_RECONNECT_BASE_MS",
                defaults.reconnect.base_delay.as_millis() as u64,
            )),
            max_delay: Duration::from_millis(resolve_number(
                &lookup,
                "AID_RECONNECT_MAX_MS",
                defaults.reconnect.max_delay.as_millis() as u64,
            )),
            max_attempts: resolve_number(
                &lookup,
                "AID_RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect.max_attempts,
            ),
        };
        let refresh_debounce = Duration::from_millis(resolve_number(
            &lookup,
            "AID_REFRESH_DEBOUNCE_MS",
            DEFAULT_REFRESH_DEBOUNCE_MS,
        ));
        let dedup_window = resolve_number(&lookup, "AID_DEDUP_WINDOW", defaults.dedup_window);
        let request_timeout = Duration::from_secs(resolve_number(
            &lookup,
            "AID_REQUEST_TIMEOUT_SECS",
            defaults.request_timeout.as_secs(),
        ));

        Self {
            api_base_url,
            reconnect,
            refresh_debounce,
            dedup_window,
            request_timeout,
            ..defaults
        }
    }
}

fn resolve_number<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + Copy,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    if raw.trim().is_empty() {
        return default;
    }
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            warn!(event = "config_invalid_value", key, value = %raw);
            default
        }
    }
}
