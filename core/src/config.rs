// Link and endpoint configuration (defaults read from the environment)
use std::time::Duration;

use tracing::warn;

use crate::address::Address;

pub const DEFAULT_PING_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_PING_THRESHOLD: u32 = 5;
pub const DEFAULT_MAX_HELD: usize = 1_024;
pub const DEFAULT_REGISTRATION_TIMEOUT_MS: u64 = 10_000;

/// Ping/pong heartbeat settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Time between pings; zero disables the heartbeat.
    pub interval: Duration,
    /// Unanswered pings tolerated before the link is torn down.
    pub threshold: u32,
}

impl LivenessConfig {
    pub fn new(interval: Duration, threshold: u32) -> Self {
        Self {
            interval,
            threshold,
        }
    }

    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, DEFAULT_PING_THRESHOLD)
    }

    pub fn enabled(&self) -> bool {
        !self.interval.is_zero()
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(env_parse(
                "ARBOR_PING_INTERVAL_MS",
                DEFAULT_PING_INTERVAL_MS,
            )),
            threshold: env_parse("ARBOR_PING_THRESHOLD", DEFAULT_PING_THRESHOLD),
        }
    }
}

/// Settings shared by connectors and accepted connections.
#[derive(Clone, Debug)]
pub struct LinkConfig {
    pub liveness: LivenessConfig,
    /// Static allow-list seeding the link's restrictions.
    pub allow: Vec<Address>,
    /// Outbound events a connector holds while waiting for registration.
    pub max_held: usize,
    /// Advertised to the peer in the `register` announcement.
    pub session_expire: Option<Duration>,
    /// How long a transport driver waits for `register` before giving up.
    pub registration_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            liveness: LivenessConfig::default(),
            allow: env_addresses("ARBOR_ALLOW"),
            max_held: env_parse("ARBOR_MAX_HELD", DEFAULT_MAX_HELD),
            session_expire: std::env::var("ARBOR_SESSION_EXPIRE_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis),
            registration_timeout: Duration::from_millis(env_parse(
                "ARBOR_REGISTRATION_TIMEOUT_MS",
                DEFAULT_REGISTRATION_TIMEOUT_MS,
            )),
        }
    }
}

impl LinkConfig {
    pub fn with_liveness(mut self, liveness: LivenessConfig) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn with_allow(mut self, allow: Vec<Address>) -> Self {
        self.allow = allow;
        self
    }
}

/// Settings for a node accepting inbound links.
#[derive(Clone, Debug, Default)]
pub struct EndpointConfig {
    /// Endpoint-wide allow-list, cloned into every accepted connection.
    pub allow: Vec<Address>,
    /// Settings for the connections the endpoint spawns.
    pub link: LinkConfig,
}

impl EndpointConfig {
    pub fn new(allow: Vec<Address>, link: LinkConfig) -> Self {
        Self { allow, link }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key = key, value = %raw, "Unparseable value; using default");
            default
        }),
        Err(_) => default,
    }
}

/// Comma separated key-form addresses, e.g. `root/public,root/svc`.
fn env_addresses(key: &str) -> Vec<Address> {
    let Ok(raw) = std::env::var(key) else {
        return Vec::new();
    };
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|s| match s.parse::<Address>() {
            Ok(a) => Some(a),
            Err(e) => {
                warn!(key = key, entry = %s, error = %e, "Skipping invalid address");
                None
            }
        })
        .collect()
}
