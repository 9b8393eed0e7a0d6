use std::fs;
use std::path::Path;
use std::time::Duration;

use arbor_core::{Address, LinkConfig, LivenessConfig};

/// Settings for the echo node demo
#[derive(Clone, Debug)]
pub struct EchoNodeConfig {
    /// Bridge server to join
    pub server_addr: String,
    /// Server-side node sent an `echo` once registered
    pub echo_target: Address,
    /// Period of the `tick` notifications published under `ticks`
    pub tick_interval: Duration,
    pub link: LinkConfig,
}

impl Default for EchoNodeConfig {
    fn default() -> Self {
        Self {
            server_addr: std::env::var("ARBOR_BRIDGE_ADDR")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "127.0.0.1:7300".to_string()),
            echo_target: std::env::var("ECHO_TARGET")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_echo_target),
            tick_interval: Duration::from_millis(
                std::env::var("ECHO_TICK_INTERVAL_MS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(5_000),
            ),
            link: LinkConfig::default(),
        }
    }
}

fn default_echo_target() -> Address {
    Address::new(["root", "services"]).unwrap_or_default()
}

impl EchoNodeConfig {
    /// Load configuration from a TOML file (path via ECHO_NODE_CONFIG or ./echo_node.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path = std::env::var("ECHO_NODE_CONFIG").unwrap_or_else(|_| "echo_node.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target = "echo_node", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => Self::from_toml_str(&s, default),
            Err(e) => {
                tracing::warn!(target = "echo_node", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    fn from_toml_str(s: &str, default: Self) -> Self {
        match toml::from_str::<EchoNodeToml>(s) {
            Ok(t) => t.overlay(default),
            Err(e) => {
                tracing::warn!(target = "echo_node", error = %e, "Failed to parse TOML; using defaults");
                default
            }
        }
    }
}

// TOML overlay

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct EchoNodeToml {
    pub server_addr: Option<String>,
    pub echo_target: Option<String>,
    pub tick_interval_ms: Option<u64>,
    pub link: Option<LinkToml>,
}

impl EchoNodeToml {
    fn overlay(self, mut base: EchoNodeConfig) -> EchoNodeConfig {
        if let Some(x) = self.server_addr {
            base.server_addr = x;
        }
        if let Some(x) = self.echo_target {
            match x.parse() {
                Ok(address) => base.echo_target = address,
                Err(e) => tracing::warn!(target = "echo_node", error = %e, "Ignoring echo_target"),
            }
        }
        if let Some(x) = self.tick_interval_ms {
            base.tick_interval = Duration::from_millis(x.max(1));
        }
        if let Some(l) = self.link {
            l.apply(&mut base.link);
        }
        base
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct LinkToml {
    pub ping_interval_ms: Option<u64>,
    pub ping_threshold: Option<u32>,
    pub max_held: Option<usize>,
    pub registration_timeout_ms: Option<u64>,
    pub session_expire_ms: Option<u64>,
    pub allow: Option<Vec<String>>,
}

impl LinkToml {
    fn apply(self, l: &mut LinkConfig) {
        if let Some(x) = self.ping_interval_ms {
            l.liveness = LivenessConfig::new(Duration::from_millis(x), l.liveness.threshold);
        }
        if let Some(x) = self.ping_threshold {
            l.liveness.threshold = x;
        }
        if let Some(x) = self.max_held {
            l.max_held = x;
        }
        if let Some(x) = self.registration_timeout_ms {
            l.registration_timeout = Duration::from_millis(x);
        }
        if let Some(x) = self.session_expire_ms {
            l.session_expire = Some(Duration::from_millis(x));
        }
        if let Some(x) = self.allow {
            l.allow = x.iter().filter_map(|s| s.parse().ok()).collect();
        }
    }
}
