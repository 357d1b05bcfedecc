use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointConfig {
    pub name: String,
    pub listen: ListenConfig,
    pub remote: RemoteConfig,
    pub timeouts: TimeoutConfig,
    pub read_buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// How long one accept wait lasts before the loop re-checks shutdown.
    pub accept_timeout_ms: u64,
    /// Upper bound for a single blocking write to a slow peer.
    pub write_timeout_ms: u64,
    /// Handler sleep when an iteration did no read or write work.
    pub idle_sleep_micros: u64,
    /// Pause on either side of the final best-effort queue flush.
    pub drain_pause_ms: u64,
}

impl EndpointConfig {
    pub fn new(
        name: impl Into<String>,
        bind_host: impl Into<String>,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            listen: ListenConfig {
                host: bind_host.into(),
                port: local_port,
            },
            remote: RemoteConfig {
                host: remote_host.into(),
                port: remote_port,
            },
            timeouts: TimeoutConfig::default(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl TimeoutConfig {
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_micros(self.idle_sleep_micros)
    }

    pub fn drain_pause(&self) -> Duration {
        Duration::from_millis(self.drain_pause_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            accept_timeout_ms: 3_000,
            write_timeout_ms: 3_000,
            idle_sleep_micros: 1_000,
            drain_pause_ms: 100,
        }
    }
}

fn default_read_buffer_size() -> usize {
    0xFFFF
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self::new("proxy", "0.0.0.0", 8080, "127.0.0.1", 8080)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{EndpointConfig, TimeoutConfig};

    #[test]
    fn default_timeouts_match_engine_constants() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.accept_timeout(), Duration::from_secs(3));
        assert_eq!(timeouts.write_timeout(), Duration::from_secs(3));
        assert_eq!(timeouts.idle_sleep(), Duration::from_millis(1));
        assert_eq!(timeouts.drain_pause(), Duration::from_millis(100));
    }

    #[test]
    fn new_fills_defaults() {
        let config = EndpointConfig::new("tap", "127.0.0.1", 4000, "example.com", 4001);
        assert_eq!(config.name, "tap");
        assert_eq!(config.listen.port, 4000);
        assert_eq!(config.remote.host, "example.com");
        assert_eq!(config.read_buffer_size, 0xFFFF);
        assert_eq!(config.timeouts, TimeoutConfig::default());
    }
}
