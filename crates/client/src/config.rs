//! Client configuration from environment variables.

/// A single STUN/TURN entry for peer-connection setup.
#[derive(Debug, Clone, PartialEq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Configuration for auto-reconnect behavior of the broadcasting connection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnect attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u32,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u32,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 1.5,
        }
    }
}

impl ReconnectConfig {
    /// Calculate delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> u32 {
        let delay = self.initial_delay_ms as f32 * self.backoff_multiplier.powi(attempt as i32);
        (delay as u32).min(self.max_delay_ms)
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL for REST requests, e.g. `http://localhost:8000`.
    pub api_base: String,
    /// WebSocket endpoint of the broadcasting service.
    pub ws_url: String,
    /// ICE servers handed to every peer connection.
    pub ice_servers: Vec<IceServerConfig>,
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8000".to_string(),
            ws_url: "ws://localhost:8000/ws".to_string(),
            ice_servers: default_ice_servers(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig::stun("stun:stun.l.google.com:19302"),
        IceServerConfig::stun("stun:stun1.l.google.com:19302"),
    ]
}

impl ClientConfig {
    /// Build a configuration from environment variables, falling back to
    /// local-development defaults.
    ///
    /// - `PARLOR_API_BASE`: REST base URL
    /// - `PARLOR_WS_URL`: broadcasting WebSocket URL
    /// - `PARLOR_STUN_SERVERS`: comma-separated STUN URLs
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(base) = std::env::var("PARLOR_API_BASE") {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        if let Ok(url) = std::env::var("PARLOR_WS_URL") {
            config.ws_url = url;
        }
        if let Ok(servers) = std::env::var("PARLOR_STUN_SERVERS") {
            let parsed: Vec<_> = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(IceServerConfig::stun)
                .collect();
            if !parsed.is_empty() {
                config.ice_servers = parsed;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_is_capped() {
        let config = ReconnectConfig::default();
        assert_eq!(config.delay_for_attempt(0), 1000);
        assert_eq!(config.delay_for_attempt(1), 1500);
        assert!(config.delay_for_attempt(20) <= config.max_delay_ms);
    }

    #[test]
    fn default_ice_configuration_has_two_servers() {
        let config = ClientConfig::default();
        assert_eq!(config.ice_servers.len(), 2);
    }
}
