//! Configuration for both processes.
//!
//! The renderer learns its listening port and shared secret from
//! environment variables set by the host at spawn time — environment, not
//! argv, so the token never shows up in process listings. When the host
//! itself has no token configured it generates an ephemeral one per
//! launch.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;

/// Port the renderer listens on by default.
pub const DEFAULT_PORT: u16 = 4777;

/// Environment variable carrying the renderer's listening port.
pub const PORT_ENV: &str = "VITRINE_RENDERER_PORT";
/// Environment variable carrying the shared-secret token.
pub const TOKEN_ENV: &str = "VITRINE_RENDERER_TOKEN";

/// Host-side settings for the session manager and supervisor.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Renderer control port on loopback.
    pub port: u16,
    /// Shared secret; `None` means generate an ephemeral one at launch.
    pub token: Option<String>,
    /// Explicit renderer binary path, overriding the platform search.
    pub renderer_path: Option<PathBuf>,
    /// Budget for attaching to an already-running renderer.
    pub attach_timeout: Duration,
    /// Budget for connecting after spawning a fresh renderer.
    pub launch_connect_timeout: Duration,
    /// Budget for the `handshake` → `handshake_ack` exchange.
    pub handshake_timeout: Duration,
    /// Interval between liveness pings on the control link.
    pub health_interval: Duration,
    /// Budget for a full line write under backpressure.
    pub write_budget: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            token: None,
            renderer_path: None,
            attach_timeout: Duration::from_secs(2),
            launch_connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(2),
            health_interval: Duration::from_secs(5),
            write_budget: Duration::from_secs(2),
        }
    }
}

impl BridgeConfig {
    /// Reads port and token overrides from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(port) = env_port() {
            cfg.port = port;
        }
        cfg.token = env_token();
        cfg
    }

    /// The token to actually use: the configured one, or a fresh random
    /// secret for this launch.
    #[must_use]
    pub fn effective_token(&self) -> String {
        self.token.clone().unwrap_or_else(generate_token)
    }
}

/// Renderer-side settings for the control service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Loopback port to listen on.
    pub port: u16,
    /// Shared secret; when set, every message must carry it.
    pub token: Option<String>,
    /// Connections past this count are refused.
    pub max_connections: usize,
    /// Event-loop poll timeout; also paces the paint pump.
    pub poll_timeout: Duration,
    /// Budget for a full line write under backpressure.
    pub write_budget: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            token: None,
            max_connections: 4,
            poll_timeout: Duration::from_millis(5),
            write_budget: Duration::from_secs(2),
        }
    }
}

impl ServiceConfig {
    /// Reads the spawn environment the host set up.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(port) = env_port() {
            cfg.port = port;
        }
        cfg.token = env_token();
        cfg
    }
}

fn env_port() -> Option<u16> {
    env::var(PORT_ENV).ok()?.parse().ok()
}

fn env_token() -> Option<String> {
    env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty())
}

/// 32 hex characters of process-local randomness.
fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert!(cfg.token.is_none());

        let cfg = ServiceConfig::default();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert!(cfg.max_connections > 0);
    }

    #[test]
    fn generated_tokens_are_unique_hex() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
