//! Proxy configuration.
//!
//! Everything comes from `PIPER_*` environment variables. Timeouts are given
//! in milliseconds; `0` disables the corresponding deadline.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::events::{DEFAULT_EVENT_BUFFER, MIN_EVENT_BUFFER};
use crate::proxy::{
    ListenerConfig, RelayOptions, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_RESOLVE_TIMEOUT,
};

/// Default listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Default backend port.
pub const DEFAULT_TARGET_PORT: u16 = 8090;

/// Proxy configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the TLS listener binds to.
    pub listen_addr: SocketAddr,

    /// PEM certificate chain.
    pub cert_path: PathBuf,

    /// PEM private key.
    pub key_path: PathBuf,

    /// Directory service queried for the backend host on every connection.
    pub directory_url: String,

    /// Port dialed on the resolved backend host.
    pub target_port: u16,

    /// Deadline for a directory lookup.
    pub resolve_timeout: Option<Duration>,

    /// Deadline for dialing the backend.
    pub connect_timeout: Option<Duration>,

    /// Deadline for the client TLS handshake.
    pub handshake_timeout: Option<Duration>,

    /// Per-direction idle timeout while relaying.
    pub idle_timeout: Option<Duration>,

    /// Capacity of the lifecycle event buffer.
    pub event_buffer: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = lookup("PIPER_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse::<SocketAddr>()
            .context("PIPER_LISTEN_ADDR must be a socket address (example: 0.0.0.0:8080).")?;

        let cert_path = lookup("PIPER_TLS_CERT")
            .map(PathBuf::from)
            .context("Missing certificate. Set PIPER_TLS_CERT to a PEM certificate chain.")?;

        let key_path = lookup("PIPER_TLS_KEY")
            .map(PathBuf::from)
            .context("Missing private key. Set PIPER_TLS_KEY to a PEM private key.")?;

        let directory_url = lookup("PIPER_DIRECTORY_URL")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .context("Missing directory service. Set PIPER_DIRECTORY_URL.")?;
        if !directory_url.starts_with("http://") && !directory_url.starts_with("https://") {
            anyhow::bail!("PIPER_DIRECTORY_URL must be an http:// or https:// URL.");
        }

        let target_port = lookup("PIPER_TARGET_PORT")
            .map(|v| v.trim().parse::<u16>())
            .transpose()
            .context("PIPER_TARGET_PORT must be a port number.")?
            .unwrap_or(DEFAULT_TARGET_PORT);
        if target_port == 0 {
            anyhow::bail!("PIPER_TARGET_PORT must not be 0.");
        }

        let resolve_timeout = timeout_ms(
            &lookup,
            "PIPER_RESOLVE_TIMEOUT_MS",
            Some(DEFAULT_RESOLVE_TIMEOUT),
        )?;
        let connect_timeout = timeout_ms(
            &lookup,
            "PIPER_CONNECT_TIMEOUT_MS",
            Some(DEFAULT_CONNECT_TIMEOUT),
        )?;
        let handshake_timeout = timeout_ms(
            &lookup,
            "PIPER_HANDSHAKE_TIMEOUT_MS",
            Some(DEFAULT_HANDSHAKE_TIMEOUT),
        )?;
        let idle_timeout = timeout_ms(&lookup, "PIPER_IDLE_TIMEOUT_MS", None)?;

        let event_buffer = lookup("PIPER_EVENT_BUFFER")
            .map(|v| v.trim().parse::<usize>())
            .transpose()
            .context("PIPER_EVENT_BUFFER must be an integer.")?
            .unwrap_or(DEFAULT_EVENT_BUFFER)
            .max(MIN_EVENT_BUFFER);

        let log_level = lookup("PIPER_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            cert_path,
            key_path,
            directory_url,
            target_port,
            resolve_timeout,
            connect_timeout,
            handshake_timeout,
            idle_timeout,
            event_buffer,
            log_level,
        })
    }

    /// Listener settings derived from this configuration.
    pub fn listener_config(&self) -> ListenerConfig {
        let mut config = ListenerConfig::new(self.listen_addr);
        config.handshake_timeout = self.handshake_timeout;
        config.connect_timeout = self.connect_timeout;
        config.relay = RelayOptions {
            idle_timeout: self.idle_timeout,
            ..RelayOptions::default()
        };
        config
    }
}

fn timeout_ms<F>(lookup: &F, key: &str, default: Option<Duration>) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };

    let ms: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{key} must be an integer (milliseconds)."))?;

    Ok((ms > 0).then(|| Duration::from_millis(ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn required() -> Vec<(&'static str, &'static str)> {
        vec![
            ("PIPER_TLS_CERT", "/etc/piper/tls.crt.pem"),
            ("PIPER_TLS_KEY", "/etc/piper/tls.key.pem"),
            ("PIPER_DIRECTORY_URL", "https://directory.example/ip"),
        ]
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup_from(&required())).unwrap();
        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR.parse().unwrap());
        assert_eq!(config.target_port, DEFAULT_TARGET_PORT);
        assert_eq!(config.resolve_timeout, Some(DEFAULT_RESOLVE_TIMEOUT));
        assert_eq!(config.connect_timeout, Some(DEFAULT_CONNECT_TIMEOUT));
        assert_eq!(config.handshake_timeout, Some(DEFAULT_HANDSHAKE_TIMEOUT));
        assert!(config.idle_timeout.is_none());
        assert_eq!(config.event_buffer, DEFAULT_EVENT_BUFFER);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_overrides_and_zero_disables_timeouts() {
        let mut pairs = required();
        pairs.extend([
            ("PIPER_LISTEN_ADDR", "127.0.0.1:9443"),
            ("PIPER_TARGET_PORT", "9090"),
            ("PIPER_RESOLVE_TIMEOUT_MS", "0"),
            ("PIPER_CONNECT_TIMEOUT_MS", "250"),
            ("PIPER_IDLE_TIMEOUT_MS", "60000"),
            ("PIPER_EVENT_BUFFER", "1"),
        ]);
        let config = Config::from_lookup(lookup_from(&pairs)).unwrap();

        assert_eq!(config.listen_addr.port(), 9443);
        assert_eq!(config.target_port, 9090);
        assert!(config.resolve_timeout.is_none());
        assert_eq!(config.connect_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.event_buffer, MIN_EVENT_BUFFER);

        let listener = config.listener_config();
        assert_eq!(listener.bind_addr.port(), 9443);
        assert_eq!(listener.connect_timeout, Some(Duration::from_millis(250)));
        assert_eq!(listener.relay.idle_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_missing_required_values() {
        for missing in ["PIPER_TLS_CERT", "PIPER_TLS_KEY", "PIPER_DIRECTORY_URL"] {
            let pairs: Vec<_> = required().into_iter().filter(|(k, _)| *k != missing).collect();
            let err = Config::from_lookup(lookup_from(&pairs)).unwrap_err();
            assert!(err.to_string().contains(missing), "{missing}: {err}");
        }
    }

    #[test]
    fn test_invalid_values() {
        for (key, value) in [
            ("PIPER_LISTEN_ADDR", "not-an-addr"),
            ("PIPER_TARGET_PORT", "70000"),
            ("PIPER_TARGET_PORT", "0"),
            ("PIPER_CONNECT_TIMEOUT_MS", "soon"),
            ("PIPER_DIRECTORY_URL", "ftp://directory.example"),
        ] {
            let mut pairs: Vec<_> = required().into_iter().filter(|(k, _)| *k != key).collect();
            pairs.push((key, value));
            assert!(
                Config::from_lookup(lookup_from(&pairs)).is_err(),
                "{key}={value} should be rejected"
            );
        }
    }
}
