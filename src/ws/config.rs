use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ResilienceError, Result};
use crate::ws::state::ReconnectStrategy;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WebSocketManagerConfig {
    pub url: String,
    pub subprotocols: Vec<String>,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub connection_timeout: Duration,
    pub reconnect_strategy: ReconnectStrategy,
    pub max_reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub queue_size: usize,
    pub auto_reconnect: bool,
    pub disconnect_check_interval: Duration,
    pub reconnect_check_interval: Duration,
    pub disconnect_margin: Duration,
    pub ssl_verify: bool,
    pub ssl_ca_bundle: Option<PathBuf>,
}

impl WebSocketManagerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            subprotocols: Vec::new(),
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(30),
            reconnect_strategy: ReconnectStrategy::default(),
            max_reconnect_delay: Duration::from_secs(60),
            max_reconnect_attempts: 10,
            queue_size: 1000,
            auto_reconnect: true,
            disconnect_check_interval: Duration::from_secs(10),
            reconnect_check_interval: Duration::from_secs(5),
            disconnect_margin: Duration::from_secs(300),
            ssl_verify: true,
            ssl_ca_bundle: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(ResilienceError::Configuration("url must not be empty".into()));
        }
        let check = |name: &str, d: Duration, lo: u64, hi: u64| -> Result<()> {
            let s = d.as_secs();
            if s < lo || s > hi {
                return Err(ResilienceError::Configuration(format!(
                    "{name} {s}s out of range [{lo}, {hi}]"
                )));
            }
            Ok(())
        };
        check("ping_interval", self.ping_interval, 5, 60)?;
        check("ping_timeout", self.ping_timeout, 5, 30)?;
        check("connection_timeout", self.connection_timeout, 5, 120)?;
        check("max_reconnect_delay", self.max_reconnect_delay, 1, 600)?;
        check("disconnect_check_interval", self.disconnect_check_interval, 1, 60)?;
        check("disconnect_margin", self.disconnect_margin, 60, 3600)?;
        if self.reconnect_check_interval.as_secs_f64() < 0.5
            || self.reconnect_check_interval.as_secs_f64() > 60.0
        {
            return Err(ResilienceError::Configuration(format!(
                "reconnect_check_interval {:?} out of range [0.5s, 60s]",
                self.reconnect_check_interval
            )));
        }
        if self.max_reconnect_attempts > 100 {
            return Err(ResilienceError::Configuration(
                "max_reconnect_attempts out of range [0, 100]".into(),
            ));
        }
        if self.queue_size > 10_000 {
            return Err(ResilienceError::Configuration(
                "queue_size out of range [0, 10000]".into(),
            ));
        }
        if let Some(bundle) = &self.ssl_ca_bundle {
            validate_ca_bundle(bundle)?;
        }
        Ok(())
    }
}

/// 7-layer validation: non-empty after trim, exists, is a file, is
/// readable, and its content starts with `-----BEGIN` within the first
/// kilobyte.
fn validate_ca_bundle(path: &std::path::Path) -> Result<()> {
    let as_str = path.to_string_lossy();
    if as_str.trim().is_empty() {
        return Err(ResilienceError::Configuration("ssl_ca_bundle path is empty".into()));
    }
    if as_str.contains('\0') {
        return Err(ResilienceError::Configuration(
            "ssl_ca_bundle path contains a null byte".into(),
        ));
    }
    let metadata = std::fs::metadata(path).map_err(|e| {
        ResilienceError::Configuration(format!("ssl_ca_bundle does not exist: {e}"))
    })?;
    if !metadata.is_file() {
        return Err(ResilienceError::Configuration(
            "ssl_ca_bundle is not a regular file".into(),
        ));
    }
    let mut buf = vec![0u8; 1024];
    use std::io::Read;
    let mut file = std::fs::File::open(path).map_err(|e| {
        ResilienceError::Configuration(format!("ssl_ca_bundle is not readable: {e}"))
    })?;
    let n = file
        .read(&mut buf)
        .map_err(|e| ResilienceError::Configuration(format!("ssl_ca_bundle read failed: {e}")))?;
    let head = String::from_utf8_lossy(&buf[..n]);
    if !head.contains("-----BEGIN") {
        return Err(ResilienceError::Configuration(
            "ssl_ca_bundle does not look like a PEM bundle".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = WebSocketManagerConfig::new("wss://example.com/ws");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_url_rejected() {
        let cfg = WebSocketManagerConfig::new("   ");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn out_of_range_ping_interval_rejected() {
        let mut cfg = WebSocketManagerConfig::new("wss://x");
        cfg.ping_interval = Duration::from_secs(1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ca_bundle_must_look_like_pem() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.pem");
        std::fs::write(&bad, b"not a cert").unwrap();
        let mut cfg = WebSocketManagerConfig::new("wss://x");
        cfg.ssl_ca_bundle = Some(bad);
        assert!(cfg.validate().is_err());

        let good = dir.path().join("good.pem");
        std::fs::write(&good, b"-----BEGIN CERTIFICATE-----\nMII...\n").unwrap();
        let mut cfg2 = WebSocketManagerConfig::new("wss://x");
        cfg2.ssl_ca_bundle = Some(good);
        assert!(cfg2.validate().is_ok());
    }
}
