/*!
Bridge policy configuration.

Defaults match the desktop app's historical constants. A YAML file may
override any subset of fields; `COREBRIDGE_*` environment variables win over
the file.
*/
use serde::{Deserialize, Serialize};
use std::env as std_env;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// How long a bridged request waits for the UI reply.
    pub bridge_timeout_secs: u64,
    /// Cap on catch-all request bodies.
    pub max_body_bytes: u64,
    /// Upload limit when the server options carry none.
    pub default_max_upload_bytes: u64,
    /// Outbound call timeout when the caller passes none.
    pub request_timeout_secs: u64,
    pub progress_threshold_bytes: u64,
    pub kill_poll_initial_ms: u64,
    pub kill_poll_ceiling_ms: u64,
    /// Read timeout while receiving request headers/body on bridge connections.
    pub header_read_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            bridge_timeout_secs: 60,
            max_body_bytes: 20 * 1024 * 1024,
            default_max_upload_bytes: 50 * 1024 * 1024,
            request_timeout_secs: 15,
            progress_threshold_bytes: 128 * 1024,
            kill_poll_initial_ms: 10,
            kill_poll_ceiling_ms: 1000,
            header_read_timeout_secs: 30,
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std_env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|&v| v > 0)
}

impl BridgeConfig {
    /// Load from `path` when it exists (a missing file is not an error), then apply env overrides.
    pub fn load(path: Option<&Path>) -> io::Result<Self> {
        let mut cfg = match path {
            Some(p) if p.exists() => {
                let text = fs::read_to_string(p)?;
                Self::from_yaml(&text)?
            }
            _ => BridgeConfig::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    pub fn from_yaml(text: &str) -> io::Result<Self> {
        if text.trim().is_empty() {
            return Ok(BridgeConfig::default());
        }
        serde_yaml::from_str(text)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("invalid config: {e}")))
    }

    pub fn apply_env(&mut self) {
        if let Some(v) = env_u64("COREBRIDGE_BRIDGE_TIMEOUT_SECS") {
            self.bridge_timeout_secs = v;
        }
        if let Some(v) = env_u64("COREBRIDGE_MAX_BODY_BYTES") {
            self.max_body_bytes = v;
        }
        if let Some(v) = env_u64("COREBRIDGE_MAX_UPLOAD_BYTES") {
            self.default_max_upload_bytes = v;
        }
        if let Some(v) = env_u64("COREBRIDGE_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = v;
        }
        if let Some(v) = env_u64("COREBRIDGE_PROGRESS_THRESHOLD_BYTES") {
            self.progress_threshold_bytes = v;
        }
    }

    pub fn bridge_timeout(&self) -> Duration {
        Duration::from_secs(self.bridge_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn header_read_timeout(&self) -> Duration {
        Duration::from_secs(self.header_read_timeout_secs)
    }

    pub fn kill_poll_initial(&self) -> Duration {
        Duration::from_millis(self.kill_poll_initial_ms)
    }

    pub fn kill_poll_ceiling(&self) -> Duration {
        Duration::from_millis(self.kill_poll_ceiling_ms)
    }
}
