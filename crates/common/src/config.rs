use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProbeConfig {
    pub start_delay_ms: u64,
    pub step_delay_ms: u64,
    pub deadline_ms: u64,
    pub kill_grace_ms: u64,
    pub max_line_bytes: usize,
    pub protocol_version: String,
    pub client_name: String,
    pub client_version: String,
    pub discover_resources: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            start_delay_ms: 100,
            step_delay_ms: 100,
            deadline_ms: 3000,
            kill_grace_ms: 2000,
            max_line_bytes: 8 * 1024 * 1024,
            protocol_version: "2024-11-05".to_string(),
            client_name: "mcp-probe".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            discover_resources: false,
        }
    }
}

impl ProbeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed reading config file: {}", path.display()))?;
            toml::from_str::<Self>(&raw)
                .with_context(|| format!("failed parsing config file: {}", path.display()))?
        } else {
            Self::default()
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_u64("MCP_PROBE_START_DELAY_MS") {
            self.start_delay_ms = v;
        }
        if let Some(v) = env_u64("MCP_PROBE_STEP_DELAY_MS") {
            self.step_delay_ms = v;
        }
        if let Some(v) = env_u64("MCP_PROBE_DEADLINE_MS") {
            self.deadline_ms = v;
        }
        if let Some(v) = env_u64("MCP_PROBE_KILL_GRACE_MS") {
            self.kill_grace_ms = v;
        }
        if let Ok(raw) = std::env::var("MCP_PROBE_MAX_LINE_BYTES") {
            self.max_line_bytes = raw.trim().parse().unwrap_or(self.max_line_bytes);
        }
        if let Ok(version) = std::env::var("MCP_PROBE_PROTOCOL_VERSION") {
            if !version.trim().is_empty() {
                self.protocol_version = version;
            }
        }
        if let Ok(raw) = std::env::var("MCP_PROBE_DISCOVER_RESOURCES") {
            self.discover_resources = raw.eq_ignore_ascii_case("true") || raw == "1";
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.deadline_ms == 0 {
            anyhow::bail!("deadline_ms must be greater than zero");
        }
        if self.max_line_bytes == 0 {
            anyhow::bail!("max_line_bytes must be greater than zero");
        }
        if self.start_delay_ms >= self.deadline_ms {
            tracing::warn!(
                start_delay_ms = self.start_delay_ms,
                deadline_ms = self.deadline_ms,
                "start delay reaches the deadline, no step will be sent"
            );
        }
        Ok(())
    }

    pub const fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub const fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }

    pub const fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub const fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use super::ProbeConfig;

    #[test]
    fn loads_default_when_file_missing() {
        let cfg =
            ProbeConfig::load(PathBuf::from("does-not-exist.toml").as_path()).expect("config");
        assert_eq!(cfg.start_delay_ms, ProbeConfig::default().start_delay_ms);
        assert_eq!(cfg.protocol_version, "2024-11-05");
    }

    #[test]
    fn loads_partial_toml_file() {
        let mut path = std::env::temp_dir();
        path.push(format!("mcp-probe-config-test-{}.toml", std::process::id()));
        fs::write(
            &path,
            "kill_grace_ms = 750\nclient_name = 'probe-test'\ndiscover_resources = true\n",
        )
        .expect("write");

        let cfg = ProbeConfig::load(path.as_path()).expect("config");
        assert_eq!(cfg.kill_grace_ms, 750);
        assert_eq!(cfg.client_name, "probe-test");
        assert!(cfg.discover_resources);
        assert_eq!(cfg.max_line_bytes, 8 * 1024 * 1024);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rejects_malformed_toml() {
        let mut path = std::env::temp_dir();
        path.push(format!("mcp-probe-config-bad-{}.toml", std::process::id()));
        fs::write(&path, "kill_grace_ms = 'soon'\n").expect("write");

        let err = ProbeConfig::load(path.as_path()).expect_err("expected parse failure");
        assert!(err.to_string().contains("failed parsing config file"));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn zero_deadline_is_invalid() {
        let cfg = ProbeConfig {
            deadline_ms: 0,
            ..ProbeConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
