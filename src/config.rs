use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Crate-wide settings, loaded from `LABDOCK_*` environment variables with
/// working defaults for a single-host deployment. `.env` loading is the
/// binary's job (dotenvy), not the library's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Explicit Docker socket path. `None` uses the platform default.
    pub docker_socket: Option<String>,
    /// Docker network to attach lab containers to, if any.
    pub network: Option<String>,
    /// Registry prefix for lab images, e.g. `labdock/vscode-python:latest`.
    pub image_prefix: String,
    pub image_tag: String,
    /// Root under which per-student per-course home directories live.
    pub storage_root: String,
    /// Hostname used when deriving browser-facing IDE URLs.
    pub external_host: String,
    /// First external port; each IDE service probes upward from its own
    /// offset within this range.
    pub port_range_start: u16,
    /// How many ports above a service's base get probed before the
    /// allocation counts as exhausted.
    pub port_probe_limit: u16,
    /// Upper bound on any single container or storage engine call.
    pub engine_timeout_secs: u64,
    /// Grace period handed to the engine when stopping a container.
    pub stop_timeout_secs: i64,
    /// Labs idle longer than this are reclaimed.
    pub max_idle_hours: i64,
    /// How often the idle reaper wakes up.
    pub reap_interval_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            docker_socket: None,
            network: None,
            image_prefix: "labdock".to_string(),
            image_tag: "latest".to_string(),
            storage_root: "/var/lib/labdock/volumes".to_string(),
            external_host: "localhost".to_string(),
            port_range_start: 30000,
            port_probe_limit: 100,
            engine_timeout_secs: 60,
            stop_timeout_secs: 10,
            max_idle_hours: 24,
            reap_interval_secs: 900,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            docker_socket: std::env::var("LABDOCK_DOCKER_SOCKET").ok(),
            network: std::env::var("LABDOCK_NETWORK").ok(),
            image_prefix: std::env::var("LABDOCK_IMAGE_PREFIX")
                .unwrap_or_else(|_| defaults.image_prefix.clone()),
            image_tag: std::env::var("LABDOCK_IMAGE_TAG")
                .unwrap_or_else(|_| defaults.image_tag.clone()),
            storage_root: std::env::var("LABDOCK_STORAGE_ROOT")
                .unwrap_or_else(|_| defaults.storage_root.clone()),
            external_host: std::env::var("LABDOCK_EXTERNAL_HOST")
                .unwrap_or_else(|_| defaults.external_host.clone()),
            port_range_start: std::env::var("LABDOCK_PORT_RANGE_START")
                .unwrap_or_else(|_| defaults.port_range_start.to_string())
                .parse()
                .unwrap_or(defaults.port_range_start),
            port_probe_limit: std::env::var("LABDOCK_PORT_PROBE_LIMIT")
                .unwrap_or_else(|_| defaults.port_probe_limit.to_string())
                .parse()
                .unwrap_or(defaults.port_probe_limit),
            engine_timeout_secs: std::env::var("LABDOCK_ENGINE_TIMEOUT_SECS")
                .unwrap_or_else(|_| defaults.engine_timeout_secs.to_string())
                .parse()
                .unwrap_or(defaults.engine_timeout_secs),
            stop_timeout_secs: std::env::var("LABDOCK_STOP_TIMEOUT_SECS")
                .unwrap_or_else(|_| defaults.stop_timeout_secs.to_string())
                .parse()
                .unwrap_or(defaults.stop_timeout_secs),
            max_idle_hours: std::env::var("LABDOCK_MAX_IDLE_HOURS")
                .unwrap_or_else(|_| defaults.max_idle_hours.to_string())
                .parse()
                .unwrap_or(defaults.max_idle_hours),
            reap_interval_secs: std::env::var("LABDOCK_REAP_INTERVAL_SECS")
                .unwrap_or_else(|_| defaults.reap_interval_secs.to_string())
                .parse()
                .unwrap_or(defaults.reap_interval_secs),
        }
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.port_range_start, 30000);
        assert_eq!(config.max_idle_hours, 24);
        assert_eq!(config.external_host, "localhost");
        assert_eq!(config.storage_root, "/var/lib/labdock/volumes");
        assert!(config.engine_timeout() >= Duration::from_secs(1));
    }
}
