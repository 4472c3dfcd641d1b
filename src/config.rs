use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::resolver::FallbackPolicy;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_SETTINGS_MODULE: &str = "config.settings.production";
pub const MANIFEST_FILE: &str = "requirements.txt";

const POLL_INTERVAL_MIN_MS: u64 = 50;
const POLL_INTERVAL_MAX_MS: u64 = 10_000;
const PROBE_TIMEOUT_MIN_MS: u64 = 100;
const PROBE_TIMEOUT_MAX_MS: u64 = 30_000;
const STARTUP_TIMEOUT_MIN_MS: u64 = 100;
const LOG_TAIL_MIN_LINES: usize = 10;
const LOG_TAIL_MAX_LINES: usize = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SupervisorConfig {
    pub host: String,
    pub port: u16,
    /// Bundled server tree copied into `server_dir` before launch.
    pub source_dir: Option<PathBuf>,
    /// Working directory of the server process.
    pub server_dir: PathBuf,
    /// Isolated dependency environment.
    pub env_dir: PathBuf,
    pub manifest: Option<PathBuf>,
    pub entrypoint: String,
    /// Arguments after the entrypoint. The bind address `host:port` is
    /// appended last.
    pub server_args: Vec<String>,
    pub settings_module: String,
    pub framework_module: String,
    pub ready_patterns: Vec<String>,
    pub interpreter: Option<String>,
    pub fallback: FallbackPolicy,
    pub auto_install: bool,
    pub allow_degraded: bool,
    pub detached: bool,
    pub version_probe_timeout_ms: u64,
    pub install_timeout_ms: u64,
    pub startup_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub log_tail_lines: usize,
    pub server_log: Option<PathBuf>,
    pub stage_stamp: String,
    pub preserve: Vec<String>,
    pub extra_env: BTreeMap<String, String>,
    pub os_release: PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            source_dir: None,
            server_dir: PathBuf::from("server"),
            env_dir: PathBuf::from("venv"),
            manifest: None,
            entrypoint: "manage.py".to_string(),
            server_args: vec!["runserver".to_string(), "--noreload".to_string()],
            settings_module: DEFAULT_SETTINGS_MODULE.to_string(),
            framework_module: "django".to_string(),
            ready_patterns: vec![
                "Starting development server".to_string(),
                "Quit the server with".to_string(),
            ],
            interpreter: None,
            fallback: FallbackPolicy::FailFast,
            auto_install: true,
            allow_degraded: true,
            detached: false,
            version_probe_timeout_ms: 5_000,
            install_timeout_ms: 10 * 60 * 1000,
            startup_timeout_ms: 30_000,
            poll_interval_ms: 300,
            probe_timeout_ms: 800,
            stop_grace_ms: 5_000,
            log_tail_lines: 200,
            server_log: None,
            stage_stamp: env!("CARGO_PKG_VERSION").to_string(),
            preserve: vec!["db.sqlite3".to_string(), "media".to_string()],
            extra_env: BTreeMap::new(),
            os_release: PathBuf::from("/etc/os-release"),
        }
    }
}

fn clean_value(raw: Option<String>) -> Option<String> {
    raw.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl SupervisorConfig {
    /// Reads a JSON config file. A missing or unreadable file yields defaults.
    pub fn load(path: &Path) -> Self {
        let raw = match fs::read_to_string(path) {
            Ok(value) => value,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str::<Self>(&raw) {
            Ok(config) => config,
            Err(err) => {
                warn!("ignoring invalid supervisor config {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn apply_env(self) -> Self {
        self.apply_env_from(|key| env::var(key).ok())
    }

    pub fn apply_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(host) = clean_value(lookup("DDT_HOST")) {
            self.host = host;
        }
        if let Some(raw) = clean_value(lookup("DDT_PORT")) {
            match raw.parse::<u16>() {
                Ok(port) if port != 0 => self.port = port,
                _ => warn!("ignoring invalid DDT_PORT={raw}"),
            }
        }
        if let Some(python) = clean_value(lookup("DDT_PYTHON_BIN")) {
            self.interpreter = Some(python);
        }
        if let Some(module) = clean_value(lookup("DDT_SETTINGS_MODULE")) {
            self.settings_module = module;
        }
        if let Some(raw) = clean_value(lookup("DDT_STARTUP_TIMEOUT_MS")) {
            match raw.parse::<u64>() {
                Ok(ms) => self.startup_timeout_ms = ms,
                Err(_) => warn!("ignoring invalid DDT_STARTUP_TIMEOUT_MS={raw}"),
            }
        }
        if let Some(raw) = clean_value(lookup("DDT_DETACHED")) {
            self.detached = matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        self
    }

    pub fn normalized(mut self) -> Self {
        self.poll_interval_ms = self
            .poll_interval_ms
            .clamp(POLL_INTERVAL_MIN_MS, POLL_INTERVAL_MAX_MS);
        self.probe_timeout_ms = self
            .probe_timeout_ms
            .clamp(PROBE_TIMEOUT_MIN_MS, PROBE_TIMEOUT_MAX_MS);
        self.startup_timeout_ms = self.startup_timeout_ms.max(STARTUP_TIMEOUT_MIN_MS);
        self.log_tail_lines = self
            .log_tail_lines
            .clamp(LOG_TAIL_MIN_LINES, LOG_TAIL_MAX_LINES);
        if self.host.trim().is_empty() {
            self.host = DEFAULT_HOST.to_string();
        }
        if self.port == 0 {
            self.port = DEFAULT_PORT;
        }
        self
    }

    /// `host:port` as the server binds it. IPv6 hosts get brackets.
    pub fn bind_address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn endpoint_url(&self) -> String {
        format!("http://{}/", self.bind_address())
    }

    /// Explicit manifest, else `requirements.txt` next to the bundled sources,
    /// else inside the server directory.
    pub fn manifest_path(&self) -> PathBuf {
        if let Some(path) = self.manifest.as_ref() {
            return path.clone();
        }
        match self.source_dir.as_ref() {
            Some(source) => source.join(MANIFEST_FILE),
            None => self.server_dir.join(MANIFEST_FILE),
        }
    }

    pub fn version_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.version_probe_timeout_ms)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_millis(self.install_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.json");
        fs::write(&path, r#"{ "port": 8123, "fallback": "bare_command" }"#).unwrap();

        let config = SupervisorConfig::load(&path);
        assert_eq!(config.port, 8123);
        assert_eq!(config.fallback, FallbackPolicy::BareCommand);
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.server_args, vec!["runserver", "--noreload"]);
    }

    #[test]
    fn invalid_or_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            SupervisorConfig::load(&dir.path().join("missing.json")).port,
            DEFAULT_PORT
        );

        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(SupervisorConfig::load(&path).port, DEFAULT_PORT);
    }

    #[test]
    fn env_overrides_apply_and_bad_values_are_ignored() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DDT_PORT", "not-a-port"),
            ("DDT_PYTHON_BIN", " /opt/py/bin/python3 "),
            ("DDT_SETTINGS_MODULE", "config.settings.testing"),
            ("DDT_DETACHED", "true"),
        ]);
        let config = SupervisorConfig::default()
            .apply_env_from(|key| vars.get(key).map(|value| value.to_string()));

        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.interpreter.as_deref(), Some("/opt/py/bin/python3"));
        assert_eq!(config.settings_module, "config.settings.testing");
        assert!(config.detached);
    }

    #[test]
    fn normalized_clamps_intervals() {
        let config = SupervisorConfig {
            poll_interval_ms: 1,
            probe_timeout_ms: 600_000,
            log_tail_lines: 0,
            host: "  ".into(),
            ..SupervisorConfig::default()
        }
        .normalized();
        assert_eq!(config.poll_interval_ms, POLL_INTERVAL_MIN_MS);
        assert_eq!(config.probe_timeout_ms, PROBE_TIMEOUT_MAX_MS);
        assert_eq!(config.log_tail_lines, LOG_TAIL_MIN_LINES);
        assert_eq!(config.endpoint_url(), "http://127.0.0.1:8000/");
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let config = SupervisorConfig {
            host: "::1".into(),
            port: 8123,
            ..SupervisorConfig::default()
        };
        assert_eq!(config.bind_address(), "[::1]:8123");
        assert_eq!(config.endpoint_url(), "http://[::1]:8123/");
    }

    #[test]
    fn manifest_prefers_bundled_sources() {
        let config = SupervisorConfig {
            source_dir: Some(PathBuf::from("/opt/ddt/app")),
            ..SupervisorConfig::default()
        };
        assert_eq!(
            config.manifest_path(),
            PathBuf::from("/opt/ddt/app").join(MANIFEST_FILE)
        );
    }
}
