//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings file
//! may carry any subset of fields; missing ones take their default.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 3001 },
///   "sandbox": { "portRangeStart": 41000, "portRangeEnd": 42000 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TutoriaSettings {
    pub server: ServerSettings,
    pub keepalive: KeepaliveSettings,
    pub sandbox: SandboxSettings,
    pub tutor: TutorSettings,
    pub codegen: CodegenSettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

impl TutoriaSettings {
    /// Correct invalid values in place.
    ///
    /// Called during loading. Bad values are replaced with a warning rather
    /// than rejected.
    pub fn validate(&mut self) {
        fn non_zero(val: &mut u64, fallback: u64, name: &str) {
            if *val == 0 {
                tracing::warn!("{name} must be positive, using {fallback}");
                *val = fallback;
            }
        }

        let sandbox_defaults = SandboxSettings::default();
        let sb = &mut self.sandbox;
        if sb.port_range_start > sb.port_range_end {
            tracing::warn!(
                "sandbox port range inverted ({}..{}), swapping",
                sb.port_range_start,
                sb.port_range_end
            );
            std::mem::swap(&mut sb.port_range_start, &mut sb.port_range_end);
        }
        if sb.port_range_start == 0 {
            tracing::warn!("sandbox port range may not include port 0, starting at 1");
            sb.port_range_start = 1;
        }
        if sb.bind_attempts == 0 {
            tracing::warn!("sandbox bind_attempts must be at least 1");
            sb.bind_attempts = 1;
        }
        non_zero(
            &mut sb.log_flush_interval_ms,
            sandbox_defaults.log_flush_interval_ms,
            "log_flush_interval_ms",
        );
        non_zero(&mut sb.start_timeout_ms, sandbox_defaults.start_timeout_ms, "start_timeout_ms");
        if !sb.route_prefix.starts_with('/') {
            sb.route_prefix.insert(0, '/');
        }
        while sb.route_prefix.len() > 1 && sb.route_prefix.ends_with('/') {
            sb.route_prefix.pop();
        }

        let ka_defaults = KeepaliveSettings::default();
        non_zero(
            &mut self.keepalive.ping_interval_ms,
            ka_defaults.ping_interval_ms,
            "ping_interval_ms",
        );

        non_zero(&mut self.tutor.timeout_ms, TutorSettings::default().timeout_ms, "tutor.timeout_ms");
        non_zero(
            &mut self.codegen.timeout_ms,
            CodegenSettings::default().timeout_ms,
            "codegen.timeout_ms",
        );
    }
}

/// HTTP/WebSocket listener.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Outbound messages buffered per connection before new ones are dropped.
    pub max_send_queue: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            max_send_queue: 256,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeepaliveSettings {
    pub ping_interval_ms: u64,
    /// How long connection teardown waits for in-flight background work.
    pub teardown_grace_ms: u64,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            ping_interval_ms: 5000,
            teardown_grace_ms: 2000,
        }
    }
}

impl KeepaliveSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }
}

/// Sandbox workers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxSettings {
    pub bind_host: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Ports tried before giving up on a start.
    pub bind_attempts: u32,
    /// Program used to run generated source, e.g. `node`.
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    /// File extension for the written program.
    pub program_extension: String,
    pub log_flush_interval_ms: u64,
    pub start_timeout_ms: u64,
    /// Public path prefix under which workers are proxied.
    pub route_prefix: String,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port_range_start: 40000,
            port_range_end: 50000,
            bind_attempts: 20,
            interpreter: "node".to_string(),
            interpreter_args: Vec::new(),
            program_extension: "js".to_string(),
            log_flush_interval_ms: 1000,
            start_timeout_ms: 10_000,
            route_prefix: "/sandbox".to_string(),
        }
    }
}

impl SandboxSettings {
    pub fn log_flush_interval(&self) -> Duration {
        Duration::from_millis(self.log_flush_interval_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}

/// AI tutor endpoint. Without an endpoint the server runs with no tutor answers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TutorSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
}

impl Default for TutorSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 60_000,
        }
    }
}

/// Code generation endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodegenSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
}

impl Default for CodegenSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// SQLite file. Defaults to `~/.tutoria/database/sessions.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Keep sessions in memory only.
    pub in_memory: bool,
}

impl StoreSettings {
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| crate::loader::tutoria_dir().join("database").join("sessions.db"))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level. `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Per-module overrides, e.g. `{"tutoria_sandbox": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
    /// JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            module_levels: BTreeMap::new(),
            json: false,
        }
    }
}
