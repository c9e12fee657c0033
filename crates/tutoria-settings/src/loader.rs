use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::errors::{Result, SettingsError};
use crate::types::TutoriaSettings;

/// `~/.tutoria`, falling back to `/tmp/.tutoria` without a home directory.
pub fn tutoria_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".tutoria")
}

pub fn settings_path() -> PathBuf {
    tutoria_dir().join("settings.json")
}

/// Load from the default settings path.
pub fn load_settings() -> Result<TutoriaSettings> {
    load_settings_from_path(&settings_path())
}

/// Defaults, then the file at `path` (if it exists), then env overrides.
pub fn load_settings_from_path(path: &Path) -> Result<TutoriaSettings> {
    let defaults = serde_json::to_value(TutoriaSettings::default())?;

    let merged = if path.exists() {
        let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_owned(),
            source,
        })?;
        let user: Value = serde_json::from_str(&raw).map_err(|source| SettingsError::Parse {
            path: path.to_owned(),
            source,
        })?;
        tracing::debug!(?path, "settings file loaded");
        deep_merge(defaults, user)
    } else {
        defaults
    };

    let mut settings: TutoriaSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings.validate();
    Ok(settings)
}

/// Recursively merge `overlay` into `base`. Objects merge key by key; any other
/// overlay value replaces the base value. `null` in the overlay is ignored.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}

/// Apply `TUTORIA_*` variables read through `lookup`.
pub fn apply_env_overrides(settings: &mut TutoriaSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(host) = lookup("TUTORIA_HOST") {
        settings.server.host = host;
    }
    if let Some(port) = lookup("TUTORIA_PORT") {
        match port.parse() {
            Ok(p) => settings.server.port = p,
            Err(_) => tracing::warn!(value = %port, "ignoring invalid TUTORIA_PORT"),
        }
    }
    if let Some(path) = lookup("TUTORIA_DB_PATH") {
        settings.store.path = Some(PathBuf::from(path));
    }
    if let Some(endpoint) = lookup("TUTORIA_TUTOR_ENDPOINT") {
        settings.tutor.endpoint = Some(endpoint);
    }
    if let Some(endpoint) = lookup("TUTORIA_CODEGEN_ENDPOINT") {
        settings.codegen.endpoint = Some(endpoint);
    }
    if let Some(interpreter) = lookup("TUTORIA_SANDBOX_INTERPRETER") {
        settings.sandbox.interpreter = interpreter;
    }
    if let Some(level) = lookup("TUTORIA_LOG_LEVEL") {
        settings.logging.level = level;
    }
    if let Some(json) = lookup("TUTORIA_LOG_JSON") {
        settings.logging.json = matches!(json.as_str(), "1" | "true" | "yes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn deep_merge_nested_objects() {
        let base = json!({"server": {"host": "0.0.0.0", "port": 3001}, "x": 1});
        let overlay = json!({"server": {"port": 4000}});
        let merged = deep_merge(base, overlay);
        assert_eq!(merged["server"]["host"], "0.0.0.0");
        assert_eq!(merged["server"]["port"], 4000);
        assert_eq!(merged["x"], 1);
    }

    #[test]
    fn deep_merge_null_keeps_base() {
        let merged = deep_merge(json!({"a": 1}), json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn deep_merge_arrays_replace() {
        let merged = deep_merge(json!({"a": [1, 2]}), json!({"a": [3]}));
        assert_eq!(merged["a"], json!([3]));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.sandbox.port_range_start, 40000);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"sandbox": {"portRangeStart": 41000, "portRangeEnd": 41010}, "keepalive": {"pingIntervalMs": 250}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.sandbox.port_range_start, 41000);
        assert_eq!(settings.sandbox.port_range_end, 41010);
        assert_eq!(settings.sandbox.interpreter, "node");
        assert_eq!(settings.keepalive.ping_interval_ms, 250);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ nope").unwrap();
        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Parse { .. }));
    }

    #[test]
    fn file_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"keepalive": {"pingIntervalMs": 0}}"#).unwrap();
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.keepalive.ping_interval_ms, 5000);
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TUTORIA_PORT", "9000"),
            ("TUTORIA_TUTOR_ENDPOINT", "http://tutor.local/answer"),
            ("TUTORIA_SANDBOX_INTERPRETER", "python3"),
            ("TUTORIA_LOG_JSON", "true"),
        ]);
        let mut settings = TutoriaSettings::default();
        apply_env_overrides(&mut settings, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.tutor.endpoint.as_deref(), Some("http://tutor.local/answer"));
        assert_eq!(settings.sandbox.interpreter, "python3");
        assert!(settings.logging.json);
    }

    #[test]
    fn invalid_env_port_is_ignored() {
        let mut settings = TutoriaSettings::default();
        apply_env_overrides(&mut settings, |k| (k == "TUTORIA_PORT").then(|| "abc".to_string()));
        assert_eq!(settings.server.port, 3001);
    }
}
