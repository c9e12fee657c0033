//! # tutoria-settings
//!
//! Configuration for the session server, loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`TutoriaSettings::default()`]
//! 2. **Settings file**: `~/.tutoria/settings.json`, deep-merged over defaults
//! 3. **Environment variables**: `TUTORIA_*` overrides (highest priority)
//!
//! Settings are loaded once at startup and passed to the components that need
//! them. There is no global instance.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
