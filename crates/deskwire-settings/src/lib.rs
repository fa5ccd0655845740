//! # deskwire-settings
//!
//! Layered configuration for the dashboard's real-time client.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`DeskwireSettings::default()`]
//! 2. **User file**: `~/.deskwire/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `DESKWIRE_*` overrides (highest priority)
//!
//! There is no global instance; the host loads settings once and hands the
//! relevant sections to the components it constructs.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_overrides, deep_merge, load_settings, load_settings_from_path, settings_path, validate};
pub use types::*;
