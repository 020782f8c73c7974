//! # solo-settings
//!
//! Configuration with layered sources.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`SoloSettings::default()`]
//! 2. **Settings file**: `~/.solo/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `SOLO_*` overrides (highest priority)
//!
//! The merged result is validated before it is returned.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = SoloSettings::default();
        let _path = settings_path();
    }

    #[test]
    fn default_settings_match_reference_policy() {
        let settings = SoloSettings::default();
        assert_eq!(settings.keepalive.heartbeat_interval_ms, 30_000);
        assert_eq!(settings.keepalive.stale_multiplier, 2);
        assert_eq!(settings.invalidation.grace_period_ms, 500);
        assert_eq!(settings.auth.token_ttl_secs, 3_600);
    }
}
