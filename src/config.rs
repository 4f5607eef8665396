//! Connection configuration. No environment variables or on-disk state are
//! consumed by the core (spec §6) — everything here is supplied by the
//! caller at construction time.

use crate::settings::Settings;
use std::time::Duration;

/// Local-endpoint configuration for a [`crate::connection::Connection`].
///
/// `local_settings` is the SETTINGS frame this endpoint advertises to the
/// peer; it governs what the peer must respect when sending to us.
#[derive(Debug, Clone)]
pub struct Config {
    pub local_settings: Settings,
    pub settings_ack_timeout: Duration,
}

impl Config {
    #[must_use]
    pub fn server() -> Self {
        let mut local_settings = Settings::default();
        local_settings.set(crate::settings::SettingsParameter::EnablePush, 0);
        Self {
            local_settings,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn client() -> Self {
        Self::default()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_settings: Settings::default(),
            settings_ack_timeout: Duration::from_secs(5),
        }
    }
}
