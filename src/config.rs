//! Adapter configuration.
//!
//! Loaded from a TOML file merged with environment variables prefixed with
//! `ICUBE_`, e.g. `ICUBE_GRAB_TIMEOUT_MS=250`.

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::modes::{ModeTable, ICUBE_MODES};
use crate::traits::Resolution;

/// Upper bound of the grab timeout in milliseconds.
pub const MAX_GRAB_TIMEOUT_MS: u32 = 10_000;

/// Error raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The sources could not be read or parsed.
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// A value is outside its permitted range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Adapter-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Number of device slots.
    pub max_instances: u32,
    /// Default grab timeout in milliseconds.
    pub grab_timeout_ms: u32,
    /// How long after a grab timeout the abandoned capture may still
    /// complete. Until then no new trigger is issued and its frame is
    /// discarded on arrival.
    pub late_frame_window_ms: u32,
    /// Arm external triggering on open unless the request says otherwise.
    pub external_trigger: bool,
    /// Resolution presets in vendor mode-index order.
    pub modes: Vec<Resolution>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            max_instances: 5,
            grab_timeout_ms: 1000,
            late_frame_window_ms: 1000,
            external_trigger: false,
            modes: ICUBE_MODES.to_vec(),
        }
    }
}

impl AdapterConfig {
    /// Load from a TOML file and `ICUBE_*` environment variables.
    ///
    /// Missing keys keep their defaults. A missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::extract(
            Figment::from(Serialized::defaults(Self::default()))
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("ICUBE_")),
        )
    }

    /// Parse from a TOML string without consulting the environment.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::extract(
            Figment::from(Serialized::defaults(Self::default()))
                .merge(Toml::string(toml)),
        )
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_instances == 0 {
            return Err(ConfigError::Invalid("max_instances must be at least 1".to_owned()));
        }
        if self.grab_timeout_ms > MAX_GRAB_TIMEOUT_MS {
            return Err(ConfigError::Invalid(format!(
                "grab_timeout_ms {} exceeds {MAX_GRAB_TIMEOUT_MS}",
                self.grab_timeout_ms
            )));
        }
        if self.late_frame_window_ms > MAX_GRAB_TIMEOUT_MS {
            return Err(ConfigError::Invalid(format!(
                "late_frame_window_ms {} exceeds {MAX_GRAB_TIMEOUT_MS}",
                self.late_frame_window_ms
            )));
        }
        if self.modes.is_empty() {
            return Err(ConfigError::Invalid("mode table is empty".to_owned()));
        }
        Ok(())
    }

    /// Default grab timeout.
    #[must_use]
    pub fn grab_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.grab_timeout_ms))
    }

    /// Late-frame window.
    #[must_use]
    pub fn late_frame_window(&self) -> Duration {
        Duration::from_millis(u64::from(self.late_frame_window_ms))
    }

    /// Mode Table built from `modes`.
    #[must_use]
    pub fn mode_table(&self) -> ModeTable {
        ModeTable::new(self.modes.clone())
    }
}
