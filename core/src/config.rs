//! Engine tuning loaded from TOML.
//!
//! Every section falls back to its defaults, so a file only needs the keys
//! it changes:
//!
//! ```toml
//! [command]
//! default_timeout_ms = 8000
//! timeouts_ms = { RUN = 25000 }
//!
//! [chunked]
//! silence_timeout_ms = 400
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::rules::TimeoutTable;

/// Bytes per indexed chunk in the chunked download protocol.
pub const CHUNK_SIZE: usize = 2048;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSettings {
    /// Budget for tags without an entry of their own.
    pub default_timeout_ms: u64,
    /// Silence tolerated between fragments of one answer.
    pub fragment_grace_ms: u64,
    /// Per-tag budgets, on top of the built-in slow-operation budgets.
    pub timeouts_ms: BTreeMap<String, u64>,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
            fragment_grace_ms: 3_000,
            timeouts_ms: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkedSettings {
    pub chunk_size: usize,
    /// Silence after which the current chunk is taken as the last one.
    /// Tuned per Bluetooth stack; 200 ms to 2 s are all seen in the field.
    pub silence_timeout_ms: u64,
    /// Hard ceiling for one chunk, however slowly it trickles in.
    pub chunk_timeout_ms: u64,
}

impl Default for ChunkedSettings {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            silence_timeout_ms: 2_000,
            chunk_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XModemSettings {
    /// Wait for a control byte (SOH, STX, EOT, CAN).
    pub control_timeout_ms: u64,
    /// Wait for the rest of a frame once its control byte arrived.
    pub frame_timeout_ms: u64,
    /// Consecutive failed frames before the transfer is cancelled.
    pub max_retries: u32,
    pub validate_block_numbers: bool,
}

impl Default for XModemSettings {
    fn default() -> Self {
        Self {
            control_timeout_ms: 3_000,
            frame_timeout_ms: 3_000,
            max_retries: 3,
            validate_block_numbers: true,
        }
    }
}

/// Address prefixes and advertised-name prefixes per hardware family,
/// matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    pub cc26x2_addresses: Vec<String>,
    pub cc26x2_names: Vec<String>,
    pub rn4020_addresses: Vec<String>,
    pub rn4020_names: Vec<String>,
    pub dummy_addresses: Vec<String>,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            cc26x2_addresses: vec!["04:EE:03".into(), "60:77:71".into()],
            cc26x2_names: vec!["DO-".into(), "TDO".into(), "CTD".into()],
            rn4020_addresses: vec!["00:1E:C0".into()],
            rn4020_names: vec!["MAT".into()],
            dummy_addresses: vec!["dummy".into()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub command: CommandSettings,
    pub chunked: ChunkedSettings,
    pub xmodem: XModemSettings,
    pub detection: DetectionSettings,
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would make a wait unbounded or instant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("command.default_timeout_ms", self.command.default_timeout_ms),
            ("command.fragment_grace_ms", self.command.fragment_grace_ms),
            ("chunked.silence_timeout_ms", self.chunked.silence_timeout_ms),
            ("chunked.chunk_timeout_ms", self.chunked.chunk_timeout_ms),
            ("xmodem.control_timeout_ms", self.xmodem.control_timeout_ms),
            ("xmodem.frame_timeout_ms", self.xmodem.frame_timeout_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
        }
        if let Some((tag, _)) = self.command.timeouts_ms.iter().find(|(_, ms)| **ms == 0) {
            return Err(ConfigError::Invalid(format!(
                "command.timeouts_ms.{tag} must be > 0"
            )));
        }
        if self.chunked.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunked.chunk_size must be > 0".into()));
        }
        if self.xmodem.max_retries == 0 {
            return Err(ConfigError::Invalid("xmodem.max_retries must be >= 1".into()));
        }
        Ok(())
    }

    pub fn timeout_table(&self) -> TimeoutTable {
        self.command.timeouts_ms.iter().fold(
            TimeoutTable::new(Duration::from_millis(self.command.default_timeout_ms)),
            |table, (tag, ms)| table.with_override(tag, Duration::from_millis(*ms)),
        )
    }
}

/// Load and validate a config file.
pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    EngineConfig::from_toml_str(&raw)
}
