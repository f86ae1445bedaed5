//! Driver configuration
//!
//! Loaded from TOML. Every key is optional; an empty document yields the
//! reference naming and access behavior.
//!
//! ```toml
//! driver_name = "kvm_ivshmem"
//! device_name = "ivshmem"
//! class_name = "ivshmem-dev"
//! minor = 0
//! access = "single-writer"
//! unbound_access = "error"
//! sysfs_root = "/sys/bus/pci/devices"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type Result<T> = core::result::Result<T, ConfigError>;

/// Locking applied around shared window copies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessDiscipline {
    /// Concurrent transfers race on the window contents
    #[default]
    Unsynchronized,
    /// Writers are exclusive; readers run in parallel with each other
    SingleWriter,
}

/// Result of a transfer while no device is bound
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnboundAccess {
    /// Zero bytes transferred, no error
    #[default]
    EmptyStream,
    /// `WindowUnavailable`
    Error,
}

/// Driver configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    /// Owner name recorded on the region claim
    pub driver_name: String,
    /// Name of the device node
    pub device_name: String,
    /// Name of the device class
    pub class_name: String,
    /// The only session identity `open` accepts
    pub minor: u32,
    pub access: AccessDiscipline,
    pub unbound_access: UnboundAccess,
    /// Root of the PCI device tree for the sysfs backend
    pub sysfs_root: PathBuf,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_name: ivshmem_broker::DEFAULT_DRIVER_NAME.to_string(),
            device_name: "ivshmem".to_string(),
            class_name: "ivshmem-dev".to_string(),
            minor: 0,
            access: AccessDiscipline::default(),
            unbound_access: UnboundAccess::default(),
            sysfs_root: PathBuf::from("/sys/bus/pci/devices"),
        }
    }
}

impl DriverConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: DriverConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("loading driver config from {}", path.display());
        Self::from_toml_str(&source)
    }

    /// Check values serde cannot
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("driver_name", &self.driver_name),
            ("device_name", &self.device_name),
            ("class_name", &self.class_name),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must not be empty".to_string(),
                });
            }
        }

        if self.device_name.contains('/') {
            return Err(ConfigError::Invalid {
                field: "device_name",
                reason: format!("`{}` contains a path separator", self.device_name),
            });
        }

        if self.sysfs_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "sysfs_root",
                reason: "must not be empty".to_string(),
            });
        }

        Ok(())
    }
}
