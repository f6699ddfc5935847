//! Global configuration: load/save, defaults, and CI-mode environment overrides.
//!
//! The configuration lives at `$XDG_CONFIG_HOME/devserve/config.json`. In CI
//! mode the file is skipped entirely and defaults plus `DEVSERVE_*`
//! environment variables apply, so CI jobs never pick up developer-local
//! settings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Template variable names that are reserved for built-ins and can never be
/// shadowed by user-defined variables.
pub const RESERVED_VARIABLES: [&str; 5] = ["port", "hostname", "url", "https-cert", "https-key"];

pub const DEFAULT_PORT_RANGE: PortRange = PortRange {
    min: 3000,
    max: 9999,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            other => Err(Error::ConfigInvalid {
                reason: format!("unknown protocol '{}', expected 'http' or 'https'", other),
            }),
        }
    }
}

/// Inclusive port range servers may be assigned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }

    /// Number of ports in the range.
    pub fn span(&self) -> u32 {
        u32::from(self.max) - u32::from(self.min) + 1
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

impl std::str::FromStr for PortRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::ConfigInvalid {
            reason: format!("invalid port range '{}', expected '<min>-<max>'", s),
        };
        let (min, max) = s.split_once('-').ok_or_else(invalid)?;
        let range = PortRange {
            min: min.trim().parse().map_err(|_| invalid())?,
            max: max.trim().parse().map_err(|_| invalid())?,
        };
        range.validate()?;
        Ok(range)
    }
}

impl PortRange {
    pub fn validate(&self) -> Result<()> {
        if self.min == 0 {
            return Err(Error::ConfigInvalid {
                reason: "port range minimum must be at least 1".into(),
            });
        }
        if self.min > self.max {
            return Err(Error::ConfigInvalid {
                reason: format!(
                    "port range minimum {} exceeds maximum {}",
                    self.min, self.max
                ),
            });
        }
        Ok(())
    }
}

/// What to do when a server's configuration has drifted since it started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshPolicy {
    #[default]
    Manual,
    OnStart,
    Prompt,
    Auto,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    pub hostname: String,
    pub protocol: Protocol,
    pub port_range: PortRange,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub https_cert: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub https_key: Option<PathBuf>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
    pub refresh_on_change: RefreshPolicy,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            protocol: Protocol::Http,
            port_range: DEFAULT_PORT_RANGE,
            https_cert: None,
            https_key: None,
            variables: BTreeMap::new(),
            refresh_on_change: RefreshPolicy::Manual,
        }
    }
}

fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Skip on-disk configuration and use defaults plus environment overrides.
    pub ci_mode: bool,
}

impl GlobalConfig {
    /// Path of the configuration file, creating parent directories as needed.
    pub fn config_path() -> Result<PathBuf> {
        let dirs = xdg::BaseDirectories::with_prefix("devserve");
        dirs.place_config_file("config.json").map_err(Error::Io)
    }

    pub fn load(options: LoadOptions) -> Result<Self> {
        if options.ci_mode {
            let mut config = Self::default();
            config.apply_env_overrides()?;
            config.validate()?;
            return Ok(config);
        }

        let path = Self::config_path()?;
        let config = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents).map_err(|e| Error::ConfigInvalid {
                reason: format!("{}: {}", path.display(), e),
            })?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.validate()?;
        let path = Self::config_path()?;
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|source| Error::ConfigWrite { path, source })
    }

    /// Environment overrides used in CI mode, where no config file is read.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(hostname) = std::env::var("DEVSERVE_HOSTNAME") {
            self.hostname = hostname;
        }
        if let Ok(protocol) = std::env::var("DEVSERVE_PROTOCOL") {
            self.protocol = protocol.parse()?;
        }
        if let Ok(range) = std::env::var("DEVSERVE_PORT_RANGE") {
            self.port_range = range.parse()?;
        }
        if let Ok(cert) = std::env::var("DEVSERVE_HTTPS_CERT") {
            self.https_cert = Some(PathBuf::from(cert));
        }
        if let Ok(key) = std::env::var("DEVSERVE_HTTPS_KEY") {
            self.https_key = Some(PathBuf::from(key));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.port_range.validate()?;
        for name in self.variables.keys() {
            if RESERVED_VARIABLES.contains(&name.as_str()) {
                return Err(Error::ConfigInvalid {
                    reason: format!("variable name '{}' is reserved for built-ins", name),
                });
            }
        }
        Ok(())
    }

    /// Read a configuration value by its user-facing key, including dotted
    /// access to user-defined variables (`variables.NAME`).
    pub fn get(&self, key: &str) -> Result<String> {
        if let Some(name) = key.strip_prefix("variables.") {
            return self
                .variables
                .get(name)
                .cloned()
                .ok_or_else(|| Error::ConfigInvalid {
                    reason: format!("no variable named '{}'", name),
                });
        }
        match key {
            "hostname" => Ok(self.hostname.clone()),
            "protocol" => Ok(self.protocol.to_string()),
            "portRange" => Ok(self.port_range.to_string()),
            "httpsCert" => Ok(self
                .https_cert
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()),
            "httpsKey" => Ok(self
                .https_key
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()),
            "refreshOnChange" => Ok(serde_json::to_value(self.refresh_on_change)?
                .as_str()
                .unwrap_or_default()
                .to_string()),
            other => Err(Error::ConfigInvalid {
                reason: format!("unknown configuration key '{}'", other),
            }),
        }
    }

    /// Set a configuration value by its user-facing key. Does not persist;
    /// call [`GlobalConfig::save`] afterwards.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if let Some(name) = key.strip_prefix("variables.") {
            if RESERVED_VARIABLES.contains(&name) {
                return Err(Error::ConfigInvalid {
                    reason: format!("variable name '{}' is reserved for built-ins", name),
                });
            }
            self.variables.insert(name.to_string(), value.to_string());
            return Ok(());
        }
        match key {
            "hostname" => self.hostname = value.to_string(),
            "protocol" => self.protocol = value.parse()?,
            "portRange" => self.port_range = value.parse()?,
            "httpsCert" => self.https_cert = Some(PathBuf::from(value)),
            "httpsKey" => self.https_key = Some(PathBuf::from(value)),
            "refreshOnChange" => {
                self.refresh_on_change = serde_json::from_value(serde_json::Value::String(
                    value.to_string(),
                ))
                .map_err(|_| Error::ConfigInvalid {
                    reason: format!(
                        "unknown refresh policy '{}', expected manual, on-start, prompt or auto",
                        value
                    ),
                })?
            }
            other => {
                return Err(Error::ConfigInvalid {
                    reason: format!("unknown configuration key '{}'", other),
                });
            }
        }
        Ok(())
    }
}
