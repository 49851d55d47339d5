use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KernelError;

/// How top-level actor IDs are assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityScheme {
    /// Hash of `(nonce, parent)`, truncated.
    #[default]
    ContentHashed,
    /// The global creation nonce itself. Children are still content-hashed.
    Numeric,
}

impl FromStr for IdentityScheme {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "content_hashed" | "hashed" => Ok(Self::ContentHashed),
            "numeric" => Ok(Self::Numeric),
            other => Err(KernelError::Config(format!(
                "unknown identity scheme '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    pub identity: IdentityScheme,
    /// Charge gas during execution. When off, `increment_ticks` does nothing.
    pub meter: bool,
    /// Driver that receives messages addressed to actors with no record.
    pub default_driver: Option<String>,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            identity: IdentityScheme::default(),
            meter: true,
            default_driver: None,
        }
    }
}

impl HypervisorConfig {
    /// Defaults overridden by `HV_METER`, `HV_IDENTITY` and `HV_DEFAULT_DRIVER`.
    pub fn from_env() -> Result<Self, KernelError> {
        let mut config = Self::default();
        if let Ok(meter) = std::env::var("HV_METER") {
            config.meter = parse_bool(&meter)?;
        }
        if let Ok(identity) = std::env::var("HV_IDENTITY") {
            config.identity = identity.parse()?;
        }
        if let Ok(driver) = std::env::var("HV_DEFAULT_DRIVER") {
            config.default_driver = (!driver.is_empty()).then_some(driver);
        }
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, KernelError> {
        serde_json::from_str(json).map_err(|e| KernelError::Config(e.to_string()))
    }
}

fn parse_bool(value: &str) -> Result<bool, KernelError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(KernelError::Config(format!("expected a boolean, got '{other}'"))),
    }
}
