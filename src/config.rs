//! Harness configuration.

use crate::error::{BlockLimits, HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for one measurement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Passes over the unrolled block per measurement
    pub iterations: u64,
    /// Faults serviced before the run is abandoned
    pub max_faults: u32,
    /// Counter name, e.g. `cycles` or `r01c2`
    pub event: String,
    pub pin_to_core: Option<usize>,
    /// Fail when the relocated stack does not verify
    pub strict_relocation: bool,
    pub limits: BlockLimits,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            iterations: 16,
            max_faults: 64,
            event: "cycles".to_string(),
            pin_to_core: Some(1),
            strict_relocation: true,
            limits: BlockLimits::default(),
        }
    }
}

impl HarnessConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            HarnessError::ConfigError(format!("{}: {}", path.as_ref().display(), e))
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(HarnessError::ConfigError(
                "iterations must be at least 1".into(),
            ));
        }
        if self.event.trim().is_empty() {
            return Err(HarnessError::ConfigError("event name is empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.iterations, 16);
        assert_eq!(config.max_faults, 64);
        assert_eq!(config.event, "cycles");
        assert_eq!(config.pin_to_core, Some(1));
        assert!(config.strict_relocation);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: HarnessConfig =
            serde_json::from_str(r#"{"iterations": 100, "limits": {"max_block_size": 16}}"#).unwrap();
        assert_eq!(config.iterations, 100);
        assert_eq!(config.max_faults, 64);
        assert_eq!(config.limits.max_block_size, 16);
        assert_eq!(config.limits.max_unroll_factor, 100_000);
    }

    #[test]
    fn test_from_json_file() {
        let path = std::env::temp_dir().join(format!("bhive_config_{}.json", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, r#"{{"event": "instructions", "pin_to_core": null}}"#).unwrap();
        drop(file);

        let config = HarnessConfig::from_json_file(&path).unwrap();
        assert_eq!(config.event, "instructions");
        assert_eq!(config.pin_to_core, None);
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(
            HarnessConfig::from_json_file("/nonexistent/bhive.json"),
            Err(HarnessError::ConfigError(_))
        ));
    }

    #[test]
    fn test_validation() {
        let config = HarnessConfig {
            iterations: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
