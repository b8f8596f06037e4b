//! MeshLink CLI configuration
//!
//! Layered loading with figment, lowest priority first: defaults, an
//! optional TOML file, then `MESHLINK_*` environment variables. Environment
//! keys address the config tree with `__` between levels, so
//! `MESHLINK_MESH__REQUESTED_MTU=185` sets `mesh.requested_mtu` and
//! `MESHLINK_MESH__OPERATION_TIMEOUT__SECS=2` sets one duration field.

use std::path::Path;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use meshlink_core::MeshConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CliError, Result};

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "MESHLINK_";

/// Separator between nesting levels in environment keys
pub const ENV_SEPARATOR: &str = "__";

// ----------------------------------------------------------------------------
// CLI Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the `meshlink` binary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Engine configuration shared by every command
    pub mesh: MeshConfig,
    /// Settings for the `demo` command
    pub demo: DemoConfig,
}

/// Loopback demo settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Handshakes to run back to back
    pub rounds: u32,
    /// Capability bits both nodes advertise
    pub provides: Vec<u32>,
    /// Identity name announced by the initiating node
    pub initiator_name: String,
    /// Identity name announced by the responding node
    pub responder_name: String,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            rounds: 1,
            provides: vec![1],
            initiator_name: "alpha".to_string(),
            responder_name: "bravo".to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl CliConfig {
    /// Defaults, then the file at `path` if given, then the environment
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split(ENV_SEPARATOR))
    }

    /// Load from `path` (or defaults), apply the process environment and validate
    pub fn load(path: Option<&str>) -> Result<Self> {
        let path = path.map(Path::new);
        if let Some(path) = path {
            if !path.is_file() {
                return Err(CliError::Config(format!(
                    "configuration file {} not found",
                    path.display()
                )));
            }
            debug!("Loading configuration from: {}", path.display());
        }

        let config: CliConfig = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document over the defaults; missing sections keep their defaults
    pub fn from_toml(source: &str) -> Result<Self> {
        Ok(Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::string(source))
            .extract()?)
    }

    /// Render the configuration as a TOML document
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.mesh.validate()?;
        if self.demo.rounds == 0 {
            return Err(CliError::Config("demo.rounds must be > 0".into()));
        }
        if self.demo.provides.is_empty() {
            return Err(CliError::Config("demo.provides must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use std::time::Duration;

    #[test]
    fn test_empty_document_gives_defaults() {
        let config = CliConfig::from_toml("").unwrap();
        assert_eq!(config, CliConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config = CliConfig::from_toml(
            r#"
            [mesh]
            fragment_size = 64
            transaction_timeout = { secs = 30, nanos = 0 }

            [demo]
            rounds = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.mesh.fragment_size, 64);
        assert_eq!(config.mesh.transaction_timeout, Duration::from_secs(30));
        assert_eq!(config.mesh.operation_timeout, Duration::from_secs(5));
        assert_eq!(config.demo.rounds, 3);
        assert_eq!(config.demo.initiator_name, "alpha");
    }

    #[test]
    fn test_environment_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "meshlink.toml",
                "[mesh]\nfragment_size = 64\nrequested_mtu = 256\n",
            )?;
            jail.set_env("MESHLINK_MESH__FRAGMENT_SIZE", 182);
            jail.set_env("MESHLINK_MESH__REQUESTED_MTU", 185);
            jail.set_env("MESHLINK_MESH__OPERATION_TIMEOUT__SECS", 2);
            jail.set_env("MESHLINK_DEMO__RESPONDER_NAME", "charlie");

            let config = CliConfig::load(Some("meshlink.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.mesh.fragment_size, 182);
            assert_eq!(config.mesh.requested_mtu, 185);
            assert_eq!(config.mesh.operation_timeout, Duration::from_secs(2));
            assert_eq!(config.mesh.transaction_timeout, Duration::from_secs(120));
            assert_eq!(config.demo.responder_name, "charlie");
            Ok(())
        });
    }

    #[test]
    fn test_bad_override_is_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("MESHLINK_MESH__EVENT_CAPACITY", "soon");
            let result = CliConfig::load(None);
            assert!(matches!(result, Err(CliError::Loading(_))));
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_is_an_error() {
        Jail::expect_with(|_jail| {
            assert!(matches!(
                CliConfig::load(Some("absent.toml")),
                Err(CliError::Config(_))
            ));
            Ok(())
        });
    }

    #[test]
    fn test_validation_catches_zero_values() {
        let mut config = CliConfig::default();
        config.mesh.fragment_size = 0;
        assert!(matches!(config.validate(), Err(CliError::Mesh(_))));

        let mut config = CliConfig::default();
        config.demo.rounds = 0;
        assert!(matches!(config.validate(), Err(CliError::Config(_))));

        Jail::expect_with(|jail| {
            jail.set_env("MESHLINK_DEMO__ROUNDS", 0);
            assert!(matches!(CliConfig::load(None), Err(CliError::Config(_))));
            Ok(())
        });
    }

    #[test]
    fn test_malformed_toml_is_an_error() {
        assert!(matches!(
            CliConfig::from_toml("[mesh\nfragment_size = "),
            Err(CliError::Loading(_))
        ));
    }

    #[test]
    fn test_rendered_toml_loads_back() {
        let mut config = CliConfig::default();
        config.mesh.requested_mtu = 185;
        config.demo.provides = vec![1, 4];
        let rendered = config.to_toml().unwrap();
        assert_eq!(CliConfig::from_toml(&rendered).unwrap(), config);
    }
}
