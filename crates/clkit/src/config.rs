//! Compute core configuration.
//!
//! Loads [`CoreConfig`] from a TOML file with environment variable overrides
//! via `CLKIT_*` prefixed variables. Missing TOML fields take their defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Options read once by [`Core::init`](crate::Core::init) and program builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Enable queue profiling and record every event for
    /// [`Core::measure_time`](crate::Core::measure_time).
    /// Override: `CLKIT_COLLECT_TIME`
    pub collect_time: bool,

    /// Platform names skipped when another platform is available.
    /// Override: `CLKIT_AVOID_PLATFORMS` (comma separated)
    pub avoid_platforms: Vec<String>,

    /// Zero-based index of the GPU device on the selected platform.
    /// Override: `CLKIT_DEVICE_INDEX`
    pub device_index: usize,

    /// Extra options appended to every program build.
    /// Override: `CLKIT_BUILD_OPTIONS`
    pub extra_build_options: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            collect_time: false,
            avoid_platforms: vec!["Clover".to_string()],
            device_index: 0,
            extra_build_options: String::new(),
        }
    }
}

/// Errors that can occur when loading or validating a [`CoreConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride {
        key: String,
        value: String,
        reason: String,
    },
}

fn parse_bool(key: &str, val: &str) -> Result<bool, ConfigError> {
    match val.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::EnvOverride {
            key: key.into(),
            value: val.into(),
            reason: "expected a boolean".into(),
        }),
    }
}

impl CoreConfig {
    /// Default configuration rendered as TOML.
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }

    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from a TOML string, then apply environment overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: CoreConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.avoid_platforms.iter().any(|p| p.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "avoid_platforms must not contain empty names".into(),
            ));
        }
        if self.extra_build_options.contains('\0') {
            return Err(ConfigError::Validation(
                "extra_build_options must not contain NUL bytes".into(),
            ));
        }
        Ok(())
    }

    /// Apply `CLKIT_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("CLKIT_COLLECT_TIME") {
            self.collect_time = parse_bool("CLKIT_COLLECT_TIME", &val)?;
        }

        if let Ok(val) = std::env::var("CLKIT_AVOID_PLATFORMS") {
            self.avoid_platforms = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(val) = std::env::var("CLKIT_DEVICE_INDEX") {
            self.device_index = val.parse::<usize>().map_err(|e| ConfigError::EnvOverride {
                key: "CLKIT_DEVICE_INDEX".into(),
                value: val.clone(),
                reason: e.to_string(),
            })?;
        }

        if let Ok(val) = std::env::var("CLKIT_BUILD_OPTIONS") {
            self.extra_build_options = val;
        }

        Ok(())
    }

    /// Options passed to every program build.
    pub fn build_options(&self) -> String {
        let extra = self.extra_build_options.trim();
        if extra.is_empty() {
            crate::program::ARG_INFO_OPTION.to_string()
        } else {
            format!("{} {extra}", crate::program::ARG_INFO_OPTION)
        }
    }

    pub fn is_avoided(&self, platform_name: &str) -> bool {
        self.avoid_platforms.iter().any(|p| p == platform_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ENV_KEYS: [&str; 4] = [
        "CLKIT_COLLECT_TIME",
        "CLKIT_AVOID_PLATFORMS",
        "CLKIT_DEVICE_INDEX",
        "CLKIT_BUILD_OPTIONS",
    ];

    fn cleared() -> Vec<(&'static str, Option<&'static str>)> {
        ENV_KEYS.iter().map(|k| (*k, None)).collect()
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = CoreConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.is_avoided("Clover"));
        assert_eq!(cfg.build_options(), "-cl-kernel-arg-info");
    }

    #[test]
    fn default_toml_round_trips() {
        let toml_str = CoreConfig::default_toml().unwrap();
        let cfg: CoreConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(cfg, CoreConfig::default());
    }

    #[test]
    #[serial(clkit_env)]
    fn partial_toml_keeps_defaults() {
        temp_env::with_vars(cleared(), || {
            let cfg = CoreConfig::from_toml("collect_time = true\n").unwrap();
            assert!(cfg.collect_time);
            assert_eq!(cfg.avoid_platforms, vec!["Clover".to_string()]);
            assert_eq!(cfg.device_index, 0);
        });
    }

    #[test]
    fn empty_avoided_name_fails_validation() {
        let cfg = CoreConfig {
            avoid_platforms: vec!["  ".into()],
            ..CoreConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("avoid_platforms"));
    }

    #[test]
    fn extra_options_follow_arg_info() {
        let cfg = CoreConfig {
            extra_build_options: " -DN=4 -cl-fast-relaxed-math ".into(),
            ..CoreConfig::default()
        };
        assert_eq!(
            cfg.build_options(),
            "-cl-kernel-arg-info -DN=4 -cl-fast-relaxed-math"
        );
    }

    #[test]
    #[serial(clkit_env)]
    fn env_overrides_every_field() {
        temp_env::with_vars(
            [
                ("CLKIT_COLLECT_TIME", Some("yes")),
                ("CLKIT_AVOID_PLATFORMS", Some("Clover, rusticl")),
                ("CLKIT_DEVICE_INDEX", Some("2")),
                ("CLKIT_BUILD_OPTIONS", Some("-DWIDTH=8")),
            ],
            || {
                let cfg = CoreConfig::from_env().unwrap();
                assert!(cfg.collect_time);
                assert_eq!(cfg.avoid_platforms, vec!["Clover", "rusticl"]);
                assert_eq!(cfg.device_index, 2);
                assert_eq!(cfg.extra_build_options, "-DWIDTH=8");
            },
        );
    }

    #[test]
    #[serial(clkit_env)]
    fn invalid_device_index_names_the_key() {
        let mut vars = cleared();
        vars[2] = ("CLKIT_DEVICE_INDEX", Some("first"));
        temp_env::with_vars(vars, || match CoreConfig::from_env().unwrap_err() {
            ConfigError::EnvOverride { key, value, .. } => {
                assert_eq!(key, "CLKIT_DEVICE_INDEX");
                assert_eq!(value, "first");
            }
            other => panic!("expected EnvOverride, got: {other}"),
        });
    }

    #[test]
    #[serial(clkit_env)]
    fn invalid_bool_is_rejected() {
        let mut vars = cleared();
        vars[0] = ("CLKIT_COLLECT_TIME", Some("maybe"));
        temp_env::with_vars(vars, || {
            assert!(matches!(
                CoreConfig::from_env(),
                Err(ConfigError::EnvOverride { .. })
            ));
        });
    }

    #[test]
    #[serial(clkit_env)]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clkit.toml");
        std::fs::write(&path, "device_index = 1\navoid_platforms = []\n").unwrap();
        temp_env::with_vars(cleared(), || {
            let cfg = CoreConfig::load(&path).unwrap();
            assert_eq!(cfg.device_index, 1);
            assert!(cfg.avoid_platforms.is_empty());
        });
    }
}
