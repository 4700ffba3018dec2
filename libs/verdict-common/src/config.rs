use crate::error::ConfigError;
use crate::types::{ExecutionMode, IsolationStrategy, Variant};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 600;
const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;
const DEFAULT_GIT_URL: &str = "https://github.com";
const DEFAULT_MEMORY_MB: u64 = 4096;
const DEFAULT_CPUS: f64 = 2.0;

/// Evaluation configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub mode: ExecutionMode,
    pub parallelism: usize,
    pub timeout: Duration,
    pub build_timeout: Duration,
    pub isolation: IsolationStrategy,
    pub fault_retries: u32,
    pub output_limit_bytes: usize,
    pub cache_dir: PathBuf,
    pub scratch_dir: Option<PathBuf>,
    pub git_url: String,
    pub memory_limit_mb: u64,
    pub cpu_limit: f64,
    pub variants: Vec<Variant>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mode = match lookup("VERDICT_MODE") {
            Some(raw) => ExecutionMode::from_str(&raw).ok_or(ConfigError::InvalidValue {
                key: "VERDICT_MODE",
                value: raw,
            })?,
            None => ExecutionMode::Local,
        };

        // Sandboxed runs share the committed environment image by default
        let isolation = match lookup("VERDICT_ISOLATION") {
            Some(raw) => IsolationStrategy::from_str(&raw).ok_or(ConfigError::InvalidValue {
                key: "VERDICT_ISOLATION",
                value: raw,
            })?,
            None => match mode {
                ExecutionMode::Sandboxed => IsolationStrategy::Overlay,
                ExecutionMode::Local => IsolationStrategy::Ephemeral,
            },
        };

        let variants = match lookup("VERDICT_VARIANTS") {
            Some(raw) => parse_variants(&raw)?,
            None => Variant::all_variants().to_vec(),
        };

        let cache_dir = lookup("VERDICT_CACHE_DIR")
            .map(PathBuf::from)
            .or_else(|| lookup("HOME").map(|home| PathBuf::from(home).join(".cache/verdict")))
            .unwrap_or_else(|| env::temp_dir().join("verdict-cache"));

        Ok(Self {
            mode,
            parallelism: parse_or(&lookup, "VERDICT_PARALLELISM", 1)?,
            timeout: Duration::from_secs(parse_or(
                &lookup,
                "VERDICT_TIMEOUT_SECS",
                DEFAULT_TIMEOUT_SECS,
            )?),
            build_timeout: Duration::from_secs(parse_or(
                &lookup,
                "VERDICT_BUILD_TIMEOUT_SECS",
                DEFAULT_BUILD_TIMEOUT_SECS,
            )?),
            isolation,
            fault_retries: parse_or(&lookup, "VERDICT_FAULT_RETRIES", 0)?,
            output_limit_bytes: parse_or(
                &lookup,
                "VERDICT_OUTPUT_LIMIT_BYTES",
                DEFAULT_OUTPUT_LIMIT_BYTES,
            )?,
            cache_dir,
            scratch_dir: lookup("VERDICT_SCRATCH_DIR").map(PathBuf::from),
            git_url: lookup("VERDICT_GIT_URL").unwrap_or_else(|| DEFAULT_GIT_URL.to_string()),
            memory_limit_mb: parse_or(&lookup, "VERDICT_MEMORY_MB", DEFAULT_MEMORY_MB)?,
            cpu_limit: parse_or(&lookup, "VERDICT_CPUS", DEFAULT_CPUS)?,
            variants,
        })
    }

    /// Reject settings the Task Manager cannot honor
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallelism == 0 {
            return Err(ConfigError::ZeroParallelism);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("VERDICT_TIMEOUT_SECS"));
        }
        if self.build_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("VERDICT_BUILD_TIMEOUT_SECS"));
        }
        // Local mode has no immutable image to layer a private overlay on
        if self.mode == ExecutionMode::Local && self.isolation == IsolationStrategy::Overlay {
            return Err(ConfigError::UnsupportedIsolation {
                mode: self.mode.to_string(),
                isolation: self.isolation.to_string(),
            });
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Local,
            parallelism: 1,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            build_timeout: Duration::from_secs(DEFAULT_BUILD_TIMEOUT_SECS),
            isolation: IsolationStrategy::Ephemeral,
            fault_retries: 0,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            cache_dir: env::temp_dir().join("verdict-cache"),
            scratch_dir: None,
            git_url: DEFAULT_GIT_URL.to_string(),
            memory_limit_mb: DEFAULT_MEMORY_MB,
            cpu_limit: DEFAULT_CPUS,
            variants: Variant::all_variants().to_vec(),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        None => Ok(default),
    }
}

fn parse_variants(raw: &str) -> Result<Vec<Variant>, ConfigError> {
    let mut variants = Vec::new();
    for name in raw.split(',').filter(|s| !s.trim().is_empty()) {
        let variant = Variant::from_str(name).ok_or_else(|| ConfigError::InvalidValue {
            key: "VERDICT_VARIANTS",
            value: name.to_string(),
        })?;
        if !variants.contains(&variant) {
            variants.push(variant);
        }
    }
    variants.sort();
    Ok(variants)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_config_defaults() {
        let config = config_with(&[("HOME", "/home/eval")]).unwrap();
        assert_eq!(config.mode, ExecutionMode::Local);
        assert_eq!(config.parallelism, 1);
        assert_eq!(config.timeout, Duration::from_secs(600));
        assert_eq!(config.isolation, IsolationStrategy::Ephemeral);
        assert_eq!(config.fault_retries, 0);
        assert_eq!(config.cache_dir, PathBuf::from("/home/eval/.cache/verdict"));
        assert_eq!(config.variants.len(), 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sandboxed_defaults_to_overlay() {
        let config = config_with(&[("VERDICT_MODE", "docker")]).unwrap();
        assert_eq!(config.mode, ExecutionMode::Sandboxed);
        assert_eq!(config.isolation, IsolationStrategy::Overlay);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = config_with(&[
            ("VERDICT_PARALLELISM", "8"),
            ("VERDICT_TIMEOUT_SECS", "30"),
            ("VERDICT_FAULT_RETRIES", "1"),
            ("VERDICT_VARIANTS", "gen, gt,generated"),
            ("VERDICT_CPUS", "0.5"),
        ])
        .unwrap();
        assert_eq!(config.parallelism, 8);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.fault_retries, 1);
        assert_eq!(config.variants, vec![Variant::Generated, Variant::GroundTruth]);
        assert_eq!(config.cpu_limit, 0.5);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = config_with(&[("VERDICT_PARALLELISM", "many")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "VERDICT_PARALLELISM",
                value: "many".to_string()
            }
        );
        assert!(config_with(&[("VERDICT_MODE", "k8s")]).is_err());
        assert!(config_with(&[("VERDICT_VARIANTS", "gen,oracle")]).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_parallelism() {
        let config = config_with(&[("VERDICT_PARALLELISM", "0")]).unwrap();
        assert_eq!(config.validate(), Err(ConfigError::ZeroParallelism));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = config_with(&[("VERDICT_TIMEOUT_SECS", "0")]).unwrap();
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroTimeout("VERDICT_TIMEOUT_SECS"))
        );
    }

    #[test]
    fn test_validate_rejects_local_overlay() {
        let config = config_with(&[("VERDICT_ISOLATION", "overlay")]).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedIsolation { .. })
        ));
    }
}
