// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Sections: [instance] backend connection, [shaders] kernel directory,
// [miner] search parameters, [debug] log level. Every key is optional and
// a missing file means all defaults.

use crate::backend::InstanceDesc;
use crate::search::BASE64_CHARSET;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub instance: InstanceConfig,
    pub shaders: ShaderConfig,
    pub miner: MinerConfig,
    pub debug: DebugConfig,
}

/// Backend connection settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub app_name: String,
    pub validation: bool,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            app_name: "vkcompute".to_string(),
            validation: true,
        }
    }
}

/// Where compiled kernels live
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub dir: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("shaders"),
        }
    }
}

/// Brute-force search settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    pub prefix: String,
    pub nonce_len: usize,
    pub charset: String,
    pub batch_size: usize,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            prefix: "hello/".to_string(),
            nonce_len: 4,
            charset: BASE64_CHARSET.to_string(),
            batch_size: 65536,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn instance_desc(&self) -> InstanceDesc {
        InstanceDesc {
            app_name: self.instance.app_name.clone(),
            validation: self.instance.validation,
        }
    }

    /// Path of a compiled kernel, e.g. `shader_path("copy")`
    pub fn shader_path(&self, name: &str) -> PathBuf {
        self.shaders.dir.join(format!("{}.comp.spv", name))
    }

    /// Log level filter, defaulting to INFO on unknown names
    pub fn log_level(&self) -> log::LevelFilter {
        self.debug.log_level.parse().unwrap_or_else(|_| {
            log::warn!(
                "Unknown log level '{}', defaulting to INFO",
                self.debug.log_level
            );
            log::LevelFilter::Info
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert!(config.instance.validation);
        assert_eq!(config.miner.batch_size, 65536);
        assert_eq!(config.miner.charset.len(), 64);
        assert_eq!(config.shader_path("copy"), Path::new("shaders/copy.comp.spv"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [instance]
            validation = false

            [miner]
            prefix = "abc"
            nonce_len = 2
            "#,
        )
        .unwrap();

        assert!(!config.instance.validation);
        assert_eq!(config.instance.app_name, "vkcompute");
        assert_eq!(config.miner.prefix, "abc");
        assert_eq!(config.miner.nonce_len, 2);
        assert_eq!(config.miner.batch_size, 65536);
    }

    #[test]
    fn instance_desc_mirrors_config() {
        let config = Config::parse("[instance]\napp_name = \"bench\"\nvalidation = false\n").unwrap();
        let desc = config.instance_desc();
        assert_eq!(desc.app_name, "bench");
        assert!(!desc.validation);
    }

    #[test]
    fn log_level_parsing() {
        let config = Config::parse("[debug]\nlog_level = \"trace\"\n").unwrap();
        assert_eq!(config.log_level(), log::LevelFilter::Trace);

        let config = Config::parse("[debug]\nlog_level = \"loud\"\n").unwrap();
        assert_eq!(config.log_level(), log::LevelFilter::Info);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[miner]\nnonce_len = \"four\"\n").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load_from_path("does/not/exist.toml").unwrap();
        assert_eq!(config.miner.prefix, "hello/");
    }
}
