use crate::definition::param::{parse_duration_text, DurationParam};
use crate::definition::RoutesDefinition;
use crate::error::{Context, Result};
use crate::pool::RejectedPolicy;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ENDPOINT_CACHE_SIZE: usize = 1000;

/// Engine-wide settings: placeholder properties, pool profiles and cache sizes.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default = "default_endpoint_cache_size")]
    pub endpoint_cache_size: usize,
    #[serde(default)]
    pub thread_pools: ThreadPoolsConfig,
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub shutdown_timeout: Duration,
    #[serde(default)]
    pub routes_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            properties: BTreeMap::new(),
            endpoint_cache_size: DEFAULT_ENDPOINT_CACHE_SIZE,
            thread_pools: ThreadPoolsConfig::default(),
            shutdown_timeout: default_shutdown_timeout(),
            routes_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThreadPoolsConfig {
    #[serde(default)]
    pub default: ThreadPoolProfile,
    #[serde(default)]
    pub profiles: BTreeMap<String, ThreadPoolProfile>,
}

impl ThreadPoolsConfig {
    pub fn profile(&self, name: &str) -> Option<&ThreadPoolProfile> {
        self.profiles.get(name)
    }
}

/// Sizing template for pools created by parallel nodes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ThreadPoolProfile {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default)]
    pub rejected_policy: RejectedPolicy,
}

impl Default for ThreadPoolProfile {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_pool_size: default_max_pool_size(),
            max_queue_size: default_max_queue_size(),
            rejected_policy: RejectedPolicy::default(),
        }
    }
}

const fn default_endpoint_cache_size() -> usize {
    DEFAULT_ENDPOINT_CACHE_SIZE
}

const fn default_pool_size() -> usize {
    10
}

const fn default_max_pool_size() -> usize {
    20
}

const fn default_max_queue_size() -> usize {
    1000
}

const fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match DurationParam::deserialize(deserializer)? {
        DurationParam::Millis(ms) => Ok(Duration::from_millis(ms)),
        DurationParam::Text(text) => parse_duration_text(&text).map_err(serde::de::Error::custom),
    }
}

impl EngineConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::builder(File::with_name("config/courier").required(false))
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::builder(File::from(path.as_ref()).required(true))
    }

    fn builder<S>(file: S) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix("COURIER").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Route definitions referenced by `routes_path`, if any.
    pub fn load_routes(&self) -> Result<Option<RoutesDefinition>> {
        let Some(path) = self.routes_path.as_ref() else {
            return Ok(None);
        };
        RoutesDefinition::from_path(path)
            .with_context(|| format!("loading routes from {}", path.display()))
            .map(Some)
    }
}
