use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::idtools::{IdMapResult, IdMappings};

/// Environment variables override file settings: `LAYERDIFF_DRIVER__ROOT`,
/// `LAYERDIFF_IDMAP__UID_MAPS=0:100000:65536,...`.
const ENV_PREFIX: &str = "LAYERDIFF";
const LIST_KEYS: [&str; 2] = ["idmap.uid_maps", "idmap.gid_maps"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub driver: DriverConfig,
    pub idmap: IdMapConfig,
    pub archive: ArchiveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Directory holding one subdirectory per layer.
    pub root: PathBuf,
    pub mount_label: String,
}

/// ID mappings as `container:host:size` specs. Empty means identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdMapConfig {
    pub uid_maps: Vec<String>,
    pub gid_maps: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub ignore_chown_errors: bool,
}

impl Config {
    /// Load from an optional `config.*` file in the working directory and the
    /// environment.
    pub fn load() -> anyhow::Result<Self> {
        Self::build(config::File::with_name("config").required(false))
    }

    /// Load from `path` (which must exist) and the environment.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        Self::build(config::File::from(path).required(true))
    }

    fn build<S>(file: S) -> anyhow::Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let mut environment = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .list_separator(",")
            .try_parsing(true);
        for key in LIST_KEYS {
            environment = environment.with_list_parse_key(key);
        }

        let config = config::Config::builder().add_source(file).add_source(environment).build()?;

        Ok(config.try_deserialize()?)
    }
}

impl IdMapConfig {
    pub fn mappings(&self) -> IdMapResult<IdMappings> {
        IdMappings::from_specs(&self.uid_maps, &self.gid_maps)
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { root: PathBuf::from("/var/lib/layerdiff"), mount_label: String::new() }
    }
}
