use indexmap::IndexMap;
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::debug;

use crate::ServiceConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// `supergraph.yaml`: subgraphs in declaration order plus gateway options.
#[derive(Debug, Deserialize)]
pub struct SupergraphConfig {
    #[serde(default = "default_node_lookup")]
    pub node_lookup: bool,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    pub subgraphs: IndexMap<String, SubgraphConfig>,
}

#[derive(Debug, Deserialize)]
pub struct SubgraphConfig {
    pub routing_url: String,
    pub schema: SchemaConfig,
}

#[derive(Debug, Deserialize)]
pub struct SchemaConfig {
    pub file: String,
}

fn default_node_lookup() -> bool {
    true
}

impl SupergraphConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = read(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Reads every schema file, relative to the directory holding the config.
    pub fn services(&self, config_path: &Path) -> Result<Vec<ServiceConfig>, ConfigError> {
        let base_dir = config_path.parent().unwrap_or_else(|| Path::new(""));

        self.subgraphs
            .iter()
            .map(|(name, subgraph)| {
                let schema = read(&base_dir.join(&subgraph.schema.file))?;
                Ok(ServiceConfig {
                    name: name.clone(),
                    url: subgraph.routing_url.clone(),
                    schema,
                })
            })
            .collect()
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    debug!(path = %path.display(), "reading file");
    fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}
