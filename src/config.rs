use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use chain::ConsensusConstants;
use networking::propagation::PropagationConfig;
use networking::sync::SyncConfig;
use serde::{Deserialize, Serialize};

/// Node configuration file. Every section is optional.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    pub log_level: String,
    pub consensus: ConsensusConstants,
    pub sync: SyncConfig,
    pub propagation: PropagationConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            consensus: ConsensusConstants::default(),
            sync: SyncConfig::default(),
            propagation: PropagationConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open config file {}", path.display()))?;
        let reader = BufReader::new(file);
        serde_yaml::from_reader(reader)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}
