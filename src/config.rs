use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Profiler knobs supplied by the embedding program.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilerConfig {
    /// Number of frames recorded per allocation site.
    #[serde(default = "default_stack_depth")]
    pub stack_depth: usize,

    /// Innermost frames dropped when capturing allocation sites (the hook
    /// and allocator frames themselves).
    #[serde(default = "default_alloc_skip_frames")]
    pub alloc_skip_frames: usize,

    /// Innermost frames dropped when capturing stacks in other contexts.
    #[serde(default = "default_other_skip_frames")]
    pub other_skip_frames: usize,

    /// Allocation-site groups below this many bytes are left out of the
    /// displayed report.
    #[serde(default)]
    pub min_bytes: usize,

    /// Maximum number of seed objects in an object graph.
    #[serde(default = "default_graph_ref_limit")]
    pub graph_ref_limit: usize,

    /// Maximum number of hops explored from the graph seeds.
    #[serde(default = "default_graph_ref_level")]
    pub graph_ref_level: usize,
}

fn default_stack_depth() -> usize {
    16
}

fn default_alloc_skip_frames() -> usize {
    4
}

fn default_other_skip_frames() -> usize {
    1
}

fn default_graph_ref_limit() -> usize {
    100
}

fn default_graph_ref_level() -> usize {
    3
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        ProfilerConfig {
            stack_depth: default_stack_depth(),
            alloc_skip_frames: default_alloc_skip_frames(),
            other_skip_frames: default_other_skip_frames(),
            min_bytes: 0,
            graph_ref_limit: default_graph_ref_limit(),
            graph_ref_level: default_graph_ref_level(),
        }
    }
}

impl ProfilerConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: ProfilerConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        debug!("loading profiler config from {}", path.display());
        let yaml = fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&yaml)?;
        info!(
            "profiler config: depth={} skip={} min_bytes={}",
            config.stack_depth, config.alloc_skip_frames, config.min_bytes
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stack_depth == 0 {
            return Err(Error::InvalidConfig(
                "stack_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
