//! Controller configuration
//!
//! Every setting is a CLI flag with an environment fallback so the operator
//! can be configured from a Deployment manifest without wrapper scripts.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::desired::{GeneratorOptions, DEFAULT_NODE_PORT};

/// Default field manager, event reporter and CRD apply identity
pub const DEFAULT_CONTROLLER_NAME: &str = "ghost-controller";

/// Runtime settings for the Ghost controller
#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Only watch Ghosts in this namespace (default: all namespaces)
    #[arg(long, env = "GHOST_WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Maximum number of Ghosts reconciled concurrently (0 = unbounded)
    #[arg(long, env = "GHOST_CONCURRENCY", default_value_t = 4)]
    pub concurrency: u16,

    /// Requeue interval for successfully reconciled Ghosts, in seconds
    #[arg(long, env = "GHOST_RESYNC_SECS", default_value_t = 300)]
    pub resync_secs: u64,

    /// Timeout applied to every cluster API call, in seconds
    #[arg(long, env = "GHOST_API_TIMEOUT_SECS", default_value_t = 30)]
    pub api_timeout_secs: u64,

    /// Directory with template overrides (default: templates built into the binary)
    #[arg(long, env = "GHOST_MANIFEST_DIR")]
    pub manifest_dir: Option<PathBuf>,

    /// Node port assigned to every Ghost Service (0 = let the cluster allocate)
    #[arg(long, env = "GHOST_NODE_PORT", default_value_t = DEFAULT_NODE_PORT)]
    pub node_port: i32,

    /// Name used as field manager and event reporter
    #[arg(long, env = "GHOST_CONTROLLER_NAME", default_value = DEFAULT_CONTROLLER_NAME)]
    pub controller_name: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            concurrency: 4,
            resync_secs: 300,
            api_timeout_secs: 30,
            manifest_dir: None,
            node_port: DEFAULT_NODE_PORT,
            controller_name: DEFAULT_CONTROLLER_NAME.to_string(),
        }
    }
}

impl ControllerConfig {
    /// Check values clap cannot express as types
    pub fn validate(&self) -> Result<(), String> {
        if !(0..=65535).contains(&self.node_port) {
            return Err(format!("node port {} is out of range", self.node_port));
        }
        if self.api_timeout_secs == 0 {
            return Err("api timeout must be at least one second".to_string());
        }
        if self.controller_name.trim().is_empty() {
            return Err("controller name must not be empty".to_string());
        }
        Ok(())
    }

    /// Requeue interval after a successful reconcile
    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }

    /// Per-call cluster API timeout
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// Options for the desired-state generator
    pub fn generator_options(&self) -> GeneratorOptions {
        GeneratorOptions {
            node_port: (self.node_port != 0).then_some(self.node_port),
        }
    }
}
