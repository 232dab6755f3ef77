//! Operator configuration types.
//!
//! This module defines the structs that map to the `stack-operator.yaml` file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Directory name used under the local data directory when no state dir is set.
const DEFAULT_STATE_DIR_NAME: &str = "halldyll-stacks";

/// Port of the metrics endpoint when none is configured.
pub const DEFAULT_METRICS_PORT: u16 = 9090;

/// The root configuration structure of the operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OperatorConfig {
    /// Tags applied to every managed stack, below user tags.
    pub default_tags: BTreeMap<String, String>,
    /// Capabilities acknowledged for every managed stack.
    pub default_capabilities: Vec<String>,
    /// Log mutations instead of performing them.
    pub dry_run: bool,
    /// Follower poll interval in seconds.
    pub poll_interval_secs: u64,
    /// Deadline for each remote provisioning call, in seconds.
    pub request_timeout_secs: u64,
    /// Interval between full resyncs of every stored resource, in seconds.
    pub resync_interval_secs: u64,
    /// Buffer size of the follow queue.
    pub hub_capacity: usize,
    /// Directory holding stored resources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    /// AWS region. Falls back to the AWS default chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Address serving `/metrics`. `null` disables the endpoint.
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            default_tags: BTreeMap::new(),
            default_capabilities: Vec::new(),
            dry_run: false,
            poll_interval_secs: 1,
            request_timeout_secs: 30,
            resync_interval_secs: 60,
            hub_capacity: 1024,
            state_dir: None,
            region: None,
            metrics_addr: Some(SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_METRICS_PORT))),
        }
    }
}

impl OperatorConfig {
    /// Gets the follower poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Gets the deadline of a remote provisioning call.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Gets the resync interval.
    #[must_use]
    pub const fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// Resolves the state directory.
    ///
    /// Defaults to `halldyll-stacks` under the user's local data directory,
    /// or the working directory when none exists.
    #[must_use]
    pub fn resolved_state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(DEFAULT_STATE_DIR_NAME)
        })
    }
}
