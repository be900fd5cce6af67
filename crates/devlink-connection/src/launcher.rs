use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ConnectionError, ConnectionResult};
use crate::instance::VmInstanceInfo;
use crate::logger::TestLogger;

/// Multi-valued launch attributes (key may repeat).
pub type LaunchAttributes = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildInfo {
    pub build_id: Option<String>,
    pub build_target: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchRequest {
    pub build: BuildInfo,
    pub initial_ip: Option<String>,
    pub initial_user: Option<String>,
    pub offset: Option<u32>,
    pub attributes: LaunchAttributes,
}

/// Provisions virtual devices. Implementations wrap whatever backend leases the
/// VM; the connection only sees the returned descriptor.
#[async_trait]
pub trait VmLauncher: Send + Sync {
    async fn launch(
        &self,
        request: &LaunchRequest,
        logger: &dyn TestLogger,
    ) -> ConnectionResult<VmInstanceInfo>;

    /// Releases the instance. Returns whether the backend confirmed it.
    async fn shutdown(&self, instance: &VmInstanceInfo) -> bool;

    async fn clean_up(&self) {}

    async fn log_serial_output(&self, _instance: &VmInstanceInfo, _logger: &dyn TestLogger) {}

    async fn download_launch_failure_logs(&self, _error: &ConnectionError, _logger: &dyn TestLogger) {}
}

/// A fresh launcher per connection initialization.
pub type LauncherFactory = Arc<dyn Fn() -> Arc<dyn VmLauncher> + Send + Sync>;
