//! CSI Identity service trait.
//!
//! Lets an orchestrator find out which plugin it is talking to, whether it
//! is alive, and which optional services it offers.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{PluginCapability, PluginInfo};

/// Plugin discovery and health.
#[async_trait]
pub trait CsiIdentity: Send + Sync {
    /// Name and version reported to the orchestrator.
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError>;

    /// `true` when the plugin can serve requests.
    async fn probe(&self) -> Result<bool, CsiError>;

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError>;
}
