//! Persistent agent identity.
//!
//! Created on first start and stored as JSON under the data directory. The
//! server may hand out a new `agent_id` on every (re)registration; everything
//! else is fixed for the lifetime of the install.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::ConfigError;

/// Identity of this agent install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Server-assigned id; `None` until the first successful registration.
    pub agent_id: Option<String>,
    /// Stable per-install machine id.
    pub machine_id: String,
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Host name at creation time.
    #[serde(default)]
    pub hostname: String,
}

impl AgentIdentity {
    /// Build a fresh identity from configuration.
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            agent_id: None,
            machine_id: Uuid::new_v4().to_string(),
            tenant_id: config.tenant_id.clone(),
            capabilities: config.capabilities.iter().cloned().collect(),
            tags: config.tags.iter().cloned().collect(),
            hostname: sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string()),
        }
    }

    /// Load the identity at `path`, creating and persisting one if missing.
    ///
    /// Capabilities, tags and tenant follow the current configuration; the
    /// machine id and last agent id are preserved.
    pub async fn load_or_create(path: &Path, config: &AgentConfig) -> Result<Self, ConfigError> {
        let mut identity = if path.exists() {
            let raw = fs::read_to_string(path).await?;
            serde_json::from_str::<Self>(&raw).map_err(|e| ConfigError::CorruptIdentity {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        } else {
            tracing::info!(path = %path.display(), "Creating new agent identity");
            Self::new(config)
        };

        identity.tenant_id = config.tenant_id.clone().or(identity.tenant_id);
        identity.capabilities = config.capabilities.iter().cloned().collect();
        identity.tags = config.tags.iter().cloned().collect();
        identity.save(path).await?;
        Ok(identity)
    }

    /// Persist the identity as pretty JSON.
    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| ConfigError::InvalidValue {
            key: "identity".to_string(),
            message: e.to_string(),
        })?;
        fs::write(path, json).await?;
        Ok(())
    }

    /// Record the id handed out by the server. Returns true if it changed.
    pub fn assign_agent_id(&mut self, agent_id: impl Into<String>) -> bool {
        let agent_id = agent_id.into();
        if self.agent_id.as_deref() == Some(agent_id.as_str()) {
            return false;
        }
        self.agent_id = Some(agent_id);
        true
    }
}
