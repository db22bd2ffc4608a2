//! Contracts for the two managers the state reconciler drives.
//!
//! The container manager applies the apps portion of the target state; the
//! config manager applies device configuration variables. Both are
//! collaborators behind traits so the reconciler can be exercised against
//! doubles.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{AppConfig, CurrentState, ReconciliationResult};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("manager initialization failed: {0}")]
    Init(String),
    #[error("failed to apply target: {0}")]
    Apply(String),
    #[error("state query failed: {0}")]
    Query(String),
}

#[async_trait]
pub trait ContainerManager: Send + Sync {
    async fn init(&self) -> Result<(), ManagerError>;

    /// Apply the desired apps to the runtime and report per-item outcomes.
    async fn set_target(
        &self,
        apps: &BTreeMap<String, AppConfig>,
    ) -> Result<ReconciliationResult, ManagerError>;

    async fn get_current_state(&self) -> Result<CurrentState, ManagerError>;
}

#[async_trait]
pub trait ConfigManager: Send + Sync {
    async fn init(&self) -> Result<(), ManagerError>;

    /// Apply device configuration variables.
    async fn set_target(&self, vars: &BTreeMap<String, String>) -> Result<(), ManagerError>;

    async fn get_current(&self) -> Result<BTreeMap<String, String>, ManagerError>;
}
