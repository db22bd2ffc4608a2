//! Manager implementations the reconciler drives.
//!
//! The container manager adapts the driver contract to the manager seam.
//! The in-process config manager applies device configuration variables
//! locally; platforms with richer config surfaces swap in their own
//! implementation of the same trait.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use edgewise_core::driver::Driver;
use edgewise_core::manager::{ConfigManager, ContainerManager, ManagerError};
use edgewise_core::model::{AppConfig, CurrentState, ReconciliationResult, TargetState};

pub struct DriverContainerManager {
    driver: Arc<dyn Driver>,
}

impl DriverContainerManager {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl ContainerManager for DriverContainerManager {
    async fn init(&self) -> Result<(), ManagerError> {
        if self.driver.is_ready() {
            return Ok(());
        }
        self.driver
            .init()
            .await
            .map_err(|e| ManagerError::Init(e.to_string()))
    }

    async fn set_target(
        &self,
        apps: &BTreeMap<String, AppConfig>,
    ) -> Result<ReconciliationResult, ManagerError> {
        let state = TargetState {
            apps: apps.clone(),
            ..TargetState::default()
        };
        self.driver
            .set_target_state(state)
            .await
            .map_err(|e| ManagerError::Apply(e.to_string()))?;
        self.driver
            .reconcile()
            .await
            .map_err(|e| ManagerError::Apply(e.to_string()))
    }

    async fn get_current_state(&self) -> Result<CurrentState, ManagerError> {
        self.driver
            .get_current_state()
            .await
            .map_err(|e| ManagerError::Query(e.to_string()))
    }
}

/// Applies device configuration variables in-process and remembers what was
/// applied.
#[derive(Default)]
pub struct LocalConfigManager {
    applied: RwLock<BTreeMap<String, String>>,
}

impl LocalConfigManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigManager for LocalConfigManager {
    async fn init(&self) -> Result<(), ManagerError> {
        Ok(())
    }

    async fn set_target(&self, vars: &BTreeMap<String, String>) -> Result<(), ManagerError> {
        let mut applied = self.applied.write().await;
        for (key, value) in vars {
            if applied.get(key) != Some(value) {
                debug!(key = %key, "device config variable changed");
            }
        }
        let changed = *applied != *vars;
        *applied = vars.clone();
        if changed {
            info!(vars = vars.len(), "device configuration applied");
        }
        Ok(())
    }

    async fn get_current(&self) -> Result<BTreeMap<String, String>, ManagerError> {
        Ok(self.applied.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_config_manager_round_trip() {
        let manager = LocalConfigManager::new();
        let vars = BTreeMap::from([("hostname".to_string(), "edge-7".to_string())]);
        manager.set_target(&vars).await.unwrap();
        assert_eq!(manager.get_current().await.unwrap(), vars);
    }
}
