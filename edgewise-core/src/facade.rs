//! The runtime-facade contract the container-engine driver delegates to.
//!
//! The facade wraps one engine and performs the actual create/list/stop/
//! remove/log/stat calls. `set_target` applies immediately and owns the
//! engine-level reconciliation loop; the driver above it is a thin
//! pass-through.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::{AppConfig, CurrentState, EngineStats, LogOptions, ReconciliationResult};

#[derive(Debug, Error)]
pub enum FacadeError {
    #[error("engine connection failed: {0}")]
    Connection(String),
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("engine error: {0}")]
    Engine(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Clone, Debug)]
pub enum FacadeEvent {
    /// Fired once after every target application, carrying the final counts.
    StateApplied { result: ReconciliationResult },
}

#[async_trait]
pub trait RuntimeFacade: Send + Sync {
    /// Connect to the engine and verify it answers.
    async fn init(&self) -> Result<(), FacadeError>;

    /// Snapshot the managed containers the engine reports right now.
    async fn get_current_state(&self) -> Result<CurrentState, FacadeError>;

    /// Replace the desired apps and apply them to the engine. Emits
    /// [`FacadeEvent::StateApplied`] once per call.
    async fn set_target(
        &self,
        apps: BTreeMap<String, AppConfig>,
    ) -> Result<ReconciliationResult, FacadeError>;

    /// Log retrieval by container identifier.
    async fn logs(
        &self,
        container_id: &str,
        opts: &LogOptions,
    ) -> Result<BoxStream<'static, Result<String, FacadeError>>, FacadeError>;

    /// Point-in-time resource statistics keyed by container identifier.
    async fn stats(&self, container_id: &str) -> Result<EngineStats, FacadeError>;

    fn subscribe(&self) -> broadcast::Receiver<FacadeEvent>;
}
