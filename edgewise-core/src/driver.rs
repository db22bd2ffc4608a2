//! The contract every runtime driver implements.
//!
//! Drivers are the pluggable backends that keep workloads on one runtime
//! (a container engine, a lightweight Kubernetes) converged on the target
//! state. `reconcile()` is the only operation that mutates the runtime; the
//! per-service operations exist for manual intervention and are independent
//! of the declarative loop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::facade::FacadeError;
use crate::model::{
    AppId, CurrentState, LogOptions, NetworkConfig, ReconciliationResult, ServiceConfig,
    ServiceId, ServiceMetrics, ServiceStatus, TargetState, VolumeConfig,
};

/// Errors surfaced by driver operations.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Connectivity could not be established; the driver must not be used.
    #[error("driver '{driver}' failed to initialize: {message}")]
    Init { driver: &'static str, message: String },
    #[error("driver is not ready (init not called or failed)")]
    NotReady,
    #[error("service not found: {0}")]
    ServiceNotFound(String),
    /// The backend cannot express this operation. Callers should branch on
    /// [`DriverCapabilities`] instead of trapping this.
    #[error("operation not supported: {operation}")]
    NotSupported { operation: String },
    #[error("engine error: {0}")]
    Engine(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Facade(#[from] FacadeError),
}

impl DriverError {
    pub fn not_supported(operation: impl Into<String>) -> Self {
        DriverError::NotSupported {
            operation: operation.into(),
        }
    }
}

/// Events emitted by drivers.
#[derive(Clone, Debug)]
pub enum DriverEvent {
    ServiceStarted {
        service_id: ServiceId,
        service_name: String,
    },
    ServiceStopped {
        service_id: ServiceId,
        service_name: String,
    },
    ServiceError {
        service_name: String,
        error: String,
    },
    HealthChanged {
        healthy: bool,
        message: Option<String>,
    },
    ReconciliationComplete {
        result: ReconciliationResult,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct DriverHealth {
    pub healthy: bool,
    pub message: Option<String>,
    pub last_check: DateTime<Utc>,
}

/// Typed capability flags so callers can branch on backend gaps instead of
/// encountering `NotSupported` at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriverCapabilities {
    pub direct_service_ops: bool,
    pub networks: bool,
    pub volumes: bool,
    pub metrics: bool,
}

/// A stream of log lines from one service instance.
pub type LogLines = BoxStream<'static, Result<String, DriverError>>;

#[async_trait]
pub trait Driver: Send + Sync {
    /// Stable backend name ("docker", "k3s").
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> DriverCapabilities;

    /// Establish connectivity. Leaves the driver ready or returns an error
    /// with a descriptive cause; partial initialization is never usable.
    async fn init(&self) -> Result<(), DriverError>;

    /// Release resources. Idempotent.
    async fn shutdown(&self) -> Result<(), DriverError>;

    /// Pure readiness query.
    fn is_ready(&self) -> bool;

    async fn health(&self) -> DriverHealth;

    /// Store the desired state. Pure assignment plus a log line; no side
    /// effects on the runtime.
    async fn set_target_state(&self, state: TargetState) -> Result<(), DriverError>;

    async fn get_target_state(&self) -> Option<TargetState>;

    /// Converge the runtime on the stored target. Safe to call repeatedly
    /// with an unchanged target: the second pass is a no-op (zero creates,
    /// updates, and removes).
    async fn reconcile(&self) -> Result<ReconciliationResult, DriverError>;

    async fn get_current_state(&self) -> Result<CurrentState, DriverError>;

    // Imperative single-target operations, independent of reconcile().
    async fn create_service(&self, service: &ServiceConfig) -> Result<(), DriverError>;
    async fn stop_service(&self, service_id: ServiceId) -> Result<(), DriverError>;
    async fn remove_service(&self, service_id: ServiceId) -> Result<(), DriverError>;
    async fn restart_service(&self, service_id: ServiceId) -> Result<(), DriverError>;
    async fn service_status(&self, service_id: ServiceId) -> Result<ServiceStatus, DriverError>;
    async fn list_services(&self) -> Result<Vec<ServiceConfig>, DriverError>;

    async fn service_logs(
        &self,
        service_id: ServiceId,
        opts: &LogOptions,
    ) -> Result<LogLines, DriverError>;

    async fn service_metrics(&self, service_id: ServiceId)
    -> Result<ServiceMetrics, DriverError>;

    async fn create_network(
        &self,
        app_id: AppId,
        name: &str,
        config: &NetworkConfig,
    ) -> Result<(), DriverError>;
    async fn remove_network(&self, app_id: AppId, name: &str) -> Result<(), DriverError>;
    async fn create_volume(
        &self,
        app_id: AppId,
        name: &str,
        config: &VolumeConfig,
    ) -> Result<(), DriverError>;
    async fn remove_volume(&self, app_id: AppId, name: &str) -> Result<(), DriverError>;

    fn subscribe(&self) -> broadcast::Receiver<DriverEvent>;
}
