//! Container-engine driver.
//!
//! A thin layer over the runtime facade: the facade owns the engine-level
//! apply loop, so `reconcile()` passes straight through, and introspection,
//! logs, and stats delegate. The driver's own work is the percentage math on
//! stats samples and the event emission.
//!
//! Direct per-service operations are not wired to the facade; callers see
//! `capabilities().direct_service_ops == false` and a `NotSupported` error
//! rather than a silently partial implementation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};

use edgewise_core::driver::{
    Driver, DriverCapabilities, DriverError, DriverEvent, DriverHealth, LogLines,
};
use edgewise_core::facade::RuntimeFacade;
use edgewise_core::model::{
    AppId, CurrentState, EngineStats, LogOptions, NetworkConfig, ReconciliationResult,
    ServiceConfig, ServiceId, ServiceMetrics, ServiceStatus, TargetState, VolumeConfig,
};

/// CPU percentage from one stats sample's consecutive cumulative counters:
/// `(Δcontainer_cpu / Δsystem_cpu) × online_cpus × 100`.
pub(crate) fn cpu_percent(stats: &EngineStats) -> f64 {
    let cpu_delta = stats.cpu_total_usage.saturating_sub(stats.precpu_total_usage) as f64;
    let system_delta = match (stats.system_cpu_usage, stats.presystem_cpu_usage) {
        (Some(now), Some(before)) if now > before => (now - before) as f64,
        _ => return 0.0,
    };
    let cpus = stats.online_cpus.unwrap_or(1) as f64;
    (cpu_delta / system_delta) * cpus * 100.0
}

pub(crate) fn memory_percent(stats: &EngineStats) -> f64 {
    match (stats.memory_usage, stats.memory_limit) {
        (Some(usage), Some(limit)) if limit > 0 => usage as f64 / limit as f64 * 100.0,
        _ => 0.0,
    }
}

pub struct DockerDriver {
    facade: Arc<dyn RuntimeFacade>,
    target: RwLock<Option<TargetState>>,
    ready: AtomicBool,
    last_healthy: AtomicBool,
    events: broadcast::Sender<DriverEvent>,
}

impl DockerDriver {
    pub fn new(facade: Arc<dyn RuntimeFacade>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            facade,
            target: RwLock::new(None),
            ready: AtomicBool::new(false),
            last_healthy: AtomicBool::new(false),
            events,
        }
    }

    async fn find_service(&self, service_id: ServiceId) -> Result<ServiceConfig, DriverError> {
        let current = self.facade.get_current_state().await?;
        current
            .services()
            .find(|s| s.service_id == service_id)
            .cloned()
            .ok_or_else(|| DriverError::ServiceNotFound(service_id.to_string()))
    }

    fn direct_op(operation: &str) -> DriverError {
        DriverError::not_supported(format!(
            "{operation}: direct service operations are not wired on the docker driver, \
             use the declarative reconcile path"
        ))
    }
}

#[async_trait]
impl Driver for DockerDriver {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            direct_service_ops: false,
            networks: false,
            volumes: false,
            metrics: true,
        }
    }

    async fn init(&self) -> Result<(), DriverError> {
        self.facade.init().await?;
        self.ready.store(true, Ordering::SeqCst);
        self.last_healthy.store(true, Ordering::SeqCst);
        info!(driver = self.name(), "driver initialized");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        self.ready.store(false, Ordering::SeqCst);
        debug!(driver = self.name(), "driver shut down");
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn health(&self) -> DriverHealth {
        let (healthy, message) = match self.facade.get_current_state().await {
            Ok(_) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        if self.last_healthy.swap(healthy, Ordering::SeqCst) != healthy {
            let _ = self.events.send(DriverEvent::HealthChanged {
                healthy,
                message: message.clone(),
            });
        }
        DriverHealth {
            healthy,
            message,
            last_check: Utc::now(),
        }
    }

    async fn set_target_state(&self, state: TargetState) -> Result<(), DriverError> {
        debug!(
            driver = self.name(),
            apps = state.apps.len(),
            "target state stored"
        );
        *self.target.write().await = Some(state);
        Ok(())
    }

    async fn get_target_state(&self) -> Option<TargetState> {
        self.target.read().await.clone()
    }

    async fn reconcile(&self) -> Result<ReconciliationResult, DriverError> {
        if !self.is_ready() {
            return Err(DriverError::NotReady);
        }
        let target = self.target.read().await.clone();
        let result = match target {
            Some(state) => self.facade.set_target(state.apps).await?,
            None => ReconciliationResult::empty(),
        };
        for item in &result.errors {
            let _ = self.events.send(DriverEvent::ServiceError {
                service_name: item.service_name.clone(),
                error: item.error.clone(),
            });
        }
        let _ = self.events.send(DriverEvent::ReconciliationComplete {
            result: result.clone(),
        });
        Ok(result)
    }

    async fn get_current_state(&self) -> Result<CurrentState, DriverError> {
        Ok(self.facade.get_current_state().await?)
    }

    async fn create_service(&self, _service: &ServiceConfig) -> Result<(), DriverError> {
        Err(Self::direct_op("create_service"))
    }

    async fn stop_service(&self, _service_id: ServiceId) -> Result<(), DriverError> {
        Err(Self::direct_op("stop_service"))
    }

    async fn remove_service(&self, _service_id: ServiceId) -> Result<(), DriverError> {
        Err(Self::direct_op("remove_service"))
    }

    async fn restart_service(&self, _service_id: ServiceId) -> Result<(), DriverError> {
        Err(Self::direct_op("restart_service"))
    }

    async fn service_status(&self, service_id: ServiceId) -> Result<ServiceStatus, DriverError> {
        let service = self.find_service(service_id).await?;
        Ok(service.service_status.unwrap_or_default())
    }

    async fn list_services(&self) -> Result<Vec<ServiceConfig>, DriverError> {
        let current = self.facade.get_current_state().await?;
        Ok(current.services().cloned().collect())
    }

    async fn service_logs(
        &self,
        service_id: ServiceId,
        opts: &LogOptions,
    ) -> Result<LogLines, DriverError> {
        let service = self.find_service(service_id).await?;
        let container_id = service
            .container_id
            .ok_or_else(|| DriverError::ServiceNotFound(service_id.to_string()))?;
        let stream = self.facade.logs(&container_id, opts).await?;
        Ok(stream.map(|item| item.map_err(DriverError::from)).boxed())
    }

    async fn service_metrics(
        &self,
        service_id: ServiceId,
    ) -> Result<ServiceMetrics, DriverError> {
        let service = self.find_service(service_id).await?;
        let container_id = service
            .container_id
            .ok_or_else(|| DriverError::ServiceNotFound(service_id.to_string()))?;
        let stats = self.facade.stats(&container_id).await?;
        Ok(ServiceMetrics {
            cpu_percent: cpu_percent(&stats),
            memory_usage_bytes: stats.memory_usage.unwrap_or(0),
            memory_percent: memory_percent(&stats),
            timestamp: Utc::now(),
        })
    }

    async fn create_network(
        &self,
        _app_id: AppId,
        _name: &str,
        _config: &NetworkConfig,
    ) -> Result<(), DriverError> {
        Err(DriverError::not_supported(
            "create_network: app networks are managed by the reconcile path",
        ))
    }

    async fn remove_network(&self, _app_id: AppId, _name: &str) -> Result<(), DriverError> {
        Err(DriverError::not_supported("remove_network"))
    }

    async fn create_volume(
        &self,
        _app_id: AppId,
        _name: &str,
        _config: &VolumeConfig,
    ) -> Result<(), DriverError> {
        Err(DriverError::not_supported(
            "create_volume: app volumes are managed by the reconcile path",
        ))
    }

    async fn remove_volume(&self, _app_id: AppId, _name: &str) -> Result<(), DriverError> {
        Err(DriverError::not_supported("remove_volume"))
    }

    fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    use futures_util::stream::BoxStream;
    use tokio::sync::broadcast;

    use edgewise_core::facade::{FacadeError, FacadeEvent};
    use edgewise_core::model::AppConfig;

    /// Facade double: records applied targets and reports them back as the
    /// current state.
    struct FakeFacade {
        applied: StdMutex<Vec<BTreeMap<String, AppConfig>>>,
        events: broadcast::Sender<FacadeEvent>,
    }

    impl FakeFacade {
        fn new() -> Self {
            let (events, _) = broadcast::channel(8);
            Self {
                applied: StdMutex::new(Vec::new()),
                events,
            }
        }
    }

    #[async_trait]
    impl RuntimeFacade for FakeFacade {
        async fn init(&self) -> Result<(), FacadeError> {
            Ok(())
        }

        async fn get_current_state(&self) -> Result<CurrentState, FacadeError> {
            let apps = self
                .applied
                .lock()
                .unwrap()
                .last()
                .cloned()
                .unwrap_or_default();
            Ok(CurrentState {
                apps,
                timestamp: Utc::now(),
            })
        }

        async fn set_target(
            &self,
            apps: BTreeMap<String, AppConfig>,
        ) -> Result<ReconciliationResult, FacadeError> {
            self.applied.lock().unwrap().push(apps);
            Ok(ReconciliationResult::empty())
        }

        async fn logs(
            &self,
            _container_id: &str,
            _opts: &LogOptions,
        ) -> Result<BoxStream<'static, Result<String, FacadeError>>, FacadeError> {
            Ok(futures_util::stream::empty().boxed())
        }

        async fn stats(&self, _container_id: &str) -> Result<EngineStats, FacadeError> {
            Ok(EngineStats::default())
        }

        fn subscribe(&self) -> broadcast::Receiver<FacadeEvent> {
            self.events.subscribe()
        }
    }

    #[test]
    fn test_cpu_percent_delta_over_delta() {
        let stats = EngineStats {
            cpu_total_usage: 400,
            precpu_total_usage: 200,
            system_cpu_usage: Some(2000),
            presystem_cpu_usage: Some(1000),
            online_cpus: Some(4),
            memory_usage: Some(512),
            memory_limit: Some(2048),
        };
        // (200 / 1000) * 4 * 100 = 80%
        assert!((cpu_percent(&stats) - 80.0).abs() < f64::EPSILON);
        assert!((memory_percent(&stats) - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cpu_percent_degenerate_samples() {
        // Missing or non-advancing system counters yield zero, not NaN.
        let stats = EngineStats {
            cpu_total_usage: 100,
            precpu_total_usage: 50,
            system_cpu_usage: None,
            ..EngineStats::default()
        };
        assert_eq!(cpu_percent(&stats), 0.0);

        let stats = EngineStats {
            cpu_total_usage: 100,
            precpu_total_usage: 50,
            system_cpu_usage: Some(1000),
            presystem_cpu_usage: Some(1000),
            ..EngineStats::default()
        };
        assert_eq!(cpu_percent(&stats), 0.0);
        assert_eq!(memory_percent(&stats), 0.0);
    }

    #[tokio::test]
    async fn test_reconcile_requires_init() {
        let driver = DockerDriver::new(Arc::new(FakeFacade::new()));
        assert!(matches!(
            driver.reconcile().await,
            Err(DriverError::NotReady)
        ));
    }

    #[tokio::test]
    async fn test_reconcile_passes_apps_through_and_emits_completion() {
        let facade = Arc::new(FakeFacade::new());
        let driver = DockerDriver::new(facade.clone());
        driver.init().await.unwrap();
        let mut events = driver.subscribe();

        let mut state = TargetState::default();
        state.apps.insert(
            "1".into(),
            AppConfig {
                app_id: 1,
                app_name: "gateway".into(),
                ..AppConfig::default()
            },
        );
        driver.set_target_state(state.clone()).await.unwrap();
        let result = driver.reconcile().await.unwrap();
        assert!(result.success());

        assert_eq!(facade.applied.lock().unwrap().len(), 1);
        assert!(matches!(
            events.try_recv(),
            Ok(DriverEvent::ReconciliationComplete { .. })
        ));
    }

    #[tokio::test]
    async fn test_direct_service_ops_are_gated_off() {
        let driver = DockerDriver::new(Arc::new(FakeFacade::new()));
        assert!(!driver.capabilities().direct_service_ops);
        assert!(matches!(
            driver.stop_service(1).await,
            Err(DriverError::NotSupported { .. })
        ));
    }
}
