//! Driver selection and construction.
//!
//! A compile-time registry maps each orchestrator kind to a constructor;
//! registry order is also the auto-detection priority order (container
//! engine first). Construction is lazy: the non-selected backend is never
//! built.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use edgewise_core::config::AgentConfig;
use edgewise_core::driver::{Driver, DriverError};
use edgewise_core::model::{OrchestratorKind, TargetState};

use crate::drivers::{DockerDriver, K3sDriver};
use crate::facade::DockerFacade;

type DriverCtor = fn(&AgentConfig) -> Box<dyn Driver>;

fn docker_driver(config: &AgentConfig) -> Box<dyn Driver> {
    let facade = Arc::new(DockerFacade::new(config.docker.clone()));
    Box::new(DockerDriver::new(facade))
}

fn k3s_driver(config: &AgentConfig) -> Box<dyn Driver> {
    Box::new(K3sDriver::new(config.k3s.clone()))
}

/// Probe order: container engine first, lightweight orchestration second.
const REGISTRY: &[(OrchestratorKind, DriverCtor)] = &[
    (OrchestratorKind::Docker, docker_driver),
    (OrchestratorKind::K3s, k3s_driver),
];

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("failed to initialize '{driver}' driver: {source}")]
    InitFailed {
        driver: &'static str,
        #[source]
        source: DriverError,
    },
    #[error("failed to apply initial target state to '{driver}' driver: {source}")]
    TargetFailed {
        driver: &'static str,
        #[source]
        source: DriverError,
    },
}

pub struct DriverFactory {
    config: AgentConfig,
    initial_target: Option<TargetState>,
}

impl DriverFactory {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            initial_target: None,
        }
    }

    /// Target state to apply to the driver right after a successful init,
    /// before it is handed to the caller.
    pub fn with_initial_target(mut self, target: TargetState) -> Self {
        self.initial_target = Some(target);
        self
    }

    fn constructor(kind: OrchestratorKind) -> DriverCtor {
        REGISTRY
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, ctor)| *ctor)
            .expect("registry covers every orchestrator kind")
    }

    /// Construct and initialize the selected driver. Init failures come back
    /// wrapped with the driver name; the caller never sees a raw backend
    /// error without context.
    pub async fn create(&self, kind: OrchestratorKind) -> Result<Box<dyn Driver>, FactoryError> {
        let driver = Self::constructor(kind)(&self.config);
        driver.init().await.map_err(|source| FactoryError::InitFailed {
            driver: driver.name(),
            source,
        })?;

        if let Some(target) = &self.initial_target {
            driver
                .set_target_state(target.clone())
                .await
                .map_err(|source| FactoryError::TargetFailed {
                    driver: driver.name(),
                    source,
                })?;
        }

        info!(driver = driver.name(), "driver ready");
        Ok(driver)
    }

    /// Probe candidates in registry order (construct, init, shutdown); the
    /// first to complete the probe wins. When every probe fails, report the
    /// first candidate as a lenient default so agent startup never blocks on
    /// a broken probe environment; each failure is logged, and the real
    /// construction later will surface the actual cause.
    pub async fn detect_orchestrator(&self) -> OrchestratorKind {
        for (kind, ctor) in REGISTRY {
            let driver = ctor(&self.config);
            match driver.init().await {
                Ok(()) => {
                    let _ = driver.shutdown().await;
                    info!(orchestrator = %kind, "orchestrator detected");
                    return *kind;
                }
                Err(e) => {
                    warn!(orchestrator = %kind, error = %e, "orchestrator probe failed");
                }
            }
        }
        let fallback = REGISTRY[0].0;
        warn!(
            orchestrator = %fallback,
            "no orchestrator answered a probe, defaulting to the first candidate"
        );
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_order_is_engine_first() {
        assert_eq!(REGISTRY[0].0, OrchestratorKind::Docker);
        assert_eq!(REGISTRY[1].0, OrchestratorKind::K3s);
    }

    #[test]
    fn test_every_kind_has_a_constructor() {
        for kind in [OrchestratorKind::Docker, OrchestratorKind::K3s] {
            let _ = DriverFactory::constructor(kind);
        }
    }

    #[test]
    fn test_init_failure_carries_driver_name() {
        let err = FactoryError::InitFailed {
            driver: "k3s",
            source: DriverError::Init {
                driver: "k3s",
                message: "api server unreachable".into(),
            },
        };
        let text = err.to_string();
        assert!(text.contains("k3s"));
        assert!(text.contains("api server unreachable"));
    }
}
