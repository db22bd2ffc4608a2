//! Top-level state reconciler.
//!
//! Owns the authoritative target state, persists it durably (hash-deduped),
//! and drives container and configuration reconciliation in a fixed order:
//! containers first, configuration second, because configuration may depend
//! on protocol-adapter containers already running.
//!
//! At most one reconcile pass runs at a time. A request arriving mid-pass is
//! skipped, but never lost: it marks the state dirty and the running pass
//! re-runs once after finishing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};

use edgewise_core::manager::{ConfigManager, ContainerManager, ManagerError};
use edgewise_core::model::{CurrentState, ReconciliationResult, TargetState};

use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug)]
pub enum ReconcilerEvent {
    TargetStateChanged,
    ContainersApplied { result: ReconciliationResult },
    ConfigApplied,
    ReconcileFinished { result: ReconciliationResult },
    ReconcileSkipped,
}

#[derive(Clone, Debug)]
pub enum ReconcileOutcome {
    Completed(ReconciliationResult),
    /// Another pass was in flight; it will re-run for this request.
    Skipped,
}

pub struct StateReconciler {
    containers: Arc<dyn ContainerManager>,
    device_config: Arc<dyn ConfigManager>,
    store: Arc<Store>,
    target: RwLock<Option<TargetState>>,
    in_flight: Mutex<()>,
    dirty: AtomicBool,
    events: broadcast::Sender<ReconcilerEvent>,
}

impl StateReconciler {
    pub fn new(
        containers: Arc<dyn ContainerManager>,
        device_config: Arc<dyn ConfigManager>,
        store: Arc<Store>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            containers,
            device_config,
            store,
            target: RwLock::new(None),
            in_flight: Mutex::new(()),
            dirty: AtomicBool::new(false),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconcilerEvent> {
        self.events.subscribe()
    }

    /// Initialize both managers and restore the persisted target state.
    pub async fn init(&self) -> Result<(), ReconcilerError> {
        self.containers.init().await?;
        self.device_config.init().await?;

        if let Some(state) = self.store.load_target_state().await? {
            info!(apps = state.apps.len(), "restored persisted target state");
            *self.target.write().await = Some(state);
        }
        Ok(())
    }

    /// Replace the target state wholesale: deep-copy, persist (skipped when
    /// the content hash is unchanged), announce, then reconcile.
    pub async fn set_target(
        &self,
        state: &TargetState,
    ) -> Result<ReconcileOutcome, ReconcilerError> {
        // The config block is guaranteed present by construction; a document
        // that omitted it deserialized to the defaults.
        let state = state.clone();
        let written = self.store.save_target_state(&state).await?;
        if !written {
            debug!("target state content unchanged");
        }
        *self.target.write().await = Some(state);
        let _ = self.events.send(ReconcilerEvent::TargetStateChanged);
        self.reconcile().await
    }

    /// Run one reconcile pass, or skip if one is already running. The
    /// skipped request flags the running pass to go around again.
    pub async fn reconcile(&self) -> Result<ReconcileOutcome, ReconcilerError> {
        let guard = match self.in_flight.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.dirty.store(true, Ordering::SeqCst);
                debug!("reconcile already in flight, marking dirty");
                let _ = self.events.send(ReconcilerEvent::ReconcileSkipped);
                return Ok(ReconcileOutcome::Skipped);
            }
        };

        let mut result = self.run_pass().await?;
        while self.dirty.swap(false, Ordering::SeqCst) {
            debug!("state changed during pass, reconciling again");
            result = self.run_pass().await?;
        }
        drop(guard);
        Ok(ReconcileOutcome::Completed(result))
    }

    async fn run_pass(&self) -> Result<ReconciliationResult, ReconcilerError> {
        let Some(target) = self.target.read().await.clone() else {
            debug!("no target state, nothing to reconcile");
            return Ok(ReconciliationResult::empty());
        };

        // Containers first, configuration second.
        let result = self.containers.set_target(&target.apps).await?;
        let _ = self.events.send(ReconcilerEvent::ContainersApplied {
            result: result.clone(),
        });

        self.device_config.set_target(&target.config.vars).await?;
        let _ = self.events.send(ReconcilerEvent::ConfigApplied);

        if result.success() {
            info!(
                created = result.created,
                updated = result.updated,
                removed = result.removed,
                "reconcile pass complete"
            );
        } else {
            warn!(
                errors = result.errors.len(),
                "reconcile pass finished with failures"
            );
        }
        let _ = self.events.send(ReconcilerEvent::ReconcileFinished {
            result: result.clone(),
        });
        Ok(result)
    }

    pub async fn get_target_state(&self) -> Option<TargetState> {
        self.target.read().await.clone()
    }

    pub async fn get_current_state(&self) -> Result<CurrentState, ReconcilerError> {
        Ok(self.containers.get_current_state().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use edgewise_core::model::AppConfig;

    type OrderLog = Arc<StdMutex<Vec<&'static str>>>;

    struct SlowContainers {
        order: OrderLog,
        delay: Duration,
        applies: StdMutex<u32>,
    }

    #[async_trait]
    impl ContainerManager for SlowContainers {
        async fn init(&self) -> Result<(), ManagerError> {
            Ok(())
        }

        async fn set_target(
            &self,
            _apps: &BTreeMap<String, AppConfig>,
        ) -> Result<ReconciliationResult, ManagerError> {
            tokio::time::sleep(self.delay).await;
            self.order.lock().unwrap().push("containers");
            *self.applies.lock().unwrap() += 1;
            Ok(ReconciliationResult::empty())
        }

        async fn get_current_state(&self) -> Result<CurrentState, ManagerError> {
            Ok(CurrentState::empty())
        }
    }

    struct RecordingConfig {
        order: OrderLog,
    }

    #[async_trait]
    impl ConfigManager for RecordingConfig {
        async fn init(&self) -> Result<(), ManagerError> {
            Ok(())
        }

        async fn set_target(&self, _vars: &BTreeMap<String, String>) -> Result<(), ManagerError> {
            self.order.lock().unwrap().push("config");
            Ok(())
        }

        async fn get_current(&self) -> Result<BTreeMap<String, String>, ManagerError> {
            Ok(BTreeMap::new())
        }
    }

    async fn reconciler(delay: Duration) -> (Arc<StateReconciler>, Arc<SlowContainers>, OrderLog) {
        let order: OrderLog = Arc::new(StdMutex::new(Vec::new()));
        let containers = Arc::new(SlowContainers {
            order: order.clone(),
            delay,
            applies: StdMutex::new(0),
        });
        let config = Arc::new(RecordingConfig {
            order: order.clone(),
        });
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let reconciler = Arc::new(StateReconciler::new(
            containers.clone(),
            config,
            store,
        ));
        reconciler.init().await.unwrap();
        (reconciler, containers, order)
    }

    fn sample_state() -> TargetState {
        let mut state = TargetState::default();
        state.apps.insert(
            "1".into(),
            AppConfig {
                app_id: 1,
                app_name: "gateway".into(),
                ..AppConfig::default()
            },
        );
        state
    }

    #[tokio::test]
    async fn test_containers_apply_before_config() {
        let (reconciler, _, order) = reconciler(Duration::ZERO).await;
        let outcome = reconciler.set_target(&sample_state()).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Completed(_)));
        assert_eq!(*order.lock().unwrap(), vec!["containers", "config"]);
    }

    #[tokio::test]
    async fn test_reconcile_without_target_is_a_noop() {
        let (reconciler, containers, _) = reconciler(Duration::ZERO).await;
        let outcome = reconciler.reconcile().await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Completed(_)));
        assert_eq!(*containers.applies.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_request_skips_then_reruns() {
        let (reconciler, containers, _) = reconciler(Duration::from_millis(80)).await;
        reconciler.set_target(&sample_state()).await.unwrap();
        assert_eq!(*containers.applies.lock().unwrap(), 1);

        let first = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.reconcile().await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = reconciler.reconcile().await.unwrap();
        assert!(matches!(second, ReconcileOutcome::Skipped));

        let first = first.await.unwrap();
        assert!(matches!(first, ReconcileOutcome::Completed(_)));
        // One pass for the in-flight request, one re-run for the skipped one.
        assert_eq!(*containers.applies.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_target_state_survives_restart() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let order: OrderLog = Arc::new(StdMutex::new(Vec::new()));
        let make = |store: Arc<Store>, order: OrderLog| {
            StateReconciler::new(
                Arc::new(SlowContainers {
                    order: order.clone(),
                    delay: Duration::ZERO,
                    applies: StdMutex::new(0),
                }),
                Arc::new(RecordingConfig { order }),
                store,
            )
        };

        let first = make(store.clone(), order.clone());
        first.init().await.unwrap();
        first.set_target(&sample_state()).await.unwrap();
        drop(first);

        let second = make(store, order);
        second.init().await.unwrap();
        let restored = second.get_target_state().await.unwrap();
        assert_eq!(restored.apps["1"].app_name, "gateway");
    }
}
