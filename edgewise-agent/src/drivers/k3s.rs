//! Lightweight-orchestration driver.
//!
//! Maps the abstract service model onto a Kubernetes-style API: one
//! Deployment per service in the configured namespace, identity carried in
//! labels. Stopping scales to zero instead of deleting; restarting bumps a
//! timestamp annotation to trigger a rolling restart. Network and volume
//! operations are out of scope here: the platform's network model is
//! structurally different from the container-engine one.

use std::sync::RwLock as StdRwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use edgewise_core::diff;
use edgewise_core::driver::{
    Driver, DriverCapabilities, DriverError, DriverEvent, DriverHealth, LogLines,
};
use edgewise_core::model::{
    AppId, CurrentState, K3sSettings, LogOptions, NetworkConfig, ReconciliationResult,
    ServiceConfig, ServiceId, ServiceMetrics, ServiceStatus, TargetState, VolumeConfig,
    group_services,
};

use super::manifest::{
    self, Deployment, DeploymentList, LABEL_MANAGED, LABEL_SERVICE_ID, Namespace, ObjectMeta,
    PodList, RESTART_ANNOTATION,
};

const MERGE_PATCH: &str = "application/merge-patch+json";

fn scale_patch(replicas: u32) -> serde_json::Value {
    json!({"spec": {"replicas": replicas}})
}

fn restart_patch(stamp: &str) -> serde_json::Value {
    json!({
        "spec": {"template": {"metadata": {"annotations": {RESTART_ANNOTATION: stamp}}}}
    })
}

pub struct K3sDriver {
    settings: K3sSettings,
    client: StdRwLock<Option<reqwest::Client>>,
    target: RwLock<Option<TargetState>>,
    ready: AtomicBool,
    last_healthy: AtomicBool,
    events: broadcast::Sender<DriverEvent>,
}

impl K3sDriver {
    pub fn new(settings: K3sSettings) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            settings,
            client: StdRwLock::new(None),
            target: RwLock::new(None),
            ready: AtomicBool::new(false),
            last_healthy: AtomicBool::new(false),
            events,
        }
    }

    fn client(&self) -> Result<reqwest::Client, DriverError> {
        self.client
            .read()
            .expect("client lock poisoned")
            .clone()
            .ok_or(DriverError::NotReady)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.server.trim_end_matches('/'), path)
    }

    fn deployments_path(&self) -> String {
        format!(
            "/apis/apps/v1/namespaces/{}/deployments",
            self.settings.namespace
        )
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.settings.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn check_response(
        context: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, DriverError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(DriverError::Api(format!("{context}: {status}: {body}")))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, DriverError> {
        let request = self
            .authorized(self.client()?.get(self.url(path)))
            .query(query);
        let response = request
            .send()
            .await
            .map_err(|e| DriverError::Api(e.to_string()))?;
        let response = Self::check_response(path, response).await?;
        response
            .json()
            .await
            .map_err(|e| DriverError::Api(format!("{path}: bad response body: {e}")))
    }

    async fn post_json<B: serde::Serialize>(&self, path: &str, body: &B) -> Result<(), DriverError> {
        let response = self
            .authorized(self.client()?.post(self.url(path)))
            .json(body)
            .send()
            .await
            .map_err(|e| DriverError::Api(e.to_string()))?;
        Self::check_response(path, response).await?;
        Ok(())
    }

    async fn patch_merge(&self, path: &str, body: &serde_json::Value) -> Result<(), DriverError> {
        let response = self
            .authorized(self.client()?.patch(self.url(path)))
            .header(reqwest::header::CONTENT_TYPE, MERGE_PATCH)
            .body(serde_json::to_vec(body)?)
            .send()
            .await
            .map_err(|e| DriverError::Api(e.to_string()))?;
        Self::check_response(path, response).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), DriverError> {
        let response = self
            .authorized(self.client()?.delete(self.url(path)))
            .send()
            .await
            .map_err(|e| DriverError::Api(e.to_string()))?;
        Self::check_response(path, response).await?;
        Ok(())
    }

    /// Create the namespace when absent, labeled as agent-managed.
    async fn ensure_namespace(&self) -> Result<(), DriverError> {
        let path = format!("/api/v1/namespaces/{}", self.settings.namespace);
        let response = self
            .authorized(self.client()?.get(self.url(&path)))
            .send()
            .await
            .map_err(|e| DriverError::Api(e.to_string()))?;

        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != reqwest::StatusCode::NOT_FOUND {
            Self::check_response(&path, response).await?;
            return Ok(());
        }

        info!(namespace = %self.settings.namespace, "creating namespace");
        let namespace = Namespace {
            api_version: "v1".into(),
            kind: "Namespace".into(),
            metadata: ObjectMeta {
                name: self.settings.namespace.clone(),
                namespace: None,
                labels: [(LABEL_MANAGED.to_string(), "true".to_string())]
                    .into_iter()
                    .collect(),
                annotations: Default::default(),
            },
        };
        self.post_json("/api/v1/namespaces", &namespace).await
    }

    /// All managed workloads in the namespace, reverse-mapped to services.
    async fn list_managed(&self) -> Result<Vec<ServiceConfig>, DriverError> {
        let selector = format!("{LABEL_MANAGED}=true");
        let list: DeploymentList = self
            .get_json(&self.deployments_path(), &[("labelSelector", selector.as_str())])
            .await?;
        Ok(list
            .items
            .iter()
            .filter_map(manifest::service_from_deployment)
            .collect())
    }

    async fn find_service(&self, service_id: ServiceId) -> Result<ServiceConfig, DriverError> {
        self.list_managed()
            .await?
            .into_iter()
            .find(|s| s.service_id == service_id)
            .ok_or_else(|| DriverError::ServiceNotFound(service_id.to_string()))
    }

    fn deployment_path_for(&self, name: &str) -> String {
        format!("{}/{}", self.deployments_path(), name)
    }

    async fn apply_deployment(&self, manifest: &Deployment, exists: bool) -> Result<(), DriverError> {
        if exists {
            // Merge-patch the full desired manifest; replace-style updates
            // would need resourceVersion plumbing.
            let body = serde_json::to_value(manifest)?;
            self.patch_merge(&self.deployment_path_for(&manifest.metadata.name), &body)
                .await
        } else {
            self.post_json(&self.deployments_path(), manifest).await
        }
    }
}

#[async_trait]
impl Driver for K3sDriver {
    fn name(&self) -> &'static str {
        "k3s"
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            direct_service_ops: true,
            networks: false,
            volumes: false,
            metrics: false,
        }
    }

    async fn init(&self) -> Result<(), DriverError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(self.settings.insecure_skip_tls_verify)
            .build()
            .map_err(|e| DriverError::Init {
                driver: "k3s",
                message: format!("http client build failed: {e}"),
            })?;
        *self.client.write().expect("client lock poisoned") = Some(client);

        let response = self
            .authorized(self.client()?.get(self.url("/version")))
            .send()
            .await
            .map_err(|e| DriverError::Init {
                driver: "k3s",
                message: format!("api server unreachable at {}: {e}", self.settings.server),
            })?;
        Self::check_response("/version", response)
            .await
            .map_err(|e| DriverError::Init {
                driver: "k3s",
                message: e.to_string(),
            })?;

        self.ensure_namespace().await.map_err(|e| DriverError::Init {
            driver: "k3s",
            message: format!("namespace setup failed: {e}"),
        })?;

        self.ready.store(true, Ordering::SeqCst);
        self.last_healthy.store(true, Ordering::SeqCst);
        info!(driver = self.name(), server = %self.settings.server, "driver initialized");
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
        let probe = async {
            let response = self
                .authorized(self.client()?.get(self.url("/version")))
                .send()
                .await
                .map_err(|e| DriverError::Api(e.to_string()))?;
            Self::check_response("/version", response).await
        };
        let (healthy, message) = match probe.await {
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
        let target_services: Vec<ServiceConfig> = target
            .map(|t| t.services().cloned().collect())
            .unwrap_or_default();
        let current_services = self.list_managed().await?;
        let plan = diff::plan(&target_services, &current_services);

        let mut result = ReconciliationResult::empty();

        for service in &plan.create {
            let manifest = manifest::deployment_for(service, &self.settings.namespace);
            match self.apply_deployment(&manifest, false).await {
                Ok(()) => {
                    result.created += 1;
                    let _ = self.events.send(DriverEvent::ServiceStarted {
                        service_id: service.service_id,
                        service_name: service.service_name.clone(),
                    });
                }
                Err(e) => {
                    warn!(service = %service.service_name, error = %e, "create failed");
                    result.record_error(service.service_name.clone(), &e);
                    let _ = self.events.send(DriverEvent::ServiceError {
                        service_name: service.service_name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        for update in &plan.update {
            let manifest = manifest::deployment_for(&update.target, &self.settings.namespace);
            match self.apply_deployment(&manifest, true).await {
                Ok(()) => result.updated += 1,
                Err(e) => {
                    warn!(service = %update.target.service_name, error = %e, "update failed");
                    result.record_error(update.target.service_name.clone(), &e);
                    let _ = self.events.send(DriverEvent::ServiceError {
                        service_name: update.target.service_name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        for service in &plan.remove {
            let name = service
                .container_id
                .clone()
                .unwrap_or_else(|| manifest::deployment_name(service));
            match self.delete(&self.deployment_path_for(&name)).await {
                Ok(()) => {
                    result.removed += 1;
                    let _ = self.events.send(DriverEvent::ServiceStopped {
                        service_id: service.service_id,
                        service_name: service.service_name.clone(),
                    });
                }
                Err(e) => {
                    warn!(service = %service.service_name, error = %e, "remove failed");
                    result.record_error(service.service_name.clone(), &e);
                }
            }
        }

        result.timestamp = Utc::now();
        let _ = self.events.send(DriverEvent::ReconciliationComplete {
            result: result.clone(),
        });
        Ok(result)
    }

    async fn get_current_state(&self) -> Result<CurrentState, DriverError> {
        let services = self.list_managed().await?;
        Ok(CurrentState {
            apps: group_services(services),
            timestamp: Utc::now(),
        })
    }

    async fn create_service(&self, service: &ServiceConfig) -> Result<(), DriverError> {
        let manifest = manifest::deployment_for(service, &self.settings.namespace);
        self.apply_deployment(&manifest, false).await
    }

    /// Scale to zero rather than delete: the workload stays defined.
    async fn stop_service(&self, service_id: ServiceId) -> Result<(), DriverError> {
        let service = self.find_service(service_id).await?;
        let name = service
            .container_id
            .clone()
            .unwrap_or_else(|| manifest::deployment_name(&service));
        self.patch_merge(&self.deployment_path_for(&name), &scale_patch(0))
            .await?;
        let _ = self.events.send(DriverEvent::ServiceStopped {
            service_id,
            service_name: service.service_name,
        });
        Ok(())
    }

    async fn remove_service(&self, service_id: ServiceId) -> Result<(), DriverError> {
        let service = self.find_service(service_id).await?;
        let name = service
            .container_id
            .clone()
            .unwrap_or_else(|| manifest::deployment_name(&service));
        self.delete(&self.deployment_path_for(&name)).await
    }

    /// Rolling restart through a timestamp annotation on the pod template.
    async fn restart_service(&self, service_id: ServiceId) -> Result<(), DriverError> {
        let service = self.find_service(service_id).await?;
        let name = service
            .container_id
            .clone()
            .unwrap_or_else(|| manifest::deployment_name(&service));
        self.patch_merge(
            &self.deployment_path_for(&name),
            &restart_patch(&Utc::now().to_rfc3339()),
        )
        .await?;
        let _ = self.events.send(DriverEvent::ServiceStarted {
            service_id,
            service_name: service.service_name,
        });
        Ok(())
    }

    async fn service_status(&self, service_id: ServiceId) -> Result<ServiceStatus, DriverError> {
        let service = self.find_service(service_id).await?;
        Ok(service.service_status.unwrap_or_default())
    }

    async fn list_services(&self) -> Result<Vec<ServiceConfig>, DriverError> {
        self.list_managed().await
    }

    async fn service_logs(
        &self,
        service_id: ServiceId,
        opts: &LogOptions,
    ) -> Result<LogLines, DriverError> {
        let selector = format!("{LABEL_SERVICE_ID}={service_id}");
        let pods: PodList = self
            .get_json(
                &format!("/api/v1/namespaces/{}/pods", self.settings.namespace),
                &[("labelSelector", selector.as_str())],
            )
            .await?;
        let pod = pods
            .items
            .first()
            .map(|p| p.metadata.name.clone())
            .ok_or_else(|| DriverError::ServiceNotFound(service_id.to_string()))?;

        let path = format!(
            "/api/v1/namespaces/{}/pods/{}/log",
            self.settings.namespace, pod
        );
        let mut query: Vec<(String, String)> = Vec::new();
        if let Some(tail) = opts.tail {
            query.push(("tailLines".into(), tail.to_string()));
        }
        if opts.timestamps {
            query.push(("timestamps".into(), "true".into()));
        }
        if let Some(since) = opts.since {
            query.push(("sinceTime".into(), since.to_rfc3339()));
        }
        if opts.follow {
            query.push(("follow".into(), "true".into()));
        }

        let response = self
            .authorized(self.client()?.get(self.url(&path)))
            .query(&query)
            .send()
            .await
            .map_err(|e| DriverError::Api(e.to_string()))?;
        let response = Self::check_response(&path, response).await?;

        let stream = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| String::from_utf8_lossy(&bytes).trim_end().to_string())
                    .map_err(|e| DriverError::Api(e.to_string()))
            })
            .boxed();
        Ok(stream)
    }

    async fn service_metrics(
        &self,
        _service_id: ServiceId,
    ) -> Result<ServiceMetrics, DriverError> {
        Err(DriverError::not_supported(
            "service_metrics: no metrics pipeline on this backend",
        ))
    }

    async fn create_network(
        &self,
        _app_id: AppId,
        _name: &str,
        _config: &NetworkConfig,
    ) -> Result<(), DriverError> {
        Err(DriverError::not_supported(
            "create_network: the platform's network model has no per-app networks",
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
        Err(DriverError::not_supported("create_volume"))
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

    #[test]
    fn test_scale_patch_shape() {
        assert_eq!(
            scale_patch(0).to_string(),
            r#"{"spec":{"replicas":0}}"#
        );
    }

    #[test]
    fn test_restart_patch_targets_template_annotation() {
        let patch = restart_patch("2026-08-07T00:00:00Z");
        assert_eq!(
            patch["spec"]["template"]["metadata"]["annotations"][RESTART_ANNOTATION],
            "2026-08-07T00:00:00Z"
        );
    }

    #[test]
    fn test_paths_include_namespace() {
        let driver = K3sDriver::new(K3sSettings {
            server: "https://127.0.0.1:6443/".into(),
            namespace: "fleet".into(),
            ..K3sSettings::default()
        });
        assert_eq!(
            driver.deployments_path(),
            "/apis/apps/v1/namespaces/fleet/deployments"
        );
        assert_eq!(
            driver.url("/version"),
            "https://127.0.0.1:6443/version"
        );
    }

    #[test]
    fn test_capabilities_reflect_platform_gaps() {
        let driver = K3sDriver::new(K3sSettings::default());
        let caps = driver.capabilities();
        assert!(caps.direct_service_ops);
        assert!(!caps.networks);
        assert!(!caps.volumes);
        assert!(!caps.metrics);
    }
}
