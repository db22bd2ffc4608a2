//! Shared data shapes for the orchestration core.
//!
//! The target/current state documents are wire-shaped (camelCase JSON, the
//! format the cloud control point speaks); the agent's own on-disk
//! configuration lives in [`crate::config`] instead.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type AppId = u32;
pub type ServiceId = u32;

/// Which runtime backend manages workloads on this device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorKind {
    #[default]
    Docker,
    K3s,
}

impl OrchestratorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestratorKind::Docker => "docker",
            OrchestratorKind::K3s => "k3s",
        }
    }
}

impl std::fmt::Display for OrchestratorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown orchestrator '{0}', expected one of: docker, k3s")]
pub struct UnknownOrchestrator(pub String);

impl std::str::FromStr for OrchestratorKind {
    type Err = UnknownOrchestrator;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" => Ok(OrchestratorKind::Docker),
            "k3s" => Ok(OrchestratorKind::K3s),
            other => Err(UnknownOrchestrator(other.to_string())),
        }
    }
}

/// Observed lifecycle state of a service instance.
///
/// Transitions are driver-observed facts, not commands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Creating,
    Running,
    Stopped,
    Error,
    #[default]
    Unknown,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

/// Driver-observed status of one service instance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub state: ServiceState,
    #[serde(default)]
    pub health: HealthState,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Classified failure kinds, matching the vocabulary upstream backoff
/// policies key on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceErrorKind {
    ImagePullBackOff,
    ErrImagePull,
    StartFailure,
    CrashLoopBackOff,
    Unknown,
}

impl ServiceErrorKind {
    /// Derive a failure class from a raw engine error message.
    pub fn classify(message: &str) -> Self {
        let m = message.to_ascii_lowercase();
        if m.contains("back-off pulling") || (m.contains("pull") && m.contains("retrying")) {
            ServiceErrorKind::ImagePullBackOff
        } else if m.contains("pull access denied")
            || m.contains("manifest unknown")
            || m.contains("manifest for")
            || (m.contains("pull") && m.contains("not found"))
            || m.contains("no such image")
        {
            ServiceErrorKind::ErrImagePull
        } else if m.contains("crashloop") || m.contains("restarting too quickly") {
            ServiceErrorKind::CrashLoopBackOff
        } else if m.contains("failed to start")
            || m.contains("oci runtime")
            || m.contains("cannot start")
        {
            ServiceErrorKind::StartFailure
        } else {
            ServiceErrorKind::Unknown
        }
    }
}

/// A classified service failure with retry bookkeeping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    pub message: String,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry: Option<DateTime<Utc>>,
}

impl ServiceError {
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: ServiceErrorKind::classify(&message),
            message,
            retries: 0,
            next_retry: None,
        }
    }
}

/// Probe timing parameters shared by every probe type.
///
/// Unset fields take the target platform's defaults when translated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeTiming {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
}

/// Health probe configuration (liveness/readiness/startup).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HealthProbe {
    Http {
        path: String,
        port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scheme: Option<String>,
        #[serde(flatten)]
        timing: ProbeTiming,
    },
    Tcp {
        #[serde(rename = "tcpPort")]
        tcp_port: u16,
        #[serde(flatten)]
        timing: ProbeTiming,
    },
    Exec {
        command: Vec<String>,
        #[serde(flatten)]
        timing: ProbeTiming,
    },
}

impl HealthProbe {
    pub fn timing(&self) -> &ProbeTiming {
        match self {
            HealthProbe::Http { timing, .. }
            | HealthProbe::Tcp { timing, .. }
            | HealthProbe::Exec { timing, .. } => timing,
        }
    }
}

fn default_protocol() -> String {
    "tcp".into()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub container_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Limits/requests are passed through to the backend verbatim.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    UnlessStopped,
    Never,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default)]
    pub internal: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// The runtime spec of one deployable unit: what to run and how.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub image: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceLimits>,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<HealthProbe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<HealthProbe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_probe: Option<HealthProbe>,
}

/// One deployable unit. `service_id` is globally unique and stable; every
/// reconciliation match is keyed on it, never on name or image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub service_id: ServiceId,
    pub service_name: String,
    pub app_id: AppId,
    pub app_name: String,
    /// None defaults to 1. `Some(0)` means intentionally stopped with the
    /// config retained in the target document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    pub config: ServiceSpec,

    // Runtime-observed fields below; driver-populated, never author-set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_status: Option<ServiceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ServiceError>,
}

impl ServiceConfig {
    pub fn desired_replicas(&self) -> u32 {
        self.replicas.unwrap_or(1)
    }
}

/// A named group of services sharing an `app_id`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub app_id: AppId,
    pub app_name: String,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, NetworkConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, VolumeConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DockerSettings {
    /// Engine socket path; local platform defaults when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
    pub network_prefix: String,
}

impl DockerSettings {
    pub fn network_prefix(&self) -> &str {
        if self.network_prefix.is_empty() {
            "edgewise"
        } else {
            &self.network_prefix
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct K3sSettings {
    pub server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub namespace: String,
    /// Accept the API server's certificate without verification. Common on
    /// single-node k3s installs with self-signed certs.
    pub insecure_skip_tls_verify: bool,
}

impl Default for K3sSettings {
    fn default() -> Self {
        Self {
            server: "https://127.0.0.1:6443".into(),
            token: None,
            namespace: "edgewise".into(),
            insecure_skip_tls_verify: false,
        }
    }
}

fn default_poll_interval() -> u64 {
    60
}

/// The `config` block of the target state: orchestrator choice, per-driver
/// settings, polling intervals, feature flags, and the device configuration
/// variables reconciled by the config manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceSettings {
    pub orchestrator: OrchestratorKind,
    pub docker: DockerSettings,
    pub k3s: K3sSettings,
    pub poll_interval_secs: u64,
    pub features: BTreeMap<String, bool>,
    pub vars: BTreeMap<String, String>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorKind::default(),
            docker: DockerSettings::default(),
            k3s: K3sSettings::default(),
            poll_interval_secs: default_poll_interval(),
            features: BTreeMap::new(),
            vars: BTreeMap::new(),
        }
    }
}

/// The desired world: apps keyed by `app_id` (stringified) plus the device
/// configuration block. Replaced wholesale on every push, never mutated in
/// place, and the single artifact persisted to durable storage.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetState {
    #[serde(default)]
    pub apps: BTreeMap<String, AppConfig>,
    #[serde(default)]
    pub config: DeviceSettings,
}

impl TargetState {
    pub fn services(&self) -> impl Iterator<Item = &ServiceConfig> {
        self.apps.values().flat_map(|app| app.services.iter())
    }
}

/// A snapshot of what a driver observes running. Re-derived from the runtime
/// on every query; never persisted authoritatively.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentState {
    #[serde(default)]
    pub apps: BTreeMap<String, AppConfig>,
    pub timestamp: DateTime<Utc>,
}

impl CurrentState {
    pub fn empty() -> Self {
        Self {
            apps: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceConfig> {
        self.apps.values().flat_map(|app| app.services.iter())
    }
}

/// Group a flat service list back into an apps map keyed by `app_id`.
pub fn group_services(services: Vec<ServiceConfig>) -> BTreeMap<String, AppConfig> {
    let mut apps: BTreeMap<String, AppConfig> = BTreeMap::new();
    for service in services {
        let entry = apps
            .entry(service.app_id.to_string())
            .or_insert_with(|| AppConfig {
                app_id: service.app_id,
                app_name: service.app_name.clone(),
                ..AppConfig::default()
            });
        entry.services.push(service);
    }
    apps
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationError {
    pub service_name: String,
    pub error: String,
}

/// Outcome of one reconcile pass. Produced once per call, never partially
/// overwritten.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationResult {
    pub created: u32,
    pub updated: u32,
    pub removed: u32,
    #[serde(default)]
    pub errors: Vec<ReconciliationError>,
    pub timestamp: DateTime<Utc>,
}

impl ReconciliationResult {
    pub fn empty() -> Self {
        Self {
            created: 0,
            updated: 0,
            removed: 0,
            errors: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn record_error(&mut self, service_name: impl Into<String>, error: impl ToString) {
        self.errors.push(ReconciliationError {
            service_name: service_name.into(),
            error: error.to_string(),
        });
    }
}

/// Point-in-time resource usage of one service instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetrics {
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_percent: f64,
    pub timestamp: DateTime<Utc>,
}

/// Raw cumulative counters from one engine stats sample. The current and
/// pre-sample counters are consecutive readings; percentage math lives in
/// the driver.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub cpu_total_usage: u64,
    pub system_cpu_usage: Option<u64>,
    pub precpu_total_usage: u64,
    pub presystem_cpu_usage: Option<u64>,
    pub online_cpus: Option<u32>,
    pub memory_usage: Option<u64>,
    pub memory_limit: Option<u64>,
}

/// Options for log retrieval by container identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogOptions {
    pub follow: bool,
    pub tail: Option<u32>,
    pub since: Option<DateTime<Utc>>,
    pub timestamps: bool,
    pub stdout: bool,
    pub stderr: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            follow: false,
            tail: None,
            since: None,
            timestamps: false,
            stdout: true,
            stderr: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_target_json() -> &'static str {
        r#"{
            "apps": {
                "1001": {
                    "appId": 1001,
                    "appName": "gateway",
                    "services": [
                        {
                            "serviceId": 7,
                            "serviceName": "mqtt-bridge",
                            "appId": 1001,
                            "appName": "gateway",
                            "replicas": 0,
                            "config": {
                                "image": "registry.example.com/mqtt-bridge:1.4.2",
                                "environment": {"BROKER": "tcp://10.0.0.1:1883"},
                                "ports": [{"containerPort": 1883, "hostPort": 1883}],
                                "livenessProbe": {"type": "tcp", "tcpPort": 8080}
                            }
                        }
                    ]
                }
            },
            "config": {"orchestrator": "docker", "pollIntervalSecs": 30}
        }"#
    }

    #[test]
    fn test_target_state_round_trip() {
        let state: TargetState = serde_json::from_str(sample_target_json()).unwrap();
        assert_eq!(state.apps.len(), 1);
        assert_eq!(state.config.poll_interval_secs, 30);
        assert_eq!(state.config.orchestrator, OrchestratorKind::Docker);

        let svc = state.services().next().unwrap();
        assert_eq!(svc.service_id, 7);
        assert_eq!(svc.desired_replicas(), 0);
        assert!(matches!(
            svc.config.liveness_probe,
            Some(HealthProbe::Tcp { tcp_port: 8080, .. })
        ));

        let json = serde_json::to_string(&state).unwrap();
        let back: TargetState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_replicas_default_to_one() {
        let svc: ServiceConfig = serde_json::from_str(
            r#"{"serviceId": 1, "serviceName": "a", "appId": 1, "appName": "x",
                "config": {"image": "busybox"}}"#,
        )
        .unwrap();
        assert_eq!(svc.replicas, None);
        assert_eq!(svc.desired_replicas(), 1);
    }

    #[test]
    fn test_missing_config_block_defaults() {
        let state: TargetState = serde_json::from_str(r#"{"apps": {}}"#).unwrap();
        assert_eq!(state.config.poll_interval_secs, 60);
        assert_eq!(state.config.orchestrator, OrchestratorKind::Docker);
    }

    #[test]
    fn test_unknown_orchestrator_fails() {
        let result: Result<OrchestratorKind, _> = serde_json::from_str(r#""nomad""#);
        assert!(result.is_err());
        assert!("nomad".parse::<OrchestratorKind>().is_err());
    }

    #[test]
    fn test_error_classification() {
        let cases = [
            ("pull access denied for private/img", ServiceErrorKind::ErrImagePull),
            ("manifest unknown: tag 9.99", ServiceErrorKind::ErrImagePull),
            ("Back-off pulling image \"x\"", ServiceErrorKind::ImagePullBackOff),
            ("OCI runtime create failed", ServiceErrorKind::StartFailure),
            ("container is restarting too quickly", ServiceErrorKind::CrashLoopBackOff),
            ("disk is on fire", ServiceErrorKind::Unknown),
        ];
        for (message, kind) in cases {
            assert_eq!(ServiceErrorKind::classify(message), kind, "{message}");
        }
    }

    #[test]
    fn test_group_services_by_app() {
        let mk = |app_id: u32, service_id: u32| ServiceConfig {
            service_id,
            service_name: format!("svc-{service_id}"),
            app_id,
            app_name: format!("app-{app_id}"),
            replicas: None,
            config: ServiceSpec {
                image: "busybox".into(),
                ..ServiceSpec::default()
            },
            container_id: None,
            status: None,
            service_status: None,
            error: None,
        };
        let apps = group_services(vec![mk(1, 10), mk(2, 20), mk(1, 11)]);
        assert_eq!(apps.len(), 2);
        assert_eq!(apps["1"].services.len(), 2);
        assert_eq!(apps["2"].services.len(), 1);
    }
}
