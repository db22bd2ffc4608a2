//! Kubernetes-style manifest shapes and the service <-> Deployment mapping.
//!
//! Hand-typed serde structs covering the slice of the apps/v1 and core/v1
//! APIs the k3s driver touches. Labels on the Deployment and its pod
//! template carry the identity needed to reverse-map a listed workload back
//! to a service.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use edgewise_core::model::{
    HealthProbe, PortMapping, ResourceSpec, ServiceConfig, ServiceSpec, ServiceState,
    ServiceStatus,
};

pub const LABEL_APP: &str = "app";
pub const LABEL_SERVICE: &str = "service";
pub const LABEL_APP_ID: &str = "app-id";
pub const LABEL_SERVICE_ID: &str = "service-id";
pub const LABEL_MANAGED: &str = "edgewise.io/managed";
pub const RESTART_ANNOTATION: &str = "edgewise.io/restarted-at";

// Probe timing defaults applied when the service spec leaves them unset.
const DEFAULT_INITIAL_DELAY: u32 = 0;
const DEFAULT_PERIOD: u32 = 10;
const DEFAULT_TIMEOUT: u32 = 1;
const DEFAULT_SUCCESS_THRESHOLD: u32 = 1;
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    pub container_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpGetAction {
    pub path: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpSocketAction {
    pub port: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecAction {
    pub command: Vec<String>,
}

/// A probe in the platform's native shape, timing fields always filled.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_get: Option<HttpGetAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_socket: Option<TcpSocketAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecAction>,
    // The API server drops zero-valued fields on the way back out.
    #[serde(default)]
    pub initial_delay_seconds: u32,
    #[serde(default)]
    pub period_seconds: u32,
    #[serde(default)]
    pub timeout_seconds: u32,
    #[serde(default)]
    pub success_threshold: u32,
    #[serde(default)]
    pub failure_threshold: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_probe: Option<Probe>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    pub containers: Vec<Container>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpec {
    #[serde(default)]
    pub metadata: TemplateMeta,
    pub spec: PodSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMeta {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub selector: LabelSelector,
    pub template: PodTemplateSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub ready_replicas: u32,
    #[serde(default)]
    pub available_replicas: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    // List responses omit apiVersion/kind on the items.
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: DeploymentSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeploymentStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentList {
    #[serde(default)]
    pub items: Vec<Deployment>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PodList {
    #[serde(default)]
    pub items: Vec<PodRef>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PodRef {
    #[serde(default)]
    pub metadata: ObjectMeta,
}

/// RFC 1123 name fragment.
pub fn sanitize_name(name: &str) -> String {
    let mut out: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    while out.starts_with('-') {
        out.remove(0);
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

pub fn deployment_name(service: &ServiceConfig) -> String {
    sanitize_name(&format!("{}-{}", service.app_name, service.service_name))
}

pub fn identity_labels(service: &ServiceConfig) -> BTreeMap<String, String> {
    let mut labels = service.config.labels.clone();
    labels.insert(LABEL_APP.into(), sanitize_name(&service.app_name));
    labels.insert(LABEL_SERVICE.into(), sanitize_name(&service.service_name));
    labels.insert(LABEL_APP_ID.into(), service.app_id.to_string());
    labels.insert(LABEL_SERVICE_ID.into(), service.service_id.to_string());
    labels.insert(LABEL_MANAGED.into(), "true".into());
    labels
}

/// Translate a probe to the platform's native shape, filling unset timing
/// fields with the platform defaults.
pub fn probe_manifest(probe: &HealthProbe) -> Probe {
    let timing = probe.timing();
    let mut out = Probe {
        initial_delay_seconds: timing.initial_delay_seconds.unwrap_or(DEFAULT_INITIAL_DELAY),
        period_seconds: timing.period_seconds.unwrap_or(DEFAULT_PERIOD),
        timeout_seconds: timing.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT),
        success_threshold: timing.success_threshold.unwrap_or(DEFAULT_SUCCESS_THRESHOLD),
        failure_threshold: timing.failure_threshold.unwrap_or(DEFAULT_FAILURE_THRESHOLD),
        ..Probe::default()
    };
    match probe {
        HealthProbe::Http { path, port, scheme, .. } => {
            out.http_get = Some(HttpGetAction {
                path: path.clone(),
                port: *port,
                scheme: scheme.clone(),
            });
        }
        HealthProbe::Tcp { tcp_port, .. } => {
            out.tcp_socket = Some(TcpSocketAction { port: *tcp_port });
        }
        HealthProbe::Exec { command, .. } => {
            out.exec = Some(ExecAction {
                command: command.clone(),
            });
        }
    }
    out
}

/// Build the Deployment manifest for one service.
pub fn deployment_for(service: &ServiceConfig, namespace: &str) -> Deployment {
    let labels = identity_labels(service);
    let selector = BTreeMap::from([(
        LABEL_SERVICE_ID.to_string(),
        service.service_id.to_string(),
    )]);

    let env: Vec<EnvVar> = service
        .config
        .environment
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: value.clone(),
        })
        .collect();

    let ports: Vec<ContainerPort> = service
        .config
        .ports
        .iter()
        .map(|p| ContainerPort {
            container_port: p.container_port,
            host_port: p.host_port,
            protocol: Some(p.protocol.to_ascii_uppercase()),
        })
        .collect();

    let resources = service.config.resources.as_ref().map(|r| {
        let to_map = |spec: &Option<ResourceSpec>| {
            let mut map = BTreeMap::new();
            if let Some(spec) = spec {
                if let Some(cpu) = &spec.cpu {
                    map.insert("cpu".to_string(), cpu.clone());
                }
                if let Some(memory) = &spec.memory {
                    map.insert("memory".to_string(), memory.clone());
                }
            }
            map
        };
        ResourceRequirements {
            limits: to_map(&r.limits),
            requests: to_map(&r.requests),
        }
    });

    let container = Container {
        name: sanitize_name(&service.service_name),
        image: service.config.image.clone(),
        command: service.config.command.clone().unwrap_or_default(),
        env,
        ports,
        resources,
        liveness_probe: service.config.liveness_probe.as_ref().map(probe_manifest),
        readiness_probe: service.config.readiness_probe.as_ref().map(probe_manifest),
        startup_probe: service.config.startup_probe.as_ref().map(probe_manifest),
    };

    Deployment {
        api_version: "apps/v1".into(),
        kind: "Deployment".into(),
        metadata: ObjectMeta {
            name: deployment_name(service),
            namespace: Some(namespace.to_string()),
            labels: labels.clone(),
            annotations: BTreeMap::new(),
        },
        spec: DeploymentSpec {
            replicas: service.desired_replicas(),
            selector: LabelSelector {
                match_labels: selector,
            },
            template: PodTemplateSpec {
                metadata: TemplateMeta {
                    labels,
                    annotations: BTreeMap::new(),
                },
                spec: PodSpec {
                    containers: vec![container],
                },
            },
        },
        status: None,
    }
}

/// Reverse-map a listed Deployment to the service shape using the embedded
/// labels. Workloads without our id labels are not ours.
pub fn service_from_deployment(deployment: &Deployment) -> Option<ServiceConfig> {
    let labels = &deployment.metadata.labels;
    let service_id: u32 = labels.get(LABEL_SERVICE_ID)?.parse().ok()?;
    let app_id: u32 = labels.get(LABEL_APP_ID)?.parse().ok()?;
    let container = deployment.spec.template.spec.containers.first()?;

    let environment: BTreeMap<String, String> = container
        .env
        .iter()
        .map(|e| (e.name.clone(), e.value.clone()))
        .collect();

    let ports: Vec<PortMapping> = container
        .ports
        .iter()
        .map(|p| PortMapping {
            container_port: p.container_port,
            host_port: p.host_port,
            protocol: p
                .protocol
                .as_deref()
                .map(str::to_ascii_lowercase)
                .unwrap_or_else(|| "tcp".into()),
        })
        .collect();

    let status = deployment.status.as_ref();
    let ready = status.map(|s| s.ready_replicas).unwrap_or(0);
    let state = if ready > 0 {
        ServiceState::Running
    } else if deployment.spec.replicas == 0 {
        ServiceState::Stopped
    } else {
        ServiceState::Creating
    };

    Some(ServiceConfig {
        service_id,
        service_name: labels.get(LABEL_SERVICE).cloned().unwrap_or_default(),
        app_id,
        app_name: labels.get(LABEL_APP).cloned().unwrap_or_default(),
        replicas: Some(deployment.spec.replicas),
        config: ServiceSpec {
            image: container.image.clone(),
            environment,
            ports,
            command: (!container.command.is_empty()).then(|| container.command.clone()),
            ..ServiceSpec::default()
        },
        container_id: Some(deployment.metadata.name.clone()),
        status: status.map(|s| format!("{}/{} ready", s.ready_replicas, s.replicas)),
        service_status: Some(ServiceStatus {
            state,
            restart_count: 0,
            ..ServiceStatus::default()
        }),
        error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgewise_core::model::ProbeTiming;

    fn service() -> ServiceConfig {
        ServiceConfig {
            service_id: 42,
            service_name: "Sensor Hub".into(),
            app_id: 7,
            app_name: "telemetry".into(),
            replicas: None,
            config: ServiceSpec {
                image: "registry.example.com/sensor-hub:2.0".into(),
                environment: BTreeMap::from([("MODE".to_string(), "edge".to_string())]),
                ports: vec![PortMapping {
                    container_port: 9100,
                    host_port: None,
                    protocol: "tcp".into(),
                }],
                liveness_probe: Some(HealthProbe::Tcp {
                    tcp_port: 8080,
                    timing: ProbeTiming::default(),
                }),
                ..ServiceSpec::default()
            },
            container_id: None,
            status: None,
            service_status: None,
            error: None,
        }
    }

    #[test]
    fn test_tcp_probe_gets_native_shape_and_default_timings() {
        let manifest = deployment_for(&service(), "edgewise");
        let probe = manifest.spec.template.spec.containers[0]
            .liveness_probe
            .as_ref()
            .unwrap();
        assert_eq!(probe.tcp_socket.as_ref().unwrap().port, 8080);
        assert_eq!(probe.initial_delay_seconds, 0);
        assert_eq!(probe.period_seconds, 10);
        assert_eq!(probe.timeout_seconds, 1);
        assert_eq!(probe.success_threshold, 1);
        assert_eq!(probe.failure_threshold, 3);
    }

    #[test]
    fn test_explicit_probe_timings_are_kept() {
        let probe = HealthProbe::Http {
            path: "/healthz".into(),
            port: 8080,
            scheme: None,
            timing: ProbeTiming {
                period_seconds: Some(30),
                failure_threshold: Some(5),
                ..ProbeTiming::default()
            },
        };
        let manifest = probe_manifest(&probe);
        assert_eq!(manifest.http_get.as_ref().unwrap().path, "/healthz");
        assert_eq!(manifest.period_seconds, 30);
        assert_eq!(manifest.failure_threshold, 5);
        assert_eq!(manifest.timeout_seconds, 1);
    }

    #[test]
    fn test_manifest_carries_identity_labels() {
        let manifest = deployment_for(&service(), "edgewise");
        let labels = &manifest.metadata.labels;
        assert_eq!(labels[LABEL_APP], "telemetry");
        assert_eq!(labels[LABEL_SERVICE], "sensor-hub");
        assert_eq!(labels[LABEL_APP_ID], "7");
        assert_eq!(labels[LABEL_SERVICE_ID], "42");
        assert_eq!(manifest.metadata.labels, manifest.spec.template.metadata.labels);
        assert_eq!(manifest.spec.replicas, 1);
        assert_eq!(manifest.metadata.name, "telemetry-sensor-hub");
    }

    #[test]
    fn test_service_round_trips_through_deployment() {
        let svc = service();
        let manifest = deployment_for(&svc, "edgewise");
        let back = service_from_deployment(&manifest).unwrap();

        assert_eq!(back.service_id, svc.service_id);
        assert_eq!(back.app_id, svc.app_id);
        assert_eq!(back.config.image, svc.config.image);
        assert_eq!(back.config.environment, svc.config.environment);
        assert_eq!(back.config.ports, svc.config.ports);
        // Diff sees a round-tripped, unchanged service as a no-op.
        assert!(!edgewise_core::diff::needs_update(&svc, &back));
    }

    #[test]
    fn test_unlabeled_deployment_is_ignored() {
        let mut manifest = deployment_for(&service(), "edgewise");
        manifest.metadata.labels.remove(LABEL_SERVICE_ID);
        assert!(service_from_deployment(&manifest).is_none());
    }
}
