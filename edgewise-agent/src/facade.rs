//! Bollard-backed runtime facade.
//!
//! Performs the actual engine calls: list/inspect/create/start/stop/remove,
//! image pulls, log retrieval, and one-shot stats. Owns the engine-level
//! apply loop; the docker driver above it passes `reconcile()` straight
//! through to [`DockerFacade::set_target`].

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock as StdRwLock;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerInspectResponse, ContainerStateStatusEnum, HealthConfig, HealthStatusEnum,
    HostConfig, PortBinding, RestartPolicy as EngineRestartPolicy, RestartPolicyNameEnum,
};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, ListNetworksOptions};
use bollard::volume::CreateVolumeOptions;
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};

use edgewise_core::diff;
use edgewise_core::facade::{FacadeError, FacadeEvent, RuntimeFacade};
use edgewise_core::model::{
    AppConfig, CurrentState, DockerSettings, EngineStats, HealthProbe, HealthState, LogOptions,
    PortMapping, ReconciliationResult, RestartPolicy, ServiceConfig, ServiceSpec, ServiceState,
    ServiceStatus, group_services,
};

pub const LABEL_MANAGED: &str = "io.edgewise.managed";
pub const LABEL_APP: &str = "io.edgewise.app";
pub const LABEL_SERVICE: &str = "io.edgewise.service";
pub const LABEL_APP_ID: &str = "io.edgewise.app-id";
pub const LABEL_SERVICE_ID: &str = "io.edgewise.service-id";

const STOP_TIMEOUT_SECS: i64 = 10;

fn engine_err(e: bollard::errors::Error) -> FacadeError {
    FacadeError::Engine(e.to_string())
}

/// Engine-safe name fragment: lowercase alphanumerics, dashes, underscores.
fn sanitize(name: &str) -> String {
    name.to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
        .collect()
}

pub struct DockerFacade {
    settings: DockerSettings,
    client: StdRwLock<Option<Docker>>,
    target: RwLock<Option<BTreeMap<String, AppConfig>>>,
    apply_lock: Mutex<()>,
    events: broadcast::Sender<FacadeEvent>,
}

impl DockerFacade {
    pub fn new(settings: DockerSettings) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            settings,
            client: StdRwLock::new(None),
            target: RwLock::new(None),
            apply_lock: Mutex::new(()),
            events,
        }
    }

    fn client(&self) -> Result<Docker, FacadeError> {
        self.client
            .read()
            .expect("client lock poisoned")
            .clone()
            .ok_or_else(|| FacadeError::Connection("engine not connected, init() first".into()))
    }

    fn container_name(service: &ServiceConfig) -> String {
        sanitize(&format!(
            "{}_{}_{}",
            service.app_name, service.service_name, service.service_id
        ))
    }

    fn network_name(&self, app_id: u32, name: &str) -> String {
        sanitize(&format!(
            "{}_{}_{}",
            self.settings.network_prefix(),
            app_id,
            name
        ))
    }

    fn volume_name(&self, app_id: u32, name: &str) -> String {
        sanitize(&format!(
            "{}_{}_{}",
            self.settings.network_prefix(),
            app_id,
            name
        ))
    }

    fn service_labels(service: &ServiceConfig) -> HashMap<String, String> {
        let mut labels: HashMap<String, String> = service
            .config
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        labels.insert(LABEL_MANAGED.into(), "true".into());
        labels.insert(LABEL_APP.into(), service.app_name.clone());
        labels.insert(LABEL_SERVICE.into(), service.service_name.clone());
        labels.insert(LABEL_APP_ID.into(), service.app_id.to_string());
        labels.insert(LABEL_SERVICE_ID.into(), service.service_id.to_string());
        labels
    }

    /// Reverse-map an inspected container to the service shape via the
    /// embedded labels. Containers without our id labels are not ours.
    fn service_from_inspect(inspect: &ContainerInspectResponse) -> Option<ServiceConfig> {
        let config = inspect.config.as_ref()?;
        let labels = config.labels.as_ref()?;
        let service_id: u32 = labels.get(LABEL_SERVICE_ID)?.parse().ok()?;
        let app_id: u32 = labels.get(LABEL_APP_ID)?.parse().ok()?;

        let environment: BTreeMap<String, String> = config
            .env
            .as_ref()
            .map(|env| {
                env.iter()
                    .filter_map(|kv| {
                        kv.split_once('=').map(|(k, v)| (k.to_string(), v.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let ports: Vec<PortMapping> = inspect
            .host_config
            .as_ref()
            .and_then(|hc| hc.port_bindings.as_ref())
            .map(|bindings| {
                let mut ports: Vec<PortMapping> = bindings
                    .iter()
                    .filter_map(|(key, binding)| {
                        let (port, protocol) = key.split_once('/')?;
                        Some(PortMapping {
                            container_port: port.parse().ok()?,
                            host_port: binding
                                .as_ref()
                                .and_then(|b| b.first())
                                .and_then(|b| b.host_port.as_ref())
                                .and_then(|p| p.parse().ok()),
                            protocol: protocol.to_string(),
                        })
                    })
                    .collect();
                ports.sort_by_key(|p| p.container_port);
                ports
            })
            .unwrap_or_default();

        let state = inspect.state.as_ref();
        let raw_status = state.and_then(|s| s.status).map(|s| s.to_string());
        let service_state = match state.and_then(|s| s.status) {
            Some(ContainerStateStatusEnum::CREATED) => ServiceState::Creating,
            Some(ContainerStateStatusEnum::RESTARTING) => ServiceState::Creating,
            Some(ContainerStateStatusEnum::RUNNING) => ServiceState::Running,
            Some(ContainerStateStatusEnum::PAUSED) => ServiceState::Stopped,
            Some(ContainerStateStatusEnum::EXITED) => {
                if state.and_then(|s| s.exit_code).unwrap_or(0) == 0 {
                    ServiceState::Stopped
                } else {
                    ServiceState::Error
                }
            }
            Some(ContainerStateStatusEnum::DEAD) => ServiceState::Error,
            _ => ServiceState::Unknown,
        };
        let health = match state
            .and_then(|s| s.health.as_ref())
            .and_then(|h| h.status)
        {
            Some(HealthStatusEnum::HEALTHY) => HealthState::Healthy,
            Some(HealthStatusEnum::UNHEALTHY) => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        };

        Some(ServiceConfig {
            service_id,
            service_name: labels.get(LABEL_SERVICE).cloned().unwrap_or_default(),
            app_id,
            app_name: labels.get(LABEL_APP).cloned().unwrap_or_default(),
            replicas: None,
            config: ServiceSpec {
                image: config.image.clone().unwrap_or_default(),
                environment,
                ports,
                ..ServiceSpec::default()
            },
            container_id: inspect.id.clone(),
            status: raw_status,
            service_status: Some(ServiceStatus {
                state: service_state,
                health,
                restart_count: inspect.restart_count.unwrap_or(0).max(0) as u32,
                exit_code: state.and_then(|s| s.exit_code),
                message: None,
            }),
            error: None,
        })
    }

    async fn list_managed(&self) -> Result<Vec<ServiceConfig>, FacadeError> {
        let client = self.client()?;
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{LABEL_MANAGED}=true")],
        );
        let summaries = client
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(engine_err)?;

        let mut services = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id else { continue };
            // A container can vanish between list and inspect; skip it.
            match client
                .inspect_container(&id, None::<InspectContainerOptions>)
                .await
            {
                Ok(inspect) => {
                    if let Some(service) = Self::service_from_inspect(&inspect) {
                        services.push(service);
                    }
                }
                Err(e) => warn!(container = %id, error = %e, "inspect failed, skipping"),
            }
        }
        Ok(services)
    }

    async fn ensure_app_resources(
        &self,
        app: &AppConfig,
        result: &mut ReconciliationResult,
    ) {
        let client = match self.client() {
            Ok(c) => c,
            Err(e) => {
                result.record_error(app.app_name.clone(), e);
                return;
            }
        };

        for (name, net) in &app.networks {
            let full = self.network_name(app.app_id, name);
            let mut filters = HashMap::new();
            filters.insert("name".to_string(), vec![full.clone()]);
            let existing = client
                .list_networks(Some(ListNetworksOptions { filters }))
                .await;
            match existing {
                Ok(list) if !list.is_empty() => {}
                Ok(_) => {
                    let mut labels = net.labels.clone();
                    labels.insert(LABEL_MANAGED.into(), "true".into());
                    if let Err(e) = client
                        .create_network(CreateNetworkOptions {
                            name: full.clone(),
                            driver: net.driver.clone().unwrap_or_else(|| "bridge".into()),
                            internal: net.internal,
                            labels: labels.into_iter().collect(),
                            ..Default::default()
                        })
                        .await
                    {
                        result.record_error(format!("network {full}"), engine_err(e));
                    }
                }
                Err(e) => result.record_error(format!("network {full}"), engine_err(e)),
            }
        }

        for (name, vol) in &app.volumes {
            let full = self.volume_name(app.app_id, name);
            let mut labels: HashMap<String, String> = vol.labels.clone().into_iter().collect();
            labels.insert(LABEL_MANAGED.into(), "true".into());
            if let Err(e) = client
                .create_volume(CreateVolumeOptions {
                    name: full.clone(),
                    driver: vol.driver.clone().unwrap_or_else(|| "local".into()),
                    labels,
                    ..Default::default()
                })
                .await
            {
                result.record_error(format!("volume {full}"), engine_err(e));
            }
        }
    }

    fn healthcheck_for(probe: Option<&HealthProbe>) -> Option<HealthConfig> {
        // Only exec probes translate to an engine healthcheck; http/tcp
        // probing happens at a layer the engine cannot express.
        let HealthProbe::Exec { command, timing } = probe? else {
            return None;
        };
        let mut test = vec!["CMD".to_string()];
        test.extend(command.iter().cloned());
        Some(HealthConfig {
            test: Some(test),
            interval: Some(i64::from(timing.period_seconds.unwrap_or(10)) * 1_000_000_000),
            timeout: Some(i64::from(timing.timeout_seconds.unwrap_or(1)) * 1_000_000_000),
            retries: Some(i64::from(timing.failure_threshold.unwrap_or(3))),
            start_period: Some(
                i64::from(timing.initial_delay_seconds.unwrap_or(0)) * 1_000_000_000,
            ),
            ..Default::default()
        })
    }

    fn restart_policy_for(policy: &RestartPolicy) -> EngineRestartPolicy {
        let name = match policy {
            RestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
            RestartPolicy::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
            RestartPolicy::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
            RestartPolicy::Never => RestartPolicyNameEnum::NO,
        };
        EngineRestartPolicy {
            name: Some(name),
            maximum_retry_count: None,
        }
    }

    async fn pull_image(&self, image: &str) {
        let Ok(client) = self.client() else { return };
        let mut stream = client.create_image(
            Some(CreateImageOptions::<String> {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            if let Err(e) = progress {
                // A failed pull is not fatal: the image may already be
                // present locally and the device may be offline.
                warn!(image, error = %e, "image pull failed, trying local image");
                return;
            }
        }
        debug!(image, "image pulled");
    }

    async fn create_and_start(&self, service: &ServiceConfig) -> Result<String, FacadeError> {
        let client = self.client()?;
        self.pull_image(&service.config.image).await;

        let env: Vec<String> = service
            .config
            .environment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for port in &service.config.ports {
            let key = format!("{}/{}", port.container_port, port.protocol);
            exposed_ports.insert(key.clone(), HashMap::new());
            if let Some(host_port) = port.host_port {
                port_bindings.insert(
                    key,
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(host_port.to_string()),
                    }]),
                );
            }
        }

        let binds: Vec<String> = service
            .config
            .volumes
            .iter()
            .map(|v| {
                let mut bind = format!("{}:{}", v.source, v.target);
                if v.read_only {
                    bind.push_str(":ro");
                }
                bind
            })
            .collect();

        let networks: Vec<String> = service
            .config
            .networks
            .iter()
            .map(|n| self.network_name(service.app_id, n))
            .collect();

        let host_config = HostConfig {
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            binds: (!binds.is_empty()).then_some(binds),
            network_mode: networks.first().cloned(),
            restart_policy: Some(Self::restart_policy_for(&service.config.restart)),
            ..Default::default()
        };

        let config = Config {
            image: Some(service.config.image.clone()),
            cmd: service.config.command.clone(),
            env: Some(env),
            labels: Some(Self::service_labels(service)),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            healthcheck: Self::healthcheck_for(service.config.liveness_probe.as_ref()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let name = Self::container_name(service);
        let created = client
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(engine_err)?;

        // Attach the remaining networks; the first one rode in as the
        // network mode.
        for network in networks.iter().skip(1) {
            if let Err(e) = client
                .connect_network(
                    network,
                    ConnectNetworkOptions {
                        container: created.id.clone(),
                        ..Default::default()
                    },
                )
                .await
            {
                warn!(container = %name, network = %network, error = %e, "network attach failed");
            }
        }

        client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(engine_err)?;

        info!(container = %name, image = %service.config.image, "container started");
        Ok(created.id)
    }

    async fn stop_and_remove(&self, container_id: &str) -> Result<(), FacadeError> {
        let client = self.client()?;
        if let Err(e) = client
            .stop_container(container_id, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await
        {
            // Already-stopped containers still need removal.
            debug!(container = %container_id, error = %e, "stop returned an error");
        }
        client
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(engine_err)?;
        Ok(())
    }
}

#[async_trait]
impl RuntimeFacade for DockerFacade {
    async fn init(&self) -> Result<(), FacadeError> {
        let client = match &self.settings.socket {
            Some(socket) => {
                Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)
                    .map_err(|e| FacadeError::Connection(e.to_string()))?
            }
            None => Docker::connect_with_local_defaults()
                .map_err(|e| FacadeError::Connection(e.to_string()))?,
        };
        client
            .ping()
            .await
            .map_err(|e| FacadeError::Connection(format!("engine ping failed: {e}")))?;
        *self.client.write().expect("client lock poisoned") = Some(client);
        info!("connected to container engine");
        Ok(())
    }

    async fn get_current_state(&self) -> Result<CurrentState, FacadeError> {
        let services = self.list_managed().await?;
        Ok(CurrentState {
            apps: group_services(services),
            timestamp: Utc::now(),
        })
    }

    async fn set_target(
        &self,
        apps: BTreeMap<String, AppConfig>,
    ) -> Result<ReconciliationResult, FacadeError> {
        let _guard = self.apply_lock.lock().await;
        *self.target.write().await = Some(apps);
        let apps = self
            .target
            .read()
            .await
            .clone()
            .unwrap_or_default();

        let current = self.get_current_state().await?;
        let target_services: Vec<ServiceConfig> =
            apps.values().flat_map(|a| a.services.iter().cloned()).collect();
        let current_services: Vec<ServiceConfig> =
            current.services().cloned().collect();
        let plan = diff::plan(&target_services, &current_services);

        let mut result = ReconciliationResult::empty();

        for app in apps.values() {
            self.ensure_app_resources(app, &mut result).await;
        }

        for service in &plan.create {
            match self.create_and_start(service).await {
                Ok(_) => result.created += 1,
                Err(e) => result.record_error(service.service_name.clone(), e),
            }
        }

        for update in &plan.update {
            let removed = match &update.current.container_id {
                Some(id) => self.stop_and_remove(id).await,
                None => Ok(()),
            };
            match removed {
                Ok(()) => match self.create_and_start(&update.target).await {
                    Ok(_) => result.updated += 1,
                    Err(e) => result.record_error(update.target.service_name.clone(), e),
                },
                Err(e) => result.record_error(update.target.service_name.clone(), e),
            }
        }

        for service in &plan.remove {
            let target = service
                .container_id
                .clone()
                .unwrap_or_else(|| Self::container_name(service));
            match self.stop_and_remove(&target).await {
                Ok(()) => result.removed += 1,
                Err(e) => result.record_error(service.service_name.clone(), e),
            }
        }

        result.timestamp = Utc::now();
        let _ = self.events.send(FacadeEvent::StateApplied {
            result: result.clone(),
        });
        Ok(result)
    }

    async fn logs(
        &self,
        container_id: &str,
        opts: &LogOptions,
    ) -> Result<BoxStream<'static, Result<String, FacadeError>>, FacadeError> {
        let client = self.client()?;
        let options = LogsOptions::<String> {
            follow: opts.follow,
            stdout: opts.stdout,
            stderr: opts.stderr,
            timestamps: opts.timestamps,
            since: opts.since.map(|t| t.timestamp()).unwrap_or(0),
            tail: opts
                .tail
                .map(|n| n.to_string())
                .unwrap_or_else(|| "all".into()),
            ..Default::default()
        };
        let stream = client
            .logs(container_id, Some(options))
            .map(|item| {
                item.map(|log| log.to_string().trim_end().to_string())
                    .map_err(engine_err)
            })
            .boxed();
        Ok(stream)
    }

    async fn stats(&self, container_id: &str) -> Result<EngineStats, FacadeError> {
        let client = self.client()?;
        let mut stream = client.stats(
            container_id,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        let sample = stream
            .next()
            .await
            .ok_or_else(|| FacadeError::NotFound(container_id.to_string()))?
            .map_err(engine_err)?;

        Ok(EngineStats {
            cpu_total_usage: sample.cpu_stats.cpu_usage.total_usage,
            system_cpu_usage: sample.cpu_stats.system_cpu_usage,
            precpu_total_usage: sample.precpu_stats.cpu_usage.total_usage,
            presystem_cpu_usage: sample.precpu_stats.system_cpu_usage,
            online_cpus: sample.cpu_stats.online_cpus.map(|n| n as u32),
            memory_usage: sample.memory_stats.usage,
            memory_limit: sample.memory_stats.limit,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<FacadeEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerConfig, ContainerState};
    use edgewise_core::model::ProbeTiming;

    #[test]
    fn test_sanitize_names() {
        assert_eq!(sanitize("Web API/v2"), "web-api-v2");
        assert_eq!(sanitize("mqtt_bridge-1"), "mqtt_bridge-1");
    }

    #[test]
    fn test_inspect_round_trip_is_a_diff_noop() {
        let service = ServiceConfig {
            service_id: 7,
            service_name: "mqtt-bridge".into(),
            app_id: 1001,
            app_name: "gateway".into(),
            replicas: None,
            config: ServiceSpec {
                image: "registry.example.com/mqtt-bridge:1.4.2".into(),
                environment: BTreeMap::from([(
                    "BROKER".to_string(),
                    "tcp://10.0.0.1:1883".to_string(),
                )]),
                ports: vec![PortMapping {
                    container_port: 1883,
                    host_port: Some(1883),
                    protocol: "tcp".into(),
                }],
                ..ServiceSpec::default()
            },
            container_id: None,
            status: None,
            service_status: None,
            error: None,
        };

        let inspect = ContainerInspectResponse {
            id: Some("abc123".into()),
            restart_count: Some(2),
            config: Some(ContainerConfig {
                image: Some(service.config.image.clone()),
                env: Some(vec!["BROKER=tcp://10.0.0.1:1883".into()]),
                labels: Some(DockerFacade::service_labels(&service)),
                ..Default::default()
            }),
            state: Some(ContainerState {
                status: Some(ContainerStateStatusEnum::RUNNING),
                ..Default::default()
            }),
            host_config: Some(HostConfig {
                port_bindings: Some(HashMap::from([(
                    "1883/tcp".to_string(),
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some("1883".into()),
                    }]),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        };

        let observed = DockerFacade::service_from_inspect(&inspect).unwrap();
        assert_eq!(observed.service_id, 7);
        assert_eq!(observed.container_id.as_deref(), Some("abc123"));
        assert_eq!(
            observed.service_status.as_ref().unwrap().state,
            ServiceState::Running
        );
        assert_eq!(observed.service_status.as_ref().unwrap().restart_count, 2);
        // An unchanged service observed back from the engine is a no-op for
        // the planner, which is what makes a second reconcile pass idempotent.
        assert!(!diff::needs_update(&service, &observed));
    }

    #[test]
    fn test_exec_probe_becomes_engine_healthcheck() {
        let probe = HealthProbe::Exec {
            command: vec!["pg_isready".into()],
            timing: ProbeTiming {
                period_seconds: Some(5),
                failure_threshold: Some(2),
                ..ProbeTiming::default()
            },
        };
        let hc = DockerFacade::healthcheck_for(Some(&probe)).unwrap();
        assert_eq!(
            hc.test,
            Some(vec!["CMD".to_string(), "pg_isready".to_string()])
        );
        assert_eq!(hc.interval, Some(5_000_000_000));
        assert_eq!(hc.retries, Some(2));

        let tcp = HealthProbe::Tcp {
            tcp_port: 5432,
            timing: ProbeTiming::default(),
        };
        assert!(DockerFacade::healthcheck_for(Some(&tcp)).is_none());
    }
}
