//! The shared reconciliation planner.
//!
//! Given the desired and observed service sets, compute the create/update/
//! remove operations that move the runtime toward the target. Matching is by
//! `service_id` only. The planner is pure; drivers execute the plan and
//! collect per-item failures.

use std::collections::BTreeMap;

use crate::model::{ServiceConfig, ServiceId};

/// A target/current pair for a service whose spec drifted.
#[derive(Clone, Debug)]
pub struct ServiceUpdate {
    pub target: ServiceConfig,
    pub current: ServiceConfig,
}

#[derive(Clone, Debug, Default)]
pub struct ReconcilePlan {
    pub create: Vec<ServiceConfig>,
    pub update: Vec<ServiceUpdate>,
    /// Runtime instances to remove: services absent from the target plus
    /// target services scaled to zero replicas. Scaling to zero removes the
    /// instance only; the service stays in the target document.
    pub remove: Vec<ServiceConfig>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.remove.is_empty()
    }
}

/// The watched fields. A difference in any of these marks a service for
/// update; anything not listed here (volumes, resources, probes) does not
/// trigger one. Extend this list deliberately, one named check at a time,
/// with a matching test.
pub fn needs_update(target: &ServiceConfig, current: &ServiceConfig) -> bool {
    let image_changed = target.config.image != current.config.image;

    // Environment and ports are compared through their serialized forms;
    // ports are order-sensitive.
    let env_changed = serde_json::to_string(&target.config.environment).ok()
        != serde_json::to_string(&current.config.environment).ok();
    let ports_changed = serde_json::to_string(&target.config.ports).ok()
        != serde_json::to_string(&current.config.ports).ok();

    image_changed || env_changed || ports_changed
}

pub fn plan(target: &[ServiceConfig], current: &[ServiceConfig]) -> ReconcilePlan {
    let target_by_id: BTreeMap<ServiceId, &ServiceConfig> =
        target.iter().map(|s| (s.service_id, s)).collect();
    let current_by_id: BTreeMap<ServiceId, &ServiceConfig> =
        current.iter().map(|s| (s.service_id, s)).collect();

    let mut out = ReconcilePlan::default();

    for svc in target {
        let running = current_by_id.get(&svc.service_id);
        if svc.desired_replicas() == 0 {
            if let Some(existing) = running {
                out.remove.push((*existing).clone());
            }
            continue;
        }
        match running {
            None => out.create.push(svc.clone()),
            Some(existing) => {
                if needs_update(svc, existing) {
                    out.update.push(ServiceUpdate {
                        target: svc.clone(),
                        current: (*existing).clone(),
                    });
                }
            }
        }
    }

    for svc in current {
        if !target_by_id.contains_key(&svc.service_id) {
            out.remove.push(svc.clone());
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PortMapping, ServiceSpec, VolumeMount};

    fn service(service_id: ServiceId, image: &str) -> ServiceConfig {
        ServiceConfig {
            service_id,
            service_name: format!("svc-{service_id}"),
            app_id: 1,
            app_name: "app".into(),
            replicas: None,
            config: ServiceSpec {
                image: image.into(),
                ..ServiceSpec::default()
            },
            container_id: None,
            status: None,
            service_status: None,
            error: None,
        }
    }

    fn with_port(mut svc: ServiceConfig, port: u16) -> ServiceConfig {
        svc.config.ports = vec![PortMapping {
            container_port: port,
            host_port: None,
            protocol: "tcp".into(),
        }];
        svc
    }

    #[test]
    fn test_plan_is_empty_when_states_match() {
        let target = vec![service(1, "a:1"), with_port(service(2, "b:1"), 80)];
        let current = target.clone();
        assert!(plan(&target, &current).is_empty());
    }

    #[test]
    fn test_port_only_change_yields_exactly_one_update() {
        let target = vec![with_port(service(1, "a:1"), 8080), service(2, "b:1")];
        let current = vec![with_port(service(1, "a:1"), 80), service(2, "b:1")];
        let plan = plan(&target, &current);
        assert_eq!(plan.create.len(), 0);
        assert_eq!(plan.update.len(), 1);
        assert_eq!(plan.remove.len(), 0);
        assert_eq!(plan.update[0].target.service_id, 1);
    }

    #[test]
    fn test_new_service_yields_one_create_no_unrelated_updates() {
        let target = vec![service(1, "a:1"), service(3, "c:1")];
        let current = vec![service(1, "a:1")];
        let plan = plan(&target, &current);
        assert_eq!(plan.create.len(), 1);
        assert_eq!(plan.create[0].service_id, 3);
        assert_eq!(plan.update.len(), 0);
        assert_eq!(plan.remove.len(), 0);
    }

    #[test]
    fn test_unmanaged_current_service_is_removed() {
        let target = vec![service(1, "a:1")];
        let current = vec![service(1, "a:1"), service(9, "stale:1")];
        let plan = plan(&target, &current);
        assert_eq!(plan.remove.len(), 1);
        assert_eq!(plan.remove[0].service_id, 9);
    }

    #[test]
    fn test_zero_replicas_removes_instance_not_config() {
        let mut stopped = service(7, "a:1");
        stopped.replicas = Some(0);
        let target = vec![stopped.clone()];

        // Previously running: the instance goes away.
        let running = vec![service(7, "a:1")];
        let p = plan(&target, &running);
        assert_eq!(p.remove.len(), 1);
        assert_eq!(p.remove[0].service_id, 7);
        assert_eq!(p.create.len(), 0);

        // Already stopped: nothing to do, and no create either.
        let p = plan(&target, &[]);
        assert!(p.is_empty());

        // The target document still carries the full config.
        assert_eq!(target[0].config.image, "a:1");
    }

    #[test]
    fn test_image_change_is_an_update() {
        let target = vec![service(1, "a:2")];
        let current = vec![service(1, "a:1")];
        assert_eq!(plan(&target, &current).update.len(), 1);
    }

    #[test]
    fn test_env_change_is_an_update() {
        let mut target = service(1, "a:1");
        target
            .config
            .environment
            .insert("MODE".into(), "debug".into());
        assert!(needs_update(&target, &service(1, "a:1")));
    }

    #[test]
    fn test_volume_change_is_not_watched() {
        let mut target = service(1, "a:1");
        target.config.volumes = vec![VolumeMount {
            source: "data".into(),
            target: "/data".into(),
            read_only: false,
        }];
        assert!(!needs_update(&target, &service(1, "a:1")));
    }
}
