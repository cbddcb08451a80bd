//! Decorators shared by the workload registries.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Container, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::DynamicObject;

use super::patroni::PATRONI_CONTAINER;
use crate::conciliation::ResourceDecorator;
use crate::crd::instance_profile::{ContainerProfile, PgInstanceProfileSpec};
use crate::crd::shared::{NonProductionOptions, ResourcesSpec};
use crate::error::Result;
use crate::helpers::{from_dynamic, to_dynamic, VERSION_ANNOTATION};
use crate::store::kind_of;
use crate::version::OperatorVersion;

// ── Instance profile sizing ───────────────────────────────────────────────────

/// Contexts whose StatefulSets are sized from an instance profile.
pub trait SizingContext {
    fn profile(&self) -> Option<&PgInstanceProfileSpec>;
    fn resources(&self) -> Option<&ResourcesSpec>;
    fn non_production_options(&self) -> Option<&NonProductionOptions>;
}

/// Sizes the containers of StatefulSets from the context's instance profile.
///
/// The Patroni container always gets the profile cpu/memory as requests and
/// limits. Other containers are sized from the profile entry with their name:
/// limits only when cluster limits are enabled, cpu and memory requests only
/// when their non-production toggle is set. Disabling cluster resource
/// requirements leaves every container untouched.
pub struct ProfileDecorator;

impl<C: SizingContext + Send + Sync> ResourceDecorator<C> for ProfileDecorator {
    fn decorate(&self, context: &C, object: &mut DynamicObject) -> Result<()> {
        if kind_of(object) != "StatefulSet" {
            return Ok(());
        }
        let Some(profile) = context.profile() else {
            return Ok(());
        };
        let options = context
            .non_production_options()
            .cloned()
            .unwrap_or_default();
        if options.disable_cluster_resource_requirements {
            return Ok(());
        }
        let sizing = Sizing {
            limits: context
                .resources()
                .is_some_and(|r| r.enable_cluster_limits_requirements),
            cpu_requests: options.enable_set_cluster_cpu_requests,
            memory_requests: options.enable_set_cluster_memory_requests,
        };

        let mut statefulset: StatefulSet = from_dynamic(object)?;
        let Some(pod) = statefulset
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
        else {
            return Ok(());
        };
        for container in &mut pod.containers {
            if container.name == PATRONI_CONTAINER {
                container.resources = Some(requirements(
                    &profile.cpu,
                    &profile.memory,
                    Sizing::full(),
                ));
            } else {
                sizing.apply(container, &profile.containers);
            }
        }
        for container in pod.init_containers.iter_mut().flatten() {
            sizing.apply(container, &profile.init_containers);
        }
        *object = to_dynamic(&statefulset)?;
        Ok(())
    }
}

#[derive(Clone, Copy)]
struct Sizing {
    limits: bool,
    cpu_requests: bool,
    memory_requests: bool,
}

impl Sizing {
    fn full() -> Self {
        Self {
            limits: true,
            cpu_requests: true,
            memory_requests: true,
        }
    }

    fn apply(self, container: &mut Container, profiles: &BTreeMap<String, ContainerProfile>) {
        let Some(profile) = profiles.get(&container.name) else {
            return;
        };
        if self.limits || self.cpu_requests || self.memory_requests {
            container.resources = Some(requirements(&profile.cpu, &profile.memory, self));
        }
    }
}

fn requirements(cpu: &str, memory: &str, sizing: Sizing) -> ResourceRequirements {
    let mut requests = BTreeMap::new();
    if sizing.cpu_requests {
        requests.insert("cpu".to_string(), Quantity(cpu.to_string()));
    }
    if sizing.memory_requests {
        requests.insert("memory".to_string(), Quantity(memory.to_string()));
    }
    let limits = sizing.limits.then(|| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    });
    ResourceRequirements {
        requests: (!requests.is_empty()).then_some(requests),
        limits,
        ..Default::default()
    }
}

// ── Operator version annotation ───────────────────────────────────────────────

/// Stamps the running operator version on every generated object.
pub struct VersionAnnotationDecorator {
    version: OperatorVersion,
}

impl VersionAnnotationDecorator {
    pub fn new(version: OperatorVersion) -> Self {
        Self { version }
    }
}

impl<C: Send + Sync> ResourceDecorator<C> for VersionAnnotationDecorator {
    fn decorate(&self, _context: &C, object: &mut DynamicObject) -> Result<()> {
        object
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(VERSION_ANNOTATION.to_string(), self.version.to_string());
        Ok(())
    }
}
