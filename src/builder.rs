use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment},
        core::v1::{
            Container, ContainerPort, EmptyDirVolumeSource, EnvVar, HTTPGetAction,
            HostPathVolumeSource, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, Service,
            ServicePort, ServiceSpec, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, OwnerReference},
        util::intstr::IntOrString,
    },
};
use kube::{Resource, ResourceExt, api::ObjectMeta};

use crate::crd::{HttpProbe, ModelBox, ResourceQuota, ResourceType};

pub const SELECTOR_LABEL: &str = "modelbox";

const MODEL_VOLUME: &str = "model-volume";
const MODEL_MOUNT_PATH: &str = "/app/model";
const LOCALTIME_VOLUME: &str = "localtime";

const SIDECAR_NAME: &str = "db-container";
const INIT_CONTAINER_NAME: &str = "init-container";
const HELPER_IMAGE: &str = "busybox";

const MIN_READY_SECONDS: i32 = 3;

const PROBE_SCHEME: &str = "HTTP";
const PROBE_PORT: i32 = 8080;
const PROBE_PATH: &str = "/healthz";
const PROBE_INITIAL_DELAY_SECONDS: i32 = 10;
const PROBE_PERIOD_SECONDS: i32 = 5;
const PROBE_TIMEOUT_SECONDS: i32 = 10;

/// CPU and memory for a sized tier, used for both request and limit.
pub fn tier_quantities(tier: ResourceType) -> Option<(&'static str, &'static str)> {
    match tier {
        ResourceType::Small => Some(("1000m", "2Gi")),
        ResourceType::Medium => Some(("2000m", "4Gi")),
        ResourceType::Large => Some(("4000m", "8Gi")),
        ResourceType::Custom => None,
    }
}

pub fn build_deployment(model_box: &ModelBox) -> Deployment {
    let spec = &model_box.spec;
    let labels = selector_labels(model_box);
    let budget = IntOrString::String(spec.rolling_update.clone());

    Deployment {
        metadata: derived_metadata(model_box),
        spec: Some(DeploymentSpec {
            replicas: spec.replicas,
            min_ready_seconds: Some(MIN_READY_SECONDS),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_unavailable: Some(budget.clone()),
                    max_surge: Some(budget),
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: Some(vec![init_container(model_box)]),
                    containers: vec![primary_container(model_box), sidecar_container(model_box)],
                    volumes: Some(volumes()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn build_service(model_box: &ModelBox) -> Service {
    let spec = &model_box.spec;
    let ports = spec
        .ports
        .iter()
        .map(|port| ServicePort {
            name: Some(port.name.clone()),
            port: port.port,
            target_port: Some(IntOrString::Int(port.container_port())),
            protocol: port.protocol.clone(),
            node_port: port.node_port,
            ..Default::default()
        })
        .collect();

    Service {
        metadata: derived_metadata(model_box),
        spec: Some(ServiceSpec {
            type_: Some(spec.service_type.as_str().to_string()),
            ports: Some(ports),
            selector: Some(selector_labels(model_box)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn resource_requirements(
    tier: Option<ResourceType>,
    custom: Option<&ResourceQuota>,
) -> ResourceRequirements {
    match tier {
        Some(ResourceType::Custom) => custom.map(quota_requirements).unwrap_or_default(),
        Some(tier) => tier_requirements(tier),
        None => ResourceRequirements::default(),
    }
}

fn tier_requirements(tier: ResourceType) -> ResourceRequirements {
    let Some((cpu, memory)) = tier_quantities(tier) else {
        return ResourceRequirements::default();
    };
    let list = BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(memory.to_string())),
    ]);

    ResourceRequirements {
        limits: Some(list.clone()),
        requests: Some(list),
        ..Default::default()
    }
}

fn quota_requirements(quota: &ResourceQuota) -> ResourceRequirements {
    let to_list = |values: &BTreeMap<String, String>| {
        values
            .iter()
            .map(|(name, value)| (name.clone(), Quantity(value.clone())))
            .collect::<BTreeMap<_, _>>()
    };

    ResourceRequirements {
        limits: quota.limits.as_ref().map(to_list),
        requests: quota.requests.as_ref().map(to_list),
        ..Default::default()
    }
}

fn derived_metadata(model_box: &ModelBox) -> ObjectMeta {
    ObjectMeta {
        name: Some(model_box.name_any()),
        namespace: model_box.namespace(),
        owner_references: owner_references(model_box),
        ..Default::default()
    }
}

fn owner_references(model_box: &ModelBox) -> Option<Vec<OwnerReference>> {
    model_box.controller_owner_ref(&()).map(|oref| vec![oref])
}

fn selector_labels(model_box: &ModelBox) -> BTreeMap<String, String> {
    BTreeMap::from([(SELECTOR_LABEL.to_string(), model_box.name_any())])
}

fn env(model_box: &ModelBox) -> Option<Vec<EnvVar>> {
    let envs = &model_box.spec.envs;
    if envs.is_empty() {
        return None;
    }

    Some(
        envs.iter()
            .map(|var| EnvVar {
                name: var.name.clone(),
                value: var.value.clone(),
                ..Default::default()
            })
            .collect(),
    )
}

fn model_volume_mount() -> VolumeMount {
    VolumeMount {
        name: MODEL_VOLUME.to_string(),
        mount_path: MODEL_MOUNT_PATH.to_string(),
        ..Default::default()
    }
}

fn primary_container(model_box: &ModelBox) -> Container {
    let spec = &model_box.spec;
    let ports = spec
        .ports
        .iter()
        .map(|port| ContainerPort {
            container_port: port.container_port(),
            ..Default::default()
        })
        .collect();

    Container {
        name: model_box.name_any(),
        image: Some(spec.image.clone()),
        resources: Some(resource_requirements(
            spec.resource_type,
            spec.resources.as_ref(),
        )),
        env: env(model_box),
        ports: Some(ports),
        volume_mounts: Some(vec![model_volume_mount()]),
        readiness_probe: spec.readiness_probe.as_ref().map(http_probe),
        liveness_probe: spec.liveness_probe.as_ref().map(http_probe),
        ..Default::default()
    }
}

fn sidecar_container(model_box: &ModelBox) -> Container {
    let spec = &model_box.spec;

    Container {
        name: SIDECAR_NAME.to_string(),
        image: Some(HELPER_IMAGE.to_string()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "sleep 86400".to_string(),
        ]),
        resources: Some(resource_requirements(
            spec.resource_type,
            spec.resources.as_ref(),
        )),
        env: env(model_box),
        ..Default::default()
    }
}

fn init_container(model_box: &ModelBox) -> Container {
    Container {
        name: INIT_CONTAINER_NAME.to_string(),
        image: Some(HELPER_IMAGE.to_string()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "sleep 3 && touch /tmp/done".to_string(),
        ]),
        resources: Some(tier_requirements(ResourceType::Small)),
        env: env(model_box),
        volume_mounts: Some(vec![model_volume_mount()]),
        ..Default::default()
    }
}

fn volumes() -> Vec<Volume> {
    vec![
        Volume {
            name: MODEL_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: LOCALTIME_VOLUME.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: "/etc/localtime".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

fn http_probe(probe: &HttpProbe) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            scheme: Some(probe.scheme.clone().unwrap_or_else(|| PROBE_SCHEME.to_string())),
            port: IntOrString::Int(probe.port.unwrap_or(PROBE_PORT)),
            path: Some(probe.path.clone().unwrap_or_else(|| PROBE_PATH.to_string())),
            ..Default::default()
        }),
        initial_delay_seconds: Some(
            probe
                .initial_delay_seconds
                .unwrap_or(PROBE_INITIAL_DELAY_SECONDS),
        ),
        period_seconds: Some(probe.period_seconds.unwrap_or(PROBE_PERIOD_SECONDS)),
        timeout_seconds: Some(probe.timeout_seconds.unwrap_or(PROBE_TIMEOUT_SECONDS)),
        ..Default::default()
    }
}
