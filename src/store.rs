//! Versioned object store the reconciler reads from and writes to.
//!
//! Writes are optimistic: an object carries the `resourceVersion` it was read
//! at, and replacing it after someone else wrote fails with a 409 Conflict.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Service, ServiceSpec},
};
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{ObjectMeta, Patch, PatchParams, PostParams},
};
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use crate::{
    crd::{ModelBox, ModelBoxStatus},
    error::Error,
};

#[cfg(test)]
pub(crate) mod memory;

pub const FIELD_MANAGER_NAME: &str = "modelbox-controller";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DerivedKind {
    Deployment,
    Service,
}

impl fmt::Display for DerivedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DerivedKind::Deployment => write!(f, "Deployment"),
            DerivedKind::Service => write!(f, "Service"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Derived {
    Deployment(Deployment),
    Service(Service),
}

impl Derived {
    pub fn kind(&self) -> DerivedKind {
        match self {
            Derived::Deployment(_) => DerivedKind::Deployment,
            Derived::Service(_) => DerivedKind::Service,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Derived::Deployment(deployment) => deployment.meta(),
            Derived::Service(service) => service.meta(),
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Derived::Deployment(deployment) => deployment.meta_mut(),
            Derived::Service(service) => service.meta_mut(),
        }
    }

    /// Replaces the spec of this live object with the one from `built`,
    /// keeping identity, metadata and anything the cluster allocated.
    pub fn with_spec_from(self, built: &Derived) -> Result<Derived, Error> {
        match (self, built) {
            (Derived::Deployment(mut live), Derived::Deployment(built)) => {
                live.spec = built.spec.clone();
                Ok(Derived::Deployment(live))
            }
            (Derived::Service(mut live), Derived::Service(built)) => {
                let mut spec = built.spec.clone().unwrap_or_default();
                if let Some(current) = live.spec.as_ref() {
                    spec.cluster_ip = current.cluster_ip.clone();
                    spec.cluster_ips = current.cluster_ips.clone();
                    // Node ports are only valid on NodePort and LoadBalancer services.
                    if exposes_node_ports(&spec) {
                        for port in spec.ports.iter_mut().flatten() {
                            if port.node_port.is_none() {
                                port.node_port = current
                                    .ports
                                    .iter()
                                    .flatten()
                                    .find(|allocated| allocated.port == port.port)
                                    .and_then(|allocated| allocated.node_port);
                            }
                        }
                    }
                }
                live.spec = Some(spec);
                Ok(Derived::Service(live))
            }
            (live, built) => Err(Error::KindMismatch {
                live: live.kind(),
                built: built.kind(),
            }),
        }
    }

    fn require_name(&self) -> Result<(String, String), Error> {
        let meta = self.meta();
        let name = meta
            .name
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?;
        let namespace = meta
            .namespace
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        Ok((namespace, name))
    }
}

fn exposes_node_ports(spec: &ServiceSpec) -> bool {
    matches!(
        spec.type_.as_deref(),
        Some("NodePort") | Some("LoadBalancer")
    )
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_model_box(&self, namespace: &str, name: &str) -> Result<Option<ModelBox>, Error>;

    /// Replaces the ModelBox (metadata and spec) at its current resourceVersion.
    async fn update_model_box(&self, model_box: &ModelBox) -> Result<ModelBox, Error>;

    async fn patch_model_box_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ModelBoxStatus,
    ) -> Result<(), Error>;

    async fn get(
        &self,
        kind: DerivedKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Derived>, Error>;

    async fn create(&self, object: &Derived) -> Result<Derived, Error>;

    /// Replaces the object at its current resourceVersion.
    async fn update(&self, object: &Derived) -> Result<Derived, Error>;
}

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER_NAME.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get_model_box(&self, namespace: &str, name: &str) -> Result<Option<ModelBox>, Error> {
        let model_boxes: Api<ModelBox> = Api::namespaced(self.client.clone(), namespace);
        Ok(model_boxes.get_opt(name).await?)
    }

    async fn update_model_box(&self, model_box: &ModelBox) -> Result<ModelBox, Error> {
        let namespace = model_box
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let model_boxes: Api<ModelBox> = Api::namespaced(self.client.clone(), &namespace);
        Ok(model_boxes
            .replace(&model_box.name_any(), &Self::post_params(), model_box)
            .await?)
    }

    async fn patch_model_box_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ModelBoxStatus,
    ) -> Result<(), Error> {
        let model_boxes: Api<ModelBox> = Api::namespaced(self.client.clone(), namespace);
        let pp = PatchParams::apply(FIELD_MANAGER_NAME).force();
        let patch = Patch::Apply(json!({
            "apiVersion": ModelBox::api_version(&()),
            "kind": ModelBox::kind(&()),
            "status": status,
        }));

        model_boxes.patch_status(name, &pp, &patch).await?;
        Ok(())
    }

    async fn get(
        &self,
        kind: DerivedKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Derived>, Error> {
        let object = match kind {
            DerivedKind::Deployment => {
                let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                deployments.get_opt(name).await?.map(Derived::Deployment)
            }
            DerivedKind::Service => {
                let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
                services.get_opt(name).await?.map(Derived::Service)
            }
        };
        Ok(object)
    }

    async fn create(&self, object: &Derived) -> Result<Derived, Error> {
        let (namespace, _) = object.require_name()?;
        let pp = Self::post_params();
        let created = match object {
            Derived::Deployment(deployment) => {
                let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
                Derived::Deployment(deployments.create(&pp, deployment).await?)
            }
            Derived::Service(service) => {
                let services: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
                Derived::Service(services.create(&pp, service).await?)
            }
        };
        Ok(created)
    }

    async fn update(&self, object: &Derived) -> Result<Derived, Error> {
        let (namespace, name) = object.require_name()?;
        let pp = Self::post_params();
        let updated = match object {
            Derived::Deployment(deployment) => {
                let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
                Derived::Deployment(deployments.replace(&name, &pp, deployment).await?)
            }
            Derived::Service(service) => {
                let services: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
                Derived::Service(services.replace(&name, &pp, service).await?)
            }
        };
        Ok(updated)
    }
}
