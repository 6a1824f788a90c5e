use kube::ResourceExt;

use crate::{
    builder::{build_deployment, build_service},
    crd::{ModelBox, ModelBoxSpec, ModelBoxStatus},
    error::{Error, ErrorKind},
    last_applied::{AnnotationLastApplied, LastApplied},
    retry::{RetryPolicy, retry_on_conflict},
    store::{Derived, DerivedKind, Store},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub retry: RetryPolicy,
    /// Record the applied spec after a successful diff-path update. Without
    /// it every later pass sees the same diff and writes again.
    pub refresh_last_applied: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            refresh_last_applied: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Missing,
    Deleting,
    Created,
    Unchanged,
    /// Diff path; flags tell which derived objects were written.
    Updated { deployment: bool, service: bool },
}

pub struct Reconciler<S, L = AnnotationLastApplied> {
    store: S,
    last_applied: L,
    settings: Settings,
}

impl<S: Store> Reconciler<S> {
    pub fn new(store: S, settings: Settings) -> Self {
        Self {
            store,
            last_applied: AnnotationLastApplied::default(),
            settings,
        }
    }
}

impl<S: Store, L: LastApplied> Reconciler<S, L> {
    pub fn with_last_applied<M: LastApplied>(self, last_applied: M) -> Reconciler<S, M> {
        Reconciler {
            store: self.store,
            last_applied,
            settings: self.settings,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[instrument(skip(self))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Outcome, Error> {
        let model_box = match self.store.get_model_box(namespace, name).await {
            Ok(Some(model_box)) => model_box,
            Ok(None) => {
                debug!("ModelBox is gone, nothing to reconcile");
                return Ok(Outcome::Missing);
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {
                debug!("ModelBox is gone, nothing to reconcile");
                return Ok(Outcome::Missing);
            }
            Err(error) => return Err(error),
        };

        if model_box.metadata.deletion_timestamp.is_some() {
            debug!("ModelBox is being deleted, leaving cleanup to garbage collection");
            return Ok(Outcome::Deleting);
        }

        match self
            .store
            .get(DerivedKind::Deployment, namespace, name)
            .await?
        {
            None => self.create(model_box, namespace, name).await,
            Some(deployment) => self.converge(model_box, deployment, namespace, name).await,
        }
    }

    async fn create(
        &self,
        model_box: ModelBox,
        namespace: &str,
        name: &str,
    ) -> Result<Outcome, Error> {
        info!("no Deployment found, creating derived objects");

        let Some(owner) = self
            .persist_last_applied(model_box, None, namespace, name)
            .await?
        else {
            return Ok(Outcome::Missing);
        };
        if owner.metadata.deletion_timestamp.is_some() {
            debug!("ModelBox is being deleted, skipping creation");
            return Ok(Outcome::Deleting);
        }

        self.create_derived(Derived::Deployment(build_deployment(&owner)))
            .await?;
        self.create_derived(Derived::Service(build_service(&owner)))
            .await?;

        Ok(Outcome::Created)
    }

    async fn converge(
        &self,
        model_box: ModelBox,
        deployment: Derived,
        namespace: &str,
        name: &str,
    ) -> Result<Outcome, Error> {
        let observed_status = match &deployment {
            Derived::Deployment(deployment) => {
                deployment.status.as_ref().map(ModelBoxStatus::from)
            }
            Derived::Service(_) => None,
        };
        let current_status = model_box.status.clone();

        let mut service_restored = false;
        let service = self
            .store
            .get(DerivedKind::Service, namespace, name)
            .await?;
        if service.is_none() {
            warn!("Service is missing, recreating it");
            self.create_derived(Derived::Service(build_service(&model_box)))
                .await?;
            service_restored = true;
        }

        let previous = self.recorded(&model_box);
        let outcome = if previous.as_ref() == Some(&model_box.spec) {
            if service_restored {
                Outcome::Updated {
                    deployment: false,
                    service: true,
                }
            } else {
                Outcome::Unchanged
            }
        } else {
            self.apply_diff(model_box, previous, deployment, service, namespace, name)
                .await?
        };

        self.sync_status(
            current_status.as_ref(),
            observed_status,
            namespace,
            name,
        )
        .await?;

        Ok(outcome)
    }

    async fn apply_diff(
        &self,
        model_box: ModelBox,
        previous: Option<ModelBoxSpec>,
        deployment: Derived,
        service: Option<Derived>,
        namespace: &str,
        name: &str,
    ) -> Result<Outcome, Error> {
        let built_deployment = build_deployment(&model_box);
        let built_service = build_service(&model_box);

        let (deployment_changed, service_changed) = match previous {
            Some(previous) => {
                let before = ModelBox {
                    spec: previous,
                    ..model_box.clone()
                };
                (
                    build_deployment(&before).spec != built_deployment.spec,
                    build_service(&before).spec != built_service.spec,
                )
            }
            None => {
                info!("no readable last-applied spec, re-applying all derived objects");
                (true, true)
            }
        };
        let restored = service.is_none();
        let service_changed = service_changed && !restored;

        info!(deployment_changed, service_changed, "spec changed since last apply");

        if deployment_changed {
            self.update_derived(
                Derived::Deployment(built_deployment),
                Some(deployment),
                namespace,
                name,
            )
            .await?;
        }
        if service_changed {
            self.update_derived(Derived::Service(built_service), service, namespace, name)
                .await?;
        }

        if self.settings.refresh_last_applied {
            let applied = model_box.spec.clone();
            self.persist_last_applied(model_box, Some(&applied), namespace, name)
                .await?;
        }

        Ok(Outcome::Updated {
            deployment: deployment_changed,
            service: service_changed || restored,
        })
    }

    fn recorded(&self, model_box: &ModelBox) -> Option<ModelBoxSpec> {
        match self.last_applied.get(model_box) {
            Ok(spec) => spec,
            Err(error) => {
                warn!(%error, "ignoring unreadable last-applied spec");
                None
            }
        }
    }

    /// Writes `applied` (or the object's own spec) as last-applied, re-reading
    /// the ModelBox on conflict. Returns `None` if the ModelBox disappeared and
    /// leaves a deleting ModelBox untouched.
    async fn persist_last_applied(
        &self,
        model_box: ModelBox,
        applied: Option<&ModelBoxSpec>,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ModelBox>, Error> {
        let mut fetched = Some(model_box);
        retry_on_conflict(&self.settings.retry, "persist last-applied spec", move |_| {
            self.persist_last_applied_once(fetched.take(), applied, namespace, name)
        })
        .await
    }

    async fn persist_last_applied_once(
        &self,
        fetched: Option<ModelBox>,
        applied: Option<&ModelBoxSpec>,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ModelBox>, Error> {
        let current = match fetched {
            Some(model_box) => Some(model_box),
            None => self.store.get_model_box(namespace, name).await?,
        };
        let Some(mut current) = current else {
            return Ok(None);
        };
        if current.metadata.deletion_timestamp.is_some() {
            return Ok(Some(current));
        }

        let spec = applied.cloned().unwrap_or_else(|| current.spec.clone());
        if self.recorded(&current).as_ref() == Some(&spec) {
            return Ok(Some(current));
        }

        self.last_applied.set(&mut current, &spec)?;
        let updated = self.store.update_model_box(&current).await?;
        debug!(version = ?updated.resource_version(), "recorded last-applied spec");
        Ok(Some(updated))
    }

    async fn create_derived(&self, object: Derived) -> Result<(), Error> {
        let kind = object.kind();
        match self.store.create(&object).await {
            Ok(_) => {
                info!(%kind, "created");
                Ok(())
            }
            Err(error) if error.is_already_exists() => {
                debug!(%kind, "already exists");
                Ok(())
            }
            Err(error) => {
                error!(%kind, %error, "create failed");
                Err(error)
            }
        }
    }

    async fn update_derived(
        &self,
        built: Derived,
        live: Option<Derived>,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error> {
        let built = &built;
        let mut fetched = live;
        retry_on_conflict(&self.settings.retry, "update derived object", move |_| {
            self.update_derived_once(built, fetched.take(), namespace, name)
        })
        .await
    }

    async fn update_derived_once(
        &self,
        built: &Derived,
        fetched: Option<Derived>,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error> {
        let kind = built.kind();
        let live = match fetched {
            Some(live) => Some(live),
            None => self.store.get(kind, namespace, name).await?,
        };

        match live {
            Some(live) => {
                self.store.update(&live.with_spec_from(built)?).await?;
                info!(%kind, "updated");
                Ok(())
            }
            None => self.create_derived(built.clone()).await,
        }
    }

    async fn sync_status(
        &self,
        current: Option<&ModelBoxStatus>,
        observed: Option<ModelBoxStatus>,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error> {
        let Some(observed) = observed else {
            return Ok(());
        };
        if current == Some(&observed) {
            return Ok(());
        }

        debug!(ready = ?observed.ready_replicas, "mirroring rollout status");
        self.store
            .patch_model_box_status(namespace, name, &observed)
            .await
    }
}
