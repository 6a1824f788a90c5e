use std::{sync::Arc, time::Duration};

use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};
use kube::{
    Api, ResourceExt,
    api::ListParams,
    client::Client,
    runtime::{
        Controller,
        controller::{self, Action},
        watcher,
    },
};
use tokio_stream::StreamExt;

use crate::{
    config::Config,
    crd::ModelBox,
    error::{Error, ErrorKind},
    last_applied::LastApplied,
    reconciler::{Outcome, Reconciler},
    store::{KubeStore, Store},
};

pub struct Context {
    pub reconciler: Reconciler<KubeStore>,
    pub config: Config,
}

impl Context {
    pub fn new(client: Client, config: Config) -> Self {
        Self {
            reconciler: Reconciler::new(KubeStore::new(client), config.settings()),
            config,
        }
    }
}

#[instrument(skip_all)]
async fn reconcile(model_box: Arc<ModelBox>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = model_box
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = model_box.name_any();

    info!(name, namespace, "reconciling ModelBox resource");

    let outcome = reconcile_with_deadline(
        &ctx.reconciler,
        &namespace,
        &name,
        ctx.config.reconcile_timeout(),
    )
    .await?;

    info!(name, namespace, ?outcome, "reconciled ModelBox resource");
    Ok(Action::await_change())
}

/// Runs one reconcile, failing with [`Error::ReconcileTimeout`] once `deadline` passes.
pub async fn reconcile_with_deadline<S: Store, L: LastApplied>(
    reconciler: &Reconciler<S, L>,
    namespace: &str,
    name: &str,
    deadline: Duration,
) -> Result<Outcome, Error> {
    tokio::time::timeout(deadline, reconciler.reconcile(namespace, name))
        .await
        .map_err(|_| Error::ReconcileTimeout(deadline))?
}

#[instrument(skip_all)]
fn error_policy(model_box: Arc<ModelBox>, error: &Error, ctx: Arc<Context>) -> Action {
    requeue_after_error(&model_box, error, &ctx.config)
}

fn requeue_after_error(model_box: &ModelBox, error: &Error, config: &Config) -> Action {
    let name = model_box.name_any();
    match error.kind() {
        ErrorKind::Conflict => warn!(name, ?error, "gave up on conflicting writes"),
        kind => error!(name, ?kind, ?error, "error occured on reconcile loop"),
    }
    Action::requeue(config.error_requeue())
}

#[instrument(skip_all)]
pub async fn run(ctx: Context) -> Result<(), Error> {
    let client = ctx.reconciler.store().client();
    let (model_boxes, deployments, services) = match ctx.config.namespace.as_deref() {
        Some(namespace) => (
            Api::<ModelBox>::namespaced(client.clone(), namespace),
            Api::<Deployment>::namespaced(client.clone(), namespace),
            Api::<Service>::namespaced(client, namespace),
        ),
        None => (
            Api::<ModelBox>::all(client.clone()),
            Api::<Deployment>::all(client.clone()),
            Api::<Service>::all(client),
        ),
    };

    info!("checking if CRDs are installed");
    let _ = model_boxes.list(&ListParams::default().limit(1)).await?;
    info!("confirmed that CRDs are installed");

    let concurrency = ctx.config.concurrency;
    let stream = Controller::new(model_boxes, watcher::Config::default().any_semantic())
        .owns(deployments, watcher::Config::default())
        .owns(services, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(ctx));
    let mut stream = std::pin::pin!(stream);

    info!(concurrency, "starting up controller loop process");
    while let Some(res) = stream.next().await {
        if let Err(e) = res {
            error!(error = ?e, "error occured on controller loop");
        }
    }

    info!("controller has been terminated");

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use envconfig::Envconfig;

    use super::*;
    use crate::{
        crd::{ModelBoxSpec, ModelBoxStatus},
        error::api_error,
        reconciler::Settings,
        store::{Derived, DerivedKind, memory::MemoryStore},
    };

    struct Stalled;

    #[async_trait]
    impl Store for Stalled {
        async fn get_model_box(&self, _: &str, _: &str) -> Result<Option<ModelBox>, Error> {
            std::future::pending().await
        }

        async fn update_model_box(&self, _: &ModelBox) -> Result<ModelBox, Error> {
            unreachable!()
        }

        async fn patch_model_box_status(
            &self,
            _: &str,
            _: &str,
            _: &ModelBoxStatus,
        ) -> Result<(), Error> {
            unreachable!()
        }

        async fn get(&self, _: DerivedKind, _: &str, _: &str) -> Result<Option<Derived>, Error> {
            unreachable!()
        }

        async fn create(&self, _: &Derived) -> Result<Derived, Error> {
            unreachable!()
        }

        async fn update(&self, _: &Derived) -> Result<Derived, Error> {
            unreachable!()
        }
    }

    fn config() -> Config {
        Config::init_from_hashmap(&HashMap::new()).unwrap()
    }

    fn model_box() -> ModelBox {
        let spec: ModelBoxSpec = serde_json::from_value(serde_json::json!({
            "image": "nginx:1.7.9",
            "ports": [{"name": "app", "port": 80}],
            "rollingUpdate": "30%",
        }))
        .unwrap();
        ModelBox::new("demo", spec)
    }

    #[tokio::test(start_paused = true)]
    async fn slow_reconcile_times_out() {
        let reconciler = Reconciler::new(Stalled, Settings::default());

        let error = reconcile_with_deadline(&reconciler, "default", "demo", Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(error, Error::ReconcileTimeout(d) if d == Duration::from_secs(30)));
        assert_eq!(error.kind(), ErrorKind::TransientIo);
    }

    #[tokio::test]
    async fn reconcile_within_deadline_returns_outcome() {
        let reconciler = Reconciler::new(MemoryStore::new(), Settings::default());

        let outcome = reconcile_with_deadline(&reconciler, "default", "demo", Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Missing);
    }

    #[test]
    fn failures_requeue_after_configured_delay() {
        let config = config();

        for error in [
            api_error(409, "Conflict"),
            api_error(503, "ServiceUnavailable"),
            Error::ReconcileTimeout(Duration::from_secs(30)),
        ] {
            assert_eq!(
                requeue_after_error(&model_box(), &error, &config),
                Action::requeue(Duration::from_secs(10))
            );
        }
    }
}
