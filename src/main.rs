use envconfig::Envconfig;
use kube::Client;
use tracing::info;
use tracing_subscriber::EnvFilter;

use modelbox_controller::{
    config::Config,
    controller::{self, Context},
    error::Error,
};

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init_from_env()?;
    let client = Client::try_default().await?;

    let ctx = Context::new(client, config);

    info!(namespace = ?ctx.config.namespace, "starting modelbox-controller");
    controller::run(ctx).await
}
