use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kestrel::cli;
use kestrel::controller::Controller;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,kestrel=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse args and env vars
    let args = cli::Cli::parse();
    let settings = args.into_settings();

    // 0 worker threads means the runtime picks its own size
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if settings.worker_threads > 0 {
        builder.worker_threads(settings.worker_threads);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(async move {
        info!("Starting {} {}", cli::APP_NAME, cli::APP_VERSION);
        let controller = Controller::new(settings);
        controller.run().await?;
        Ok(())
    })
}
