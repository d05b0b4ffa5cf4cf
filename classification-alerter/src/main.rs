use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use classification_alerter::config::Config;
use classification_alerter::health::HealthRegistry;
use classification_alerter::server::{router, serve, setup_metrics_recorder, setup_metrics_routes};
use classification_alerter::service::ClassificationAlerterService;

/// Logs go to stderr; stdout carries the alerts.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn start_server(config: &Config, liveness: HealthRegistry) -> Result<JoinHandle<()>> {
    let recorder = setup_metrics_recorder().context("Failed to install metrics recorder")?;
    let router = setup_metrics_routes(router(liveness), recorder);
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!(bind = %bind, error = ?e, "metrics server failed");
        }
    }))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = ?e, "failed to listen for SIGTERM"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = ?e, "failed to listen for ctrl+c, shutting down");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    info!("starting classification alerter");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    info!(
        stream = %config.stream_name,
        consumer_group = %config.stream_consumer_group,
        "configuration loaded"
    );

    let liveness = HealthRegistry::new("liveness");
    let server_handle = start_server(&config, liveness.clone())?;
    info!("started metrics server on {}", config.bind_address());

    let service = ClassificationAlerterService::new(config, &liveness)
        .await
        .context("Failed to start classification alerter")?;

    service.run_with_shutdown(shutdown_signal()).await?;

    server_handle.abort();
    Ok(())
}
