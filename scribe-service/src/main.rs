use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::{info, warn};

use scribe_service::api;
use scribe_service::config::load_settings;
use scribe_service::service::ScribeService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_settings()?;

    init_logging(settings.logging.json);

    info!("Starting Scribe service v{}", env!("CARGO_PKG_VERSION"));

    for warning in settings.validate() {
        warn!("{}", warning);
    }

    info!(
        host = %settings.server.host,
        port = settings.server.port,
        csv = %settings.storage.csv_path.display(),
        "Configuration loaded"
    );

    // Prometheus recorder backing the metrics macros
    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Metrics recorder unavailable, /metrics will be empty");
            None
        }
    };

    let addr = format!("{}:{}", settings.server.host, settings.server.port);

    let service = Arc::new(ScribeService::new(settings)?);
    let app = api::router(service, metrics);

    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn init_logging(json: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("scribe_service=info,tower_http=info"));

    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        let format = fmt::format()
            .with_target(true)
            .with_thread_ids(true)
            .compact();
        registry.with(fmt::layer().event_format(format)).init();
    }
}
