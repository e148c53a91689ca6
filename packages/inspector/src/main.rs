use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use inspector::{CaptureServer, RequestIdGenerator, RequestStore, Settings, StoreEvent};

/// Filter directive that surfaces requests the HTTP parser rejects (400/431)
const PARSE_ERROR_DIRECTIVE: &str = "actix_http::h1::dispatcher=trace";

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if exists)
    dotenvy::dotenv().ok();

    // Initialize logging
    init_tracing();
    if std::env::var_os("RUST_LOG").is_none() {
        info!(
            hint = %format!("RUST_LOG=info,{PARSE_ERROR_DIRECTIVE}"),
            "Unparseable requests are answered by the HTTP parser and logged at trace level"
        );
    }

    // Load configuration
    let settings = Settings::load().map_err(|e| {
        eprintln!("Failed to load settings: {}", e);
        e
    })?;

    info!(
        host = %settings.server.host,
        preferred_port = settings.server.port,
        max_capacity = settings.store.max_capacity,
        max_body_size = settings.capture.max_body_size,
        redacted_headers = settings.capture.redact_headers.len(),
        "Starting request inspector"
    );

    let store = Arc::new(RequestStore::new(&settings.store));
    let server = CaptureServer::new(
        settings.server.clone(),
        settings.capture.clone(),
        Arc::new(RequestIdGenerator::new()),
    );

    let port = server.start(settings.server.port, store.clone())?;
    info!(
        url = %format!("http://{}:{}", settings.server.host, port),
        "Send any HTTP request to capture it"
    );

    // Live feed of captures, the same one a dashboard would consume
    let mut changes = store.changes();
    tokio::spawn(async move {
        while let Some(event) = changes.next().await {
            if let StoreEvent::Added { id, evicted, resident } = event {
                debug!(id, ?evicted, resident, "Store updated");
            }
        }
    });

    // Periodic statistics summary
    let stats_store = store.clone();
    let stats_interval = Duration::from_secs(settings.server.stats_interval_secs.max(1));
    let maintenance = tokio::spawn(async move {
        let mut interval = tokio::time::interval(stats_interval);
        interval.tick().await;

        loop {
            interval.tick().await;
            let stats = stats_store.statistics_snapshot();
            info!(
                total = stats.total_count,
                average_body_size = stats.average_body_size,
                methods = ?stats.count_by_method,
                top_path = ?stats.top_paths.first().map(|p| p.path.as_str()),
                "Capture statistics"
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    maintenance.abort();
    server.stop().await;

    let stats = store.statistics_snapshot();
    info!(
        summary = %serde_json::to_string(&stats)?,
        "Final capture statistics"
    );

    Ok(())
}

/// Initialize tracing/logging subscriber
fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}
