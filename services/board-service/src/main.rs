use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use squares_board_service::{
    build_config, router, spawn_delivery_sweep, AppState, Args, ServiceConfig, ServiceWallet,
};
use squares_execution::{BoardStore, Engine, Memory, SqliteStore};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() -> Result<()> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        });

    if let Some(endpoint) = endpoint {
        let service_name = std::env::var("OTEL_SERVICE_NAME")
            .unwrap_or_else(|_| "squares-board-service".to_string());
        let rate = std::env::var("OTEL_SAMPLING_RATE")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .map(|value| value.clamp(0.0, 1.0))
            .unwrap_or(1.0);
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .context("failed to build OTLP exporter")?;
        let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(rate))
            .with_resource(
                opentelemetry_sdk::Resource::builder_empty()
                    .with_attributes([opentelemetry::KeyValue::new("service.name", service_name)])
                    .build(),
            )
            .with_batch_exporter(exporter)
            .build();
        let tracer = tracer_provider.tracer("squares-board-service");
        opentelemetry::global::set_tracer_provider(tracer_provider);

        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(LevelFilter::INFO))
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    Ok(())
}

async fn serve<S: BoardStore>(store: S, config: ServiceConfig) -> Result<()> {
    let wallet = ServiceWallet::from_config(&config)?;
    let engine = Arc::new(
        Engine::new(Arc::new(store), Arc::new(wallet), config.engine)
            .context("failed to build engine")?,
    );

    let _sweep = spawn_delivery_sweep(engine.clone(), config.sweep_interval);
    if config.admin_token.is_none() {
        info!("no admin token configured; admin routes are disabled");
    }
    let app = router(AppState::new(engine, config.admin_token.clone()));

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;
    info!("Listening on {}", config.addr);
    axum::serve(listener, app)
        .await
        .context("axum server error")?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing()?;
    let config = build_config(&args)?;

    match &config.db_path {
        Some(path) => {
            let store = SqliteStore::open(path)?;
            info!(path = %path.display(), "sqlite board store opened");
            serve(store, config).await
        }
        None => {
            info!("using in-memory board store");
            serve(Memory::new(), config).await
        }
    }
}
