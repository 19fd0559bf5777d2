use std::sync::Arc;

use anyhow::Context as _;

use dripmail::api::{AppState, BearerAuth, api_routes};
use dripmail::campaign::{CampaignSource, CmsCampaignSource};
use dripmail::config::Config;
use dripmail::consent::ConsentStore;
use dripmail::pipeline::{SendPipeline, SendPipelineDeps};
use dripmail::series::{self, SeriesEngine};
use dripmail::store::{Database, LibSqlBackend};
use dripmail::token::TokenCodec;
use dripmail::transport::create_transport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Collaborators ────────────────────────────────────────────────────
    let http = reqwest::Client::new();
    let codec = TokenCodec::from_config(&config.token)?;
    let consent = ConsentStore::new(Arc::clone(&db), codec.clone());
    let transport = create_transport(&config.transport, http.clone())?;
    let campaigns: Arc<dyn CampaignSource> =
        Arc::new(CmsCampaignSource::new(http.clone(), &config.cms_url));

    let pipeline = SendPipeline::new(SendPipelineDeps {
        store: Arc::clone(&db),
        consent: consent.clone(),
        codec,
        transport: Arc::clone(&transport),
        http,
        asset_base_url: config.cms_url.clone(),
        send_timeout: config.send.send_timeout,
    });

    let engine = Arc::new(SeriesEngine::new(
        Arc::clone(&db),
        campaigns,
        pipeline.clone(),
        config.series.clone(),
    ));

    // ── Trigger ticker ───────────────────────────────────────────────────
    let interval = config.series.trigger_interval;
    let _ticker = if interval.is_zero() {
        tracing::info!("Trigger ticker disabled; cycles run only via the API");
        None
    } else {
        tracing::info!(interval_secs = interval.as_secs(), "Trigger ticker started");
        Some(series::spawn_trigger_ticker(Arc::clone(&engine), interval))
    };

    // ── HTTP API ─────────────────────────────────────────────────────────
    let app = api_routes(
        AppState {
            pipeline,
            engine,
            consent,
        },
        BearerAuth::new(config.auth_token.clone()),
    );

    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        %addr,
        transport = transport.name(),
        db = %config.db_path.display(),
        "dripmail listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
