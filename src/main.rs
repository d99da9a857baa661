// Crag Conditions API v0.1
use axum::{
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod config;
mod db;
mod errors;
mod routes;
mod services;

use config::AppConfig;
use routes::AppState;
use services::cache::ConditionCache;
use services::calculator::ConditionCalculator;
use services::canopy::{CanopyClient, CanopyService};
use services::conditions::ConditionService;
use services::drying::{DryingCoefficients, DryingModel};
use services::gateway::{ProviderGateway, WeatherProvider};
use services::open_meteo::OpenMeteoClient;
use services::scheduler::{ConditionScheduler, SchedulerConfig};
use services::yr::YrClient;

/// Maximum number of connections in the database pool.
const DB_POOL_MAX_CONNECTIONS: u32 = 5;
/// Minimum number of connections kept alive in the database pool.
const DB_POOL_MIN_CONNECTIONS: u32 = 1;

/// Crag Conditions API: OpenAPI specification.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Crag Conditions API",
        version = "0.1.0",
        description = "Climbing and bouldering conditions for fixed crags. \
            Periodically pulls weather from open-meteo (falling back to yr.no), combines it \
            with tree-canopy coverage, and serves cached dryness, hours-until-dry and \
            pest-risk assessments per location.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Health", description = "Service health check"),
        (name = "Locations", description = "Tracked crags"),
        (name = "Conditions", description = "Condition assessments and on-demand refresh"),
        (name = "Scheduler", description = "Background refresh scheduler status"),
    ),
    paths(
        routes::health::health_check,
        routes::locations::list_locations,
        routes::conditions::get_conditions,
        routes::conditions::refresh_conditions,
        routes::scheduler::get_scheduler_status,
    ),
    components(
        schemas(
            routes::health::HealthResponse,
            routes::locations::LocationListItem,
            routes::conditions::ConditionsResponse,
            services::calculator::ConditionAssessment,
            services::calculator::DataSource,
            services::calculator::CanopySource,
            services::drying::DrynessCategory,
            services::pest::PestRiskLevel,
            services::scheduler::SchedulerStatus,
            services::scheduler::LocationRefreshStatus,
            errors::ErrorResponse,
        )
    )
)]
struct ApiDoc;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "crag_conditions_api=debug,tower_http=debug".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Connect and migrate the snapshot database. Any failure disables
/// persistence instead of stopping the service.
async fn connect_snapshot_store(database_url: &str) -> Option<PgPool> {
    let pool = match PgPoolOptions::new()
        .max_connections(DB_POOL_MAX_CONNECTIONS)
        .min_connections(DB_POOL_MIN_CONNECTIONS)
        .connect(database_url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Failed to connect to database, snapshots disabled: {}", e);
            return None;
        }
    };

    if let Err(e) = sqlx::migrate!().run(&pool).await {
        tracing::error!("Failed to run database migrations, snapshots disabled: {}", e);
        return None;
    }
    tracing::info!("Database migrations completed");
    Some(pool)
}

/// Re-read the registry on SIGHUP and swap it into the scheduler.
#[cfg(unix)]
fn spawn_registry_reload(
    scheduler: Arc<ConditionScheduler>,
    data_dir: PathBuf,
    shutdown: CancellationToken,
) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Registry reload on SIGHUP unavailable: {}", e);
                return;
            }
        };
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    match services::registry::load_locations_from_dir(&data_dir) {
                        Ok(locations) => scheduler.replace_locations(locations).await,
                        Err(e) => tracing::error!(
                            "Registry reload failed, keeping current locations: {}",
                            e
                        ),
                    }
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_registry_reload(_: Arc<ConditionScheduler>, _: PathBuf, _: CancellationToken) {}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = token.cancelled() => {},
    }
    tracing::info!("Shutdown requested");
    token.cancel();
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env();

    // Optional snapshot persistence
    let pool = match &config.database_url {
        Some(url) => connect_snapshot_store(url).await,
        None => {
            tracing::info!("DATABASE_URL not set, snapshot persistence disabled");
            None
        }
    };

    // Location registry
    let data_dir = PathBuf::from(&config.data_dir);
    let locations = services::registry::load_locations_from_dir(&data_dir).unwrap_or_else(|e| {
        tracing::error!(
            "Failed to load locations from {}: {}",
            data_dir.display(),
            e
        );
        Vec::new()
    });
    if locations.is_empty() {
        tracing::warn!("No locations tracked; add {}", services::registry::REGISTRY_FILE);
    }

    // Weather providers, in priority order
    let open_meteo = OpenMeteoClient::new(&config.open_meteo_base_url, config.lookback_hours)
        .expect("Failed to build open-meteo client");
    let yr = YrClient::new(&config.yr_base_url, &config.yr_user_agent)
        .expect("Failed to build yr.no client");
    let providers: Vec<Arc<dyn WeatherProvider>> = vec![Arc::new(open_meteo), Arc::new(yr)];
    let gateway = ProviderGateway::new(providers);
    tracing::info!("Weather providers: {}", gateway.provider_names().join(" → "));

    // Canopy lookup
    let canopy_client = CanopyClient::new(
        &config.canopy_api_url,
        config.canopy_api_key.clone(),
        config.canopy_min_spacing,
    )
    .expect("Failed to build canopy client");
    if !canopy_client.is_enabled() {
        tracing::info!("CANOPY_API_KEY not set, canopy lookup disabled");
    }
    let canopy_validity = chrono::Duration::from_std(config.canopy_validity)
        .unwrap_or_else(|_| chrono::Duration::zero());
    let canopy = Arc::new(CanopyService::new(
        Arc::new(canopy_client),
        canopy_validity,
        config.canopy_timeout,
    ));

    // Cache, warmed from the last snapshot when available
    let freshness =
        chrono::Duration::from_std(config.freshness).unwrap_or_else(|_| chrono::Duration::zero());
    let cache = Arc::new(ConditionCache::new(freshness));
    if let Some(pool) = &pool {
        match db::queries::load_assessment_snapshots(pool).await {
            Ok(snapshots) => {
                let restored = cache.restore(snapshots).await;
                tracing::info!("Restored {} assessments from snapshot", restored);
            }
            Err(e) => tracing::error!("Failed to load assessment snapshots: {}", e),
        }
    }

    let scheduler = ConditionScheduler::new(
        gateway,
        canopy,
        ConditionCalculator::new(DryingModel::new(DryingCoefficients::default())),
        cache,
        locations,
        pool.clone(),
        SchedulerConfig {
            interval: config.refresh_interval,
            provider_timeout: config.provider_timeout,
            force_refresh_timeout: config.force_refresh_timeout,
            concurrency: config.refresh_concurrency,
        },
    );

    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown.clone()));
    spawn_registry_reload(scheduler.clone(), data_dir, shutdown.clone());

    let app_state = AppState {
        conditions: ConditionService::new(scheduler),
        pool,
    };

    // CORS: GET for reads, POST for on-demand refresh; expose X-Conditions-Stale
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any)
        .expose_headers([axum::http::HeaderName::from_static("x-conditions-stale")]);

    let app = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .route("/api/v1/locations", get(routes::locations::list_locations))
        .route(
            "/api/v1/conditions/:location_id",
            get(routes::conditions::get_conditions),
        )
        .route(
            "/api/v1/conditions/:location_id/refresh",
            post(routes::conditions::refresh_conditions),
        )
        .route(
            "/api/v1/scheduler/status",
            get(routes::scheduler::get_scheduler_status),
        )
        .with_state(app_state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("API server listening on {}", addr);
    tracing::info!(
        "Swagger UI available at http://localhost:{}/swagger-ui/",
        config.port
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind TCP listener");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .expect("Server terminated unexpectedly");

    shutdown.cancel();
    if let Err(e) = scheduler_task.await {
        tracing::error!("Scheduler task failed: {}", e);
    }
}
