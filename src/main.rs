use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::{cors::CorsLayer, services::ServeDir};

use mc_fleet_agent::api::{self, AppState};
use mc_fleet_agent::config;
use mc_fleet_agent::controller::Services;
use mc_fleet_agent::fleet::{self, Fleet};
use mc_fleet_agent::hub::Hub;
use mc_fleet_agent::idle::VanillaLogMatcher;
use mc_fleet_agent::probe::{HttpAvatars, ServerListPing};
use mc_fleet_agent::process::{self, JavaLauncher};
use mc_fleet_agent::runtime::{RuntimeCatalog, RuntimeDiscovery};
use mc_fleet_agent::usage::{SysinfoUsage, UsageProbe};

const HUB_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load_config().await?;
    let servers = fleet::discover(&cfg.server_path).await?;
    tracing::info!("Found {} servers in {}", servers.len(), cfg.server_path.display());

    // Kill any orphaned servers from a previous crash
    process::kill_orphaned_servers(&servers).await;

    let hub = Arc::new(Hub::new(HUB_CAPACITY));
    let runtimes: Arc<dyn RuntimeCatalog> = Arc::new(RuntimeDiscovery::new(cfg.runtime_scan_dirs.clone()));
    let services = Services {
        runtimes: runtimes.clone(),
        launcher: Arc::new(JavaLauncher),
        probe: Arc::new(ServerListPing::new(Arc::new(HttpAvatars::new(cfg.avatar_url.clone())?))),
        publisher: hub.clone(),
        matcher: Arc::new(VanillaLogMatcher),
    };
    let fleet = Fleet::launch(servers, services, cfg.fleet_settings(), || {
        Box::new(SysinfoUsage::new()) as Box<dyn UsageProbe>
    });

    let state = AppState {
        fleet: fleet.clone(),
        hub: hub.clone(),
        runtimes,
    };
    let app = Router::new()
        .route("/api/version", get(api::version))
        .route("/api/runtimes", get(api::list_runtimes))
        .route("/api/servers", get(api::list_servers))
        .route("/ws", get(api::socket))
        .layer(CorsLayer::permissive())
        .with_state(state)
        .fallback_service(ServeDir::new(&cfg.static_dir));

    let listener = tokio::net::TcpListener::bind(&cfg.bind_address).await?;
    tracing::info!("Listening on {}", cfg.bind_address);

    let shutdown_timeout = cfg.shutdown_timeout();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutting down servers...");
            fleet.shutdown(shutdown_timeout).await;
            hub.close();
        })
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
