use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use field_bus::LocalBus;
use field_sync::config::AppConfig;
use field_sync::coordinator::FieldCoordinator;
use field_sync::identity::{Actor, HolderDirectory, StaticDirectory};
use field_sync::queue::HandlerRegistry;
use field_sync::rest::RestClient;
use field_sync::routes;
use field_sync::state::AppState;
use field_sync::telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cfg = AppConfig::from_env().context("load config")?;
    init_tracing(&cfg.log_filter);

    let registry = HandlerRegistry::new();
    let directory: Arc<dyn HolderDirectory> = match &cfg.api_base_url {
        Some(base_url) => {
            let client = RestClient::new(base_url.clone(), cfg.api_token.clone())
                .context("build api client")?;
            client.register_all(&registry);
            Arc::new(client)
        }
        None => {
            warn!("FIELD_API_BASE_URL unset; writes stay queued until handlers exist");
            Arc::new(StaticDirectory::default())
        }
    };

    let bus = Arc::new(LocalBus::new());
    let coordinator = FieldCoordinator::build(&cfg, bus, registry, directory)
        .await
        .context("open coordinator")?;
    if let Some(actor_id) = &cfg.actor_id {
        coordinator.sign_in(Actor::new(actor_id.clone(), cfg.actor_name.clone()));
    }
    coordinator.start().await;

    let app: Router = routes::router(AppState::new(coordinator));

    info!(
        addr = %cfg.bind_addr,
        lease_backend = ?cfg.lease_backend,
        database = %cfg.database_url.as_deref().unwrap_or("unset"),
        redis = %cfg.redis_url.as_deref().unwrap_or("unset"),
        data_dir = %cfg.data_dir.as_deref().unwrap_or("memory"),
        team = %cfg.team_id.as_deref().unwrap_or("unset"),
        api = %cfg.api_base_url.as_deref().unwrap_or("unset"),
        heartbeat_secs = cfg.heartbeat_interval_secs,
        stale_after_secs = cfg.lease_stale_after_secs,
        "starting field-sync"
    );
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("bind {}", cfg.bind_addr))?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
