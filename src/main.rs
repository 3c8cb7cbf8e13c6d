mod availability;
mod config;
mod db;
mod docker;
mod error;
mod policy;
mod ports;
mod reconciler;
mod reservation;

use anyhow::Result;
use tracing::info;

use crate::config::AppConfig;
use crate::db::Database;
use crate::docker::DockerEffector;
use crate::ports::PortAllocator;

/// Operational entrypoint for one reservation-platform node. Spec §C:
/// this crate is a library — Store, Policy Resolver, Availability Engine,
/// Reservation Service, Port Allocator, and Reconciler are plain async APIs
/// callable from any driver. `main` is the reference driver: it wires
/// configuration, the database, and a Docker connection together and runs
/// this node's Reconciler loop. There is no network listener here; reads and
/// writes against reservations happen by calling `reservation::*` directly,
/// in-process or from another crate that depends on this one.
#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "container_reservation_platform=info".into()),
        )
        .init();

    info!(
        "starting container reservation platform node v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = AppConfig::from_env()?;
    info!(server_name = %config.server_name, "configuration loaded");

    let db = Database::connect(&config.database_url).await?;
    db.migrate().await?;
    info!("database ready");

    let effector = DockerEffector::connect(&config.docker_host, &config.registry_address).await?;
    let port_allocator = PortAllocator::new();

    reconciler::run_forever(db, effector, port_allocator, config).await
}
