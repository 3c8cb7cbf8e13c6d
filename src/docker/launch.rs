//! Container Launch assembly (spec §4.4): turns one `reserved` reservation
//! into a running container. Called by the Reconciler's `startNewServers`
//! step; never called directly by anything user-facing.

use anyhow::{Context, Result};
use chrono::Utc;
use rand::RngExt;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::db::models::{Container, ContainerPort, Reservation, ReservedContainer};
use crate::db::Database;
use crate::policy::{self, ResolvedMount};
use crate::ports::PortAllocator;

use super::{ContainerRunSpec, DockerEffector};

/// Spec §4.4 step 1: "strong, ≥32 characters".
const SSH_PASSWORD_LEN: usize = 32;

/// Launch the reservation identified by `reservation_id`. On any failure
/// during assembly or the Docker call, rolls back the partial container
/// (best effort) and transitions the reservation to `error` with the
/// failure recorded on the reserved container (spec §4.4 "On any exception").
pub async fn launch_reservation(
    db: &Database,
    effector: &DockerEffector,
    port_allocator: &PortAllocator,
    config: &AppConfig,
    reservation_id: &str,
) -> Result<()> {
    match try_launch(db, effector, port_allocator, config, reservation_id).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(reservation_id, error = %e, "container launch failed, rolling back");
            rollback(db, effector, reservation_id, &e.to_string()).await;
            Ok(())
        }
    }
}

async fn try_launch(
    db: &Database,
    effector: &DockerEffector,
    port_allocator: &PortAllocator,
    config: &AppConfig,
    reservation_id: &str,
) -> Result<()> {
    let reservation: Reservation = sqlx::query_as("SELECT * FROM reservations WHERE id = ?")
        .bind(reservation_id)
        .fetch_one(&db.pool)
        .await
        .context("reservation not found")?;

    let reserved_container: ReservedContainer = sqlx::query_as(
        "SELECT * FROM reserved_containers WHERE id = ?",
    )
    .bind(&reservation.reserved_container_id)
    .fetch_one(&db.pool)
    .await
    .context("reserved container not found")?;

    let container: Container = sqlx::query_as(
        "SELECT c.* FROM containers c \
         JOIN reserved_containers rc ON rc.container_id = c.id \
         WHERE rc.id = ?",
    )
    .bind(&reserved_container.id)
    .fetch_one(&db.pool)
    .await
    .context("container not found")?;

    let ports: Vec<ContainerPort> =
        sqlx::query_as("SELECT * FROM container_ports WHERE container_id = ?")
            .bind(&container.id)
            .fetch_all(&db.pool)
            .await
            .context("loading container ports")?;

    let user_email: String = sqlx::query_scalar("SELECT email FROM users WHERE id = ?")
        .bind(&reservation.user_id)
        .fetch_one(&db.pool)
        .await
        .context("reservation owner not found")?;

    let (ram_gb, cpus) = reserved_amounts(db, reservation_id).await?;
    let gpu_device_request = reserved_gpu_devices(db, reservation_id).await?;

    let policy = policy::resolve_policy(db, &reservation.user_id, &reservation.computer_id)
        .await
        .context("resolving mount policy")?;
    let volumes = materialize_mounts(&policy.mounts, &user_email, &reservation.user_id)?;

    let shm_gb = ram_gb * reserved_container.shm_size_percent as f64 / 100.0;
    let ram_disk_gb = if reserved_container.ram_disk_size_percent > 0 {
        Some(ram_gb * reserved_container.ram_disk_size_percent as f64 / 100.0)
    } else {
        None
    };

    let published_ports = if ports.is_empty() {
        Vec::new()
    } else {
        let outside_ports = port_allocator
            .allocate_many(
                db,
                &reservation.computer_id,
                config.port_range_start,
                config.port_range_end,
                ports.len(),
            )
            .await
            .context("allocating ports")?;
        ports
            .iter()
            .zip(outside_ports.iter())
            .map(|(p, outside)| (*outside, p.port as u16))
            .collect::<Vec<_>>()
    };

    let docker_name = container_docker_name(reservation_id, &container.image_name);
    let run_spec = ContainerRunSpec {
        name: docker_name.clone(),
        image: effector.qualify_image(&container.image_name),
        volumes,
        gpu_device_request,
        memory_limit_gb: ram_gb,
        shm_size_gb: shm_gb,
        cpus,
        published_ports: published_ports.clone(),
        ram_disk_size_gb: ram_disk_gb,
    };

    info!(reservation_id, container = %docker_name, "launching container");
    effector.run(&run_spec).await.context("docker run failed")?;

    let ssh_password = generate_ssh_password();
    if let Err(e) = effector
        .exec_set_ssh_password(&docker_name, &ssh_password)
        .await
    {
        warn!(reservation_id, error = %e, "failed to set ssh password, continuing");
    }

    let mut tx = db.pool.begin().await?;
    sqlx::query(
        "UPDATE reserved_containers SET container_docker_name = ?, ssh_password = ?, \
         started_at = ?, container_status = 'started', container_docker_error_message = NULL \
         WHERE id = ?",
    )
    .bind(&docker_name)
    .bind(&ssh_password)
    .bind(Utc::now())
    .bind(&reserved_container.id)
    .execute(&mut *tx)
    .await?;

    for ((port, outside), cp) in published_ports.iter().map(|(o, i)| (*i, *o)).zip(ports.iter())
    {
        let _ = port;
        sqlx::query(
            "INSERT INTO reserved_container_ports (id, reserved_container_id, container_port_id, outside_port) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&reserved_container.id)
        .bind(&cp.id)
        .bind(outside as i64)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query("UPDATE reservations SET status = 'started' WHERE id = ?")
        .bind(reservation_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    tracing::info!(target: "audit", reservation_id, container = %docker_name, "reservation started");
    Ok(())
}

async fn rollback(db: &Database, effector: &DockerEffector, reservation_id: &str, message: &str) {
    if let Some(Some(name)) = sqlx::query_scalar::<_, Option<String>>(
        "SELECT rc.container_docker_name FROM reserved_containers rc \
         JOIN reservations r ON r.reserved_container_id = rc.id \
         WHERE r.id = ?",
    )
    .bind(reservation_id)
    .fetch_optional(&db.pool)
    .await
    .unwrap_or(None)
    {
        let _ = effector.stop(&name).await;
        let _ = effector.remove(&name).await;
    }

    let truncated: String = message.chars().take(1000).collect();
    let _ = sqlx::query(
        "UPDATE reserved_containers SET container_status = 'error', container_docker_error_message = ? \
         WHERE id = (SELECT reserved_container_id FROM reservations WHERE id = ?)",
    )
    .bind(&truncated)
    .bind(reservation_id)
    .execute(&db.pool)
    .await;

    let _ = sqlx::query("UPDATE reservations SET status = 'error' WHERE id = ?")
        .bind(reservation_id)
        .execute(&db.pool)
        .await;
}

/// `(ram_gb, cpus)` from this reservation's reserved hardware specs.
async fn reserved_amounts(db: &Database, reservation_id: &str) -> Result<(f64, f64)> {
    let rows: Vec<(String, f64)> = sqlx::query_as(
        "SELECT hs.type, rhs.amount FROM reserved_hardware_specs rhs \
         JOIN hardware_specs hs ON hs.id = rhs.hardware_spec_id \
         WHERE rhs.reservation_id = ? AND hs.type IN ('ram', 'cpus')",
    )
    .bind(reservation_id)
    .fetch_all(&db.pool)
    .await?;

    let mut ram_gb = 0.0;
    let mut cpus = 0.0;
    for (kind, amount) in rows {
        match kind.as_str() {
            "ram" => ram_gb = amount,
            "cpus" => cpus = amount,
            _ => {}
        }
    }
    Ok((ram_gb, cpus))
}

/// `device=i1,i2,...` built from the `internal_id` of every `gpu`-typed
/// hardware spec reserved for this reservation (spec §4.4 step 6).
async fn reserved_gpu_devices(db: &Database, reservation_id: &str) -> Result<Option<String>> {
    let ids: Vec<Option<String>> = sqlx::query_scalar(
        "SELECT hs.internal_id FROM reserved_hardware_specs rhs \
         JOIN hardware_specs hs ON hs.id = rhs.hardware_spec_id \
         WHERE rhs.reservation_id = ? AND hs.type = 'gpu'",
    )
    .bind(reservation_id)
    .fetch_all(&db.pool)
    .await?;

    let ids: Vec<String> = ids.into_iter().flatten().collect();
    if ids.is_empty() {
        Ok(None)
    } else {
        Ok(Some(format!("device={}", ids.join(","))))
    }
}

/// Substitutes `{email}` (sanitized to `[A-Za-z0-9 ]`) and `{userid}` into
/// every resolved mount's host and container paths, creating the host
/// directory if it doesn't exist (spec §4.4 step 5).
fn materialize_mounts(
    mounts: &[ResolvedMount],
    email: &str,
    user_id: &str,
) -> Result<Vec<(String, String, bool)>> {
    let sanitized_email: String = email
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
        .collect();

    let mut out = Vec::with_capacity(mounts.len());
    for mount in mounts {
        let host_path = substitute(&mount.host_path, &sanitized_email, user_id);
        let container_path = substitute(&mount.container_path, &sanitized_email, user_id);

        std::fs::create_dir_all(&host_path)
            .with_context(|| format!("creating mount directory {host_path}"))?;

        out.push((host_path, container_path, mount.read_only));
    }
    Ok(out)
}

fn substitute(template: &str, email: &str, user_id: &str) -> String {
    template.replace("{email}", email).replace("{userid}", user_id)
}

/// `reservation-{reservationId}-{sanitizedImage}-{MM_DD_YYYY_HH_MM_SS}`
/// (spec §4.4 step 3).
fn container_docker_name(reservation_id: &str, image_name: &str) -> String {
    let sanitized_image: String = image_name
        .chars()
        .filter(|c| *c != ':' && *c != '/')
        .collect();
    let stamp = Utc::now().format("%m_%d_%Y_%H_%M_%S");
    format!("reservation-{reservation_id}-{sanitized_image}-{stamp}")
}

const PASSWORD_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

fn generate_ssh_password() -> String {
    let mut rng = rand::rng();
    (0..SSH_PASSWORD_LEN)
        .map(|_| PASSWORD_CHARSET[rng.random_range(0..PASSWORD_CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_email_to_alphanumeric_and_space() {
        let out = substitute("/data/{email}", "john doe", "u1");
        assert_eq!(out, "/data/john doe");
    }

    #[test]
    fn docker_name_strips_colons_and_slashes_from_image() {
        let name = container_docker_name("r1", "registry.example.com/my-image:latest");
        assert!(name.starts_with("reservation-r1-registry.example.commy-imagelatest-"));
    }

    #[test]
    fn ssh_password_has_expected_length() {
        let pw = generate_ssh_password();
        assert_eq!(pw.len(), SSH_PASSWORD_LEN);
        assert!(pw.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
