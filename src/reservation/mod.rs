//! Reservation Service (spec §2, §6): creates, extends, cancels, restarts,
//! and lists reservations. Calls the Policy Resolver and Availability Engine
//! to admit; allocates no ports and starts no containers — that is the
//! Reconciler's job.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::availability::{self, AvailabilityResult};
use crate::db::models::{Container, HardwareSpec, HardwareType, Reservation, ReservationStatus};
use crate::db::Database;
use crate::error::{ServiceError, ServiceResult};
use crate::policy::{self, EffectivePolicy};

/// Per-computer mutex serializing "check availability, then insert" for
/// reservation creation (spec §5 Ordering guarantees; §9 "Cross-reservation
/// atomicity for create"). Held across the availability read and the insert
/// so two concurrent creates on the same computer cannot both observe
/// capacity and both commit, violating invariant 1 (§8).
#[derive(Clone, Default)]
pub struct CreationLock {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl CreationLock {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_for(&self, computer_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(computer_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Reservations older than this are excluded from `list_own_reservations`
/// (spec §6: "listing is capped at 90 days back").
const OWN_RESERVATIONS_LOOKBACK_DAYS: i64 = 90;

const MAX_DESCRIPTION_LEN: usize = 50;
const SHM_PERCENT_RANGE: (i64, i64) = (10, 90);
const RAM_DISK_PERCENT_RANGE: (i64, i64) = (0, 60);
const MAX_DURATION_HOURS_ABSOLUTE: i64 = 8760;
const MAX_EXTENSION_HOURS: i64 = 24;

/// Non-admin users are capped at one GPU per reservation unless a role
/// grants a higher cap for one of the requested GPU specs, in which case
/// that higher cap (not the sum) bounds the total requested GPU count.
const DEFAULT_NON_ADMIN_GPU_CAP: f64 = 1.0;

pub struct CreateReservationInput {
    pub user_id: String,
    pub computer_id: String,
    pub container_id: String,
    pub start_date: DateTime<Utc>,
    pub duration_hours: i64,
    pub hardware: HashMap<String, f64>,
    pub description: Option<String>,
    pub shm_size_percent: i64,
    pub ram_disk_size_percent: i64,
    /// When set and the acting user is an admin, the reservation is created
    /// on behalf of this user instead.
    pub admin_reserve_user_email: Option<String>,
}

fn validate_common(
    description: &Option<String>,
    shm_size_percent: i64,
    ram_disk_size_percent: i64,
) -> ServiceResult<()> {
    if let Some(d) = description {
        if d.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(ServiceError::InvalidRequest(format!(
                "description must be at most {MAX_DESCRIPTION_LEN} characters"
            )));
        }
    }
    if shm_size_percent < SHM_PERCENT_RANGE.0 || shm_size_percent > SHM_PERCENT_RANGE.1 {
        return Err(ServiceError::InvalidRequest(format!(
            "shm size percent must be between {} and {}",
            SHM_PERCENT_RANGE.0, SHM_PERCENT_RANGE.1
        )));
    }
    if ram_disk_size_percent < RAM_DISK_PERCENT_RANGE.0
        || ram_disk_size_percent > RAM_DISK_PERCENT_RANGE.1
    {
        return Err(ServiceError::InvalidRequest(format!(
            "ram disk size percent must be between {} and {}",
            RAM_DISK_PERCENT_RANGE.0, RAM_DISK_PERCENT_RANGE.1
        )));
    }
    Ok(())
}

async fn resolve_user_id_for_admin_override(
    db: &Database,
    acting_user_id: &str,
    policy: &EffectivePolicy,
    admin_reserve_user_email: Option<&str>,
) -> ServiceResult<String> {
    match admin_reserve_user_email {
        Some(email) if policy.is_admin => {
            let row: Option<(String,)> = sqlx::query_as("SELECT id FROM users WHERE email = ?")
                .bind(email)
                .fetch_optional(&db.pool)
                .await
                .map_err(|e| ServiceError::Internal(e.into()))?;
            row.map(|(id,)| id)
                .ok_or_else(|| ServiceError::InvalidRequest(format!("no such user: {email}")))
        }
        Some(_) => Err(ServiceError::Forbidden(
            "only admins may reserve on behalf of another user".to_string(),
        )),
        None => Ok(acting_user_id.to_string()),
    }
}

/// Count of this user's reservations with status in {reserved, started}.
async fn active_reservation_count(db: &Database, user_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM reservations WHERE user_id = ? AND status IN ('reserved', 'started')",
    )
    .bind(user_id)
    .fetch_one(&db.pool)
    .await?;
    Ok(count)
}

/// Validates hardware amounts against the availability result and policy
/// caps, and additionally enforces the non-admin aggregate GPU cap (spec §B
/// supplemental: sum of requested `gpu`-type amounts is capped at the
/// highest role-granted cap among the requested GPU specs, or 1 if none).
fn validate_hardware_request(
    requested: &HashMap<String, f64>,
    availability: &AvailabilityResult,
    policy: &EffectivePolicy,
) -> ServiceResult<()> {
    let spec_index: HashMap<&str, &HardwareSpec> = availability
        .computers
        .iter()
        .flat_map(|c| c.specs.iter())
        .map(|s| (s.spec.id.as_str(), &s.spec))
        .collect();

    let available_index: HashMap<&str, (f64, f64)> = availability
        .computers
        .iter()
        .flat_map(|c| c.specs.iter())
        .map(|s| (s.spec.id.as_str(), (s.remaining, s.maximum_amount_for_user)))
        .collect();

    let mut total_gpu_requested = 0.0;
    let mut gpu_cap_bound: Option<f64> = None;

    for (spec_id, amount) in requested {
        if *amount < 0.0 {
            return Err(ServiceError::InvalidRequest(format!(
                "amount for {spec_id} must be non-negative"
            )));
        }
        if *amount == 0.0 {
            continue;
        }

        let spec = spec_index
            .get(spec_id.as_str())
            .ok_or_else(|| ServiceError::InvalidRequest(format!("no such hardware spec: {spec_id}")))?;

        let (remaining, max_for_user) = available_index
            .get(spec_id.as_str())
            .copied()
            .unwrap_or((0.0, 0.0));

        if *amount > remaining {
            return Err(ServiceError::Denied(format!(
                "Not enough resources to make a reservation: {}. Available: {} {} {}.",
                spec.kind(),
                remaining,
                spec.format,
                spec.kind()
            )));
        }
        if *amount > max_for_user {
            return Err(ServiceError::Denied(format!(
                "Requested amount for {} exceeds your allowed maximum of {} {}.",
                spec.kind(),
                max_for_user,
                spec.format
            )));
        }

        if spec.kind() == HardwareType::Gpu && !policy.is_admin {
            total_gpu_requested += amount;
            let role_cap = policy.hardware_caps.get(spec_id).copied();
            gpu_cap_bound = Some(match (gpu_cap_bound, role_cap) {
                (None, Some(c)) => c,
                (Some(existing), Some(c)) => existing.max(c),
                (Some(existing), None) => existing,
                (None, None) => DEFAULT_NON_ADMIN_GPU_CAP,
            });
        }
    }

    if !policy.is_admin {
        let bound = gpu_cap_bound.unwrap_or(DEFAULT_NON_ADMIN_GPU_CAP);
        if total_gpu_requested > bound {
            return Err(ServiceError::Denied(format!(
                "Requested GPU count {total_gpu_requested} exceeds your allowed maximum of {bound}."
            )));
        }
    }

    Ok(())
}

/// Creates a reservation with status `reserved`. Admission order: validate
/// input bounds, resolve policy, resolve duration/active-count caps, check
/// availability, validate each requested hardware amount, then insert.
pub async fn create_reservation(
    db: &Database,
    creation_lock: &CreationLock,
    input: CreateReservationInput,
) -> ServiceResult<Reservation> {
    validate_common(
        &input.description,
        input.shm_size_percent,
        input.ram_disk_size_percent,
    )?;

    if input.duration_hours <= 0 || input.duration_hours > MAX_DURATION_HOURS_ABSOLUTE {
        return Err(ServiceError::InvalidRequest(format!(
            "duration must be between 1 and {MAX_DURATION_HOURS_ABSOLUTE} hours"
        )));
    }

    let acting_policy = policy::resolve_policy(db, &input.user_id, &input.computer_id)
        .await
        .map_err(ServiceError::Internal)?;

    let target_user_id = resolve_user_id_for_admin_override(
        db,
        &input.user_id,
        &acting_policy,
        input.admin_reserve_user_email.as_deref(),
    )
    .await?;

    let policy = if target_user_id == input.user_id {
        acting_policy
    } else {
        policy::resolve_policy(db, &target_user_id, &input.computer_id)
            .await
            .map_err(ServiceError::Internal)?
    };

    if input.duration_hours < policy.min_duration_hours {
        return Err(ServiceError::Denied(format!(
            "Minimum duration is {} hours.",
            policy.min_duration_hours
        )));
    }
    if input.duration_hours > policy.max_duration_hours {
        return Err(ServiceError::Denied(format!(
            "Maximum duration is {} hours.",
            policy.max_duration_hours
        )));
    }

    let active_count = active_reservation_count(db, &target_user_id)
        .await
        .map_err(ServiceError::Internal)?;
    if active_count >= policy.max_active_reservations {
        return Err(ServiceError::Denied(format!(
            "You can only have {} active reservation(s).",
            policy.max_active_reservations
        )));
    }

    let container: Container = sqlx::query_as(
        "SELECT id, image_name, name, description, public, removed FROM containers WHERE id = ? AND removed = 0",
    )
    .bind(&input.container_id)
    .fetch_optional(&db.pool)
    .await
    .map_err(|e| ServiceError::Internal(e.into()))?
    .ok_or_else(|| ServiceError::InvalidRequest("no such container".to_string()))?;

    if !container.public && !policy.is_admin {
        return Err(ServiceError::Forbidden(
            "this container is not available to non-admin users".to_string(),
        ));
    }

    let end_date = input.start_date + Duration::hours(input.duration_hours);
    if input.start_date >= end_date {
        return Err(ServiceError::InvalidRequest(
            "startDate must be before endDate".to_string(),
        ));
    }

    // Critical section: the availability read and the insert below must be
    // atomic per computer, else two concurrent creates can both observe
    // capacity and both commit (spec §5, §9 "Cross-reservation atomicity for
    // create"). Held until the transaction commits.
    let computer_lock = creation_lock.lock_for(&input.computer_id).await;
    let _creation_guard = computer_lock.lock().await;

    let availability = availability::available_hardware(
        db,
        input.start_date,
        end_date,
        None,
        Some(&policy),
        None,
        Some(&input.hardware),
    )
    .await
    .map_err(ServiceError::Internal)?
    .map_err(|unavailable| ServiceError::Denied(unavailable.to_string()))?;

    validate_hardware_request(&input.hardware, &availability, &policy)?;

    let reservation_id = Uuid::new_v4().to_string();
    let reserved_container_id = Uuid::new_v4().to_string();

    let mut tx = db
        .pool
        .begin()
        .await
        .context("begin reservation transaction")
        .map_err(ServiceError::Internal)?;

    sqlx::query(
        "INSERT INTO reserved_containers (id, container_id, shm_size_percent, ram_disk_size_percent) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(&reserved_container_id)
    .bind(&input.container_id)
    .bind(input.shm_size_percent)
    .bind(input.ram_disk_size_percent)
    .execute(&mut *tx)
    .await
    .map_err(|e| ServiceError::Internal(e.into()))?;

    sqlx::query(
        "INSERT INTO reservations (id, user_id, computer_id, reserved_container_id, start_date, end_date, description, status) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&reservation_id)
    .bind(&target_user_id)
    .bind(&input.computer_id)
    .bind(&reserved_container_id)
    .bind(input.start_date)
    .bind(end_date)
    .bind(&input.description)
    .bind(ReservationStatus::Reserved.to_string())
    .execute(&mut *tx)
    .await
    .map_err(|e| ServiceError::Internal(e.into()))?;

    for (spec_id, amount) in &input.hardware {
        if *amount <= 0.0 {
            continue;
        }
        sqlx::query(
            "INSERT INTO reserved_hardware_specs (id, reservation_id, hardware_spec_id, amount) VALUES (?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&reservation_id)
        .bind(spec_id)
        .bind(amount)
        .execute(&mut *tx)
        .await
        .map_err(|e| ServiceError::Internal(e.into()))?;
    }

    tx.commit()
        .await
        .context("commit reservation transaction")
        .map_err(ServiceError::Internal)?;

    tracing::info!(
        target: "audit",
        action = "create_reservation",
        actor = %input.user_id,
        resource = %reservation_id,
        "reservation created"
    );

    fetch_reservation(db, &reservation_id).await
}

async fn fetch_reservation(db: &Database, reservation_id: &str) -> ServiceResult<Reservation> {
    sqlx::query_as(
        "SELECT id, user_id, computer_id, reserved_container_id, start_date, end_date, description, status \
         FROM reservations WHERE id = ?",
    )
    .bind(reservation_id)
    .fetch_optional(&db.pool)
    .await
    .map_err(|e| ServiceError::Internal(e.into()))?
    .ok_or_else(|| ServiceError::NotFound(format!("reservation {reservation_id}")))
}

/// Sets `endDate := now`. The next reconciler tick picks this up (spec §4.3
/// "Cancellation"). Caller must own the reservation or be an admin.
pub async fn cancel_reservation(
    db: &Database,
    acting_user_id: &str,
    reservation_id: &str,
) -> ServiceResult<()> {
    let reservation = fetch_reservation(db, reservation_id).await?;
    let policy = policy::resolve_policy(db, acting_user_id, &reservation.computer_id)
        .await
        .map_err(ServiceError::Internal)?;

    if reservation.user_id != acting_user_id && !policy.is_admin {
        return Err(ServiceError::Forbidden(
            "you do not own this reservation".to_string(),
        ));
    }

    let now = Utc::now();
    sqlx::query("UPDATE reservations SET end_date = ? WHERE id = ?")
        .bind(now)
        .bind(reservation_id)
        .execute(&db.pool)
        .await
        .map_err(|e| ServiceError::Internal(e.into()))?;

    tracing::info!(
        target: "audit",
        action = "cancel_reservation",
        actor = %acting_user_id,
        resource = %reservation_id,
        "reservation cancelled"
    );
    Ok(())
}

/// Requests a restart of a started reservation's container: `started ->
/// restart`. The reconciler's next tick restarts the container and sets
/// status back to `started` (spec §B supplemental).
pub async fn restart_container(
    db: &Database,
    acting_user_id: &str,
    reservation_id: &str,
) -> ServiceResult<()> {
    let reservation = fetch_reservation(db, reservation_id).await?;
    let policy = policy::resolve_policy(db, acting_user_id, &reservation.computer_id)
        .await
        .map_err(ServiceError::Internal)?;

    if reservation.user_id != acting_user_id && !policy.is_admin {
        return Err(ServiceError::Forbidden(
            "you do not own this reservation".to_string(),
        ));
    }
    if reservation.status() != ReservationStatus::Started {
        return Err(ServiceError::InvalidRequest(
            "only a started reservation can be restarted".to_string(),
        ));
    }

    sqlx::query("UPDATE reservations SET status = ? WHERE id = ?")
        .bind(ReservationStatus::Restart.to_string())
        .bind(reservation_id)
        .execute(&db.pool)
        .await
        .map_err(|e| ServiceError::Internal(e.into()))?;
    Ok(())
}

/// Extends a `started` reservation by `additional_hours` in `[0, 24]`.
/// Availability for the extension window is checked with `reducibleSpecs`
/// set to the reservation's own current holdings, so it refunds itself
/// before re-evaluating (spec §6, §8 "Extension refund" law).
pub async fn extend_reservation(
    db: &Database,
    acting_user_id: &str,
    reservation_id: &str,
    additional_hours: i64,
) -> ServiceResult<Reservation> {
    if !(0..=MAX_EXTENSION_HOURS).contains(&additional_hours) {
        return Err(ServiceError::InvalidRequest(format!(
            "extension must be between 0 and {MAX_EXTENSION_HOURS} hours"
        )));
    }

    let reservation = fetch_reservation(db, reservation_id).await?;
    let policy = policy::resolve_policy(db, acting_user_id, &reservation.computer_id)
        .await
        .map_err(ServiceError::Internal)?;

    if reservation.user_id != acting_user_id && !policy.is_admin {
        return Err(ServiceError::Forbidden(
            "you do not own this reservation".to_string(),
        ));
    }
    if reservation.status() != ReservationStatus::Started {
        return Err(ServiceError::InvalidRequest(
            "only a started reservation can be extended".to_string(),
        ));
    }

    let own_amounts: HashMap<String, f64> = sqlx::query_as::<_, (String, f64)>(
        "SELECT hardware_spec_id, amount FROM reserved_hardware_specs WHERE reservation_id = ?",
    )
    .bind(reservation_id)
    .fetch_all(&db.pool)
    .await
    .map_err(|e| ServiceError::Internal(e.into()))?
    .into_iter()
    .collect();

    let new_end_date = reservation.end_date + Duration::hours(additional_hours);

    let availability = availability::available_hardware(
        db,
        reservation.end_date,
        new_end_date,
        Some(&own_amounts),
        Some(&policy),
        Some(reservation_id),
        Some(&own_amounts),
    )
    .await
    .map_err(ServiceError::Internal)?
    .map_err(|unavailable| ServiceError::Denied(unavailable.to_string()))?;

    validate_hardware_request(&own_amounts, &availability, &policy)?;

    sqlx::query("UPDATE reservations SET end_date = ? WHERE id = ?")
        .bind(new_end_date)
        .bind(reservation_id)
        .execute(&db.pool)
        .await
        .map_err(|e| ServiceError::Internal(e.into()))?;

    tracing::info!(
        target: "audit",
        action = "extend_reservation",
        actor = %acting_user_id,
        resource = %reservation_id,
        "reservation extended"
    );

    fetch_reservation(db, reservation_id).await
}

/// Own reservations, optionally filtered by status, capped to the last 90
/// days (spec §6).
pub async fn list_own_reservations(
    db: &Database,
    user_id: &str,
    status: Option<ReservationStatus>,
) -> ServiceResult<Vec<Reservation>> {
    let min_start = Utc::now() - Duration::days(OWN_RESERVATIONS_LOOKBACK_DAYS);
    let rows = match status {
        Some(s) => sqlx::query_as(
            "SELECT id, user_id, computer_id, reserved_container_id, start_date, end_date, description, status \
             FROM reservations WHERE user_id = ? AND start_date >= ? AND status = ? ORDER BY start_date DESC",
        )
        .bind(user_id)
        .bind(min_start)
        .bind(s.to_string())
        .fetch_all(&db.pool)
        .await,
        None => sqlx::query_as(
            "SELECT id, user_id, computer_id, reserved_container_id, start_date, end_date, description, status \
             FROM reservations WHERE user_id = ? AND start_date >= ? ORDER BY start_date DESC",
        )
        .bind(user_id)
        .bind(min_start)
        .fetch_all(&db.pool)
        .await,
    };
    rows.map_err(|e| ServiceError::Internal(e.into()))
}

/// Reservations currently `reserved` or `started`, ending no more than 5
/// days ago (grounded in `getCurrentReservations`).
pub async fn list_current_reservations(db: &Database) -> ServiceResult<Vec<Reservation>> {
    let cutoff = Utc::now() - Duration::days(5);
    sqlx::query_as(
        "SELECT id, user_id, computer_id, reserved_container_id, start_date, end_date, description, status \
         FROM reservations WHERE status IN ('reserved', 'started') AND end_date > ? ORDER BY start_date",
    )
    .bind(cutoff)
    .fetch_all(&db.pool)
    .await
    .map_err(|e| ServiceError::Internal(e.into()))
}

/// All reservations for calendar display: no status filter, no date-range
/// bound (spec §B supplemental — distinct from `list_own_reservations`).
pub async fn list_all_for_calendar(db: &Database) -> ServiceResult<Vec<Reservation>> {
    sqlx::query_as(
        "SELECT id, user_id, computer_id, reserved_container_id, start_date, end_date, description, status \
         FROM reservations ORDER BY start_date",
    )
    .fetch_all(&db.pool)
    .await
    .map_err(|e| ServiceError::Internal(e.into()))
}

/// One reservation's full detail. Admins may fetch any; non-admins only
/// their own.
pub async fn get_reservation_details(
    db: &Database,
    acting_user_id: &str,
    reservation_id: &str,
) -> ServiceResult<Reservation> {
    let reservation = fetch_reservation(db, reservation_id).await?;
    let policy = policy::resolve_policy(db, acting_user_id, &reservation.computer_id)
        .await
        .map_err(ServiceError::Internal)?;
    if reservation.user_id != acting_user_id && !policy.is_admin {
        return Err(ServiceError::Forbidden(
            "you do not own this reservation".to_string(),
        ));
    }
    Ok(reservation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn seed_computer(db: &Database) -> String {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO computers (id, name, ip, public, removed) VALUES (?, 'node-1', '10.0.0.1', 1, 0)",
        )
        .bind(&id)
        .execute(&db.pool)
        .await
        .unwrap();
        id
    }

    async fn seed_cpu_spec(db: &Database, computer_id: &str, max: f64, max_for_user: f64) -> String {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO hardware_specs (id, computer_id, type, maximum_amount, minimum_amount, maximum_amount_for_user, default_amount_for_user, format) \
             VALUES (?, ?, 'cpus', ?, 0, ?, 1, 'cores')",
        )
        .bind(&id)
        .bind(computer_id)
        .bind(max)
        .bind(max_for_user)
        .execute(&db.pool)
        .await
        .unwrap();
        id
    }

    async fn seed_container(db: &Database, public: bool) -> String {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO containers (id, image_name, name, public, removed) VALUES (?, ?, 'img', ?, 0)",
        )
        .bind(&id)
        .bind(format!("img-{id}"))
        .bind(public)
        .execute(&db.pool)
        .await
        .unwrap();
        id
    }

    async fn seed_user(db: &Database, email: &str) -> String {
        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO users (id, email) VALUES (?, ?)")
            .bind(&id)
            .bind(email)
            .execute(&db.pool)
            .await
            .unwrap();
        id
    }

    async fn seed_everyone(db: &Database) {
        sqlx::query("INSERT INTO roles (id, name) VALUES (?, 'everyone')")
            .bind(Uuid::new_v4().to_string())
            .execute(&db.pool)
            .await
            .unwrap();
    }

    /// Scenario 1/2 from spec §8, via the service boundary.
    #[tokio::test]
    async fn create_reservation_admits_exact_fit_rejects_overfill() {
        let db = Database::test_db().await;
        let creation_lock = CreationLock::new();
        seed_everyone(&db).await;
        let computer = seed_computer(&db).await;
        let spec = seed_cpu_spec(&db, &computer, 8.0, 8.0).await;
        let container = seed_container(&db, true).await;
        let user_a = seed_user(&db, "a@example.com").await;
        let user_b = seed_user(&db, "b@example.com").await;

        let start = Utc::now();
        let mut hw_a = HashMap::new();
        hw_a.insert(spec.clone(), 4.0);
        create_reservation(
            &db,
            &creation_lock,
            CreateReservationInput {
                user_id: user_a,
                computer_id: computer.clone(),
                container_id: container.clone(),
                start_date: start,
                duration_hours: 2,
                hardware: hw_a,
                description: None,
                shm_size_percent: 50,
                ram_disk_size_percent: 0,
                admin_reserve_user_email: None,
            },
        )
        .await
        .unwrap();

        let mut hw_b = HashMap::new();
        hw_b.insert(spec.clone(), 4.0);
        let result = create_reservation(
            &db,
            &creation_lock,
            CreateReservationInput {
                user_id: user_b.clone(),
                computer_id: computer.clone(),
                container_id: container.clone(),
                start_date: start + Duration::hours(1),
                duration_hours: 2,
                hardware: hw_b,
                description: None,
                shm_size_percent: 50,
                ram_disk_size_percent: 0,
                admin_reserve_user_email: None,
            },
        )
        .await;
        assert!(result.is_ok());

        let mut hw_overfill = HashMap::new();
        hw_overfill.insert(spec.clone(), 5.0);
        let user_c = seed_user(&db, "c@example.com").await;
        let rejected = create_reservation(
            &db,
            &creation_lock,
            CreateReservationInput {
                user_id: user_c,
                computer_id: computer.clone(),
                container_id: container.clone(),
                start_date: start + Duration::hours(1),
                duration_hours: 2,
                hardware: hw_overfill,
                description: None,
                shm_size_percent: 50,
                ram_disk_size_percent: 0,
                admin_reserve_user_email: None,
            },
        )
        .await;
        assert!(matches!(rejected, Err(ServiceError::Denied(_))));
    }

    /// Scenario 4 from spec §8: active-count cap.
    #[tokio::test]
    async fn second_reservation_rejected_by_active_cap() {
        let db = Database::test_db().await;
        let creation_lock = CreationLock::new();
        seed_everyone(&db).await;
        let computer = seed_computer(&db).await;
        let spec = seed_cpu_spec(&db, &computer, 8.0, 8.0).await;
        let container = seed_container(&db, true).await;
        let user = seed_user(&db, "u@example.com").await;

        let start = Utc::now();
        let mut hw = HashMap::new();
        hw.insert(spec.clone(), 1.0);
        create_reservation(
            &db,
            &creation_lock,
            CreateReservationInput {
                user_id: user.clone(),
                computer_id: computer.clone(),
                container_id: container.clone(),
                start_date: start,
                duration_hours: 2,
                hardware: hw.clone(),
                description: None,
                shm_size_percent: 50,
                ram_disk_size_percent: 0,
                admin_reserve_user_email: None,
            },
        )
        .await
        .unwrap();

        let second = create_reservation(
            &db,
            &creation_lock,
            CreateReservationInput {
                user_id: user,
                computer_id: computer.clone(),
                container_id: container.clone(),
                start_date: start + Duration::hours(10),
                duration_hours: 2,
                hardware: hw,
                description: None,
                shm_size_percent: 50,
                ram_disk_size_percent: 0,
                admin_reserve_user_email: None,
            },
        )
        .await;
        match second {
            Err(ServiceError::Denied(msg)) => {
                assert!(msg.contains("1 active reservation"))
            }
            other => panic!("expected active-cap denial, got {other:?}"),
        }
    }

    /// Description length validated before any DB write.
    #[tokio::test]
    async fn description_too_long_rejected() {
        let db = Database::test_db().await;
        let long = "x".repeat(51);
        let err = validate_common(&Some(long), 50, 0).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
        let _ = db; // keep the in-memory pool alive for drop ordering in this test
    }

    #[tokio::test]
    async fn cancel_sets_end_date_to_now() {
        let db = Database::test_db().await;
        let creation_lock = CreationLock::new();
        seed_everyone(&db).await;
        let computer = seed_computer(&db).await;
        let spec = seed_cpu_spec(&db, &computer, 8.0, 8.0).await;
        let container = seed_container(&db, true).await;
        let user = seed_user(&db, "u@example.com").await;

        let start = Utc::now();
        let mut hw = HashMap::new();
        hw.insert(spec, 1.0);
        let reservation = create_reservation(
            &db,
            &creation_lock,
            CreateReservationInput {
                user_id: user.clone(),
                computer_id: computer.clone(),
                container_id: container.clone(),
                start_date: start,
                duration_hours: 5,
                hardware: hw,
                description: None,
                shm_size_percent: 50,
                ram_disk_size_percent: 0,
                admin_reserve_user_email: None,
            },
        )
        .await
        .unwrap();

        cancel_reservation(&db, &user, &reservation.id).await.unwrap();
        let refreshed = fetch_reservation(&db, &reservation.id).await.unwrap();
        assert!(refreshed.end_date <= Utc::now());
        assert!(refreshed.end_date < reservation.end_date);
    }
}
