//! Availability Engine (spec §4.1): computes per-hardware-spec remaining
//! capacity over an interval and answers admit-or-reject for a requested
//! hardware map.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::db::models::{Computer, Container, HardwareSpec, HardwareType, Reservation};
use crate::db::Database;
use crate::policy::EffectivePolicy;

/// A hardware spec after subtracting overlapping reservations and
/// `reducible_specs`, and after clamping the per-user cap.
#[derive(Debug, Clone)]
pub struct AvailableSpec {
    pub spec: HardwareSpec,
    /// `maximumAmount` after subtracting overlapping holdings, clamped to 0.
    pub remaining: f64,
    /// `remaining`, further capped by policy (role cap or default user cap).
    pub maximum_amount_for_user: f64,
}

#[derive(Debug, Clone)]
pub struct AvailableComputer {
    pub computer: Computer,
    pub specs: Vec<AvailableSpec>,
}

#[derive(Debug, Clone)]
pub struct AvailabilityResult {
    pub computers: Vec<AvailableComputer>,
    pub containers: Vec<Container>,
}

/// The engine's `Unavailable` outcome: names the spec and its true
/// available amount, per spec §4.1 step 5 and §8 scenario 2.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Not enough resources to make a reservation: {spec_type}. Available: {available} {format} {spec_type}.")]
pub struct Unavailable {
    pub spec_type: String,
    pub available: f64,
    pub format: String,
}

/// Compute remaining capacity for every hardware spec of every non-removed,
/// public computer, over `[t0, t1)`.
///
/// `reducible_specs` (hardware_spec_id -> amount) is subtracted in addition
/// to overlapping reservations — used by extension/modification flows to
/// refund the caller's own current holdings before re-admitting (spec §4.1
/// step 3, the "extension refund" law in §8).
///
/// `ignore_reservation_id` excludes one reservation from the overlap sum
/// (the reservation being extended).
///
/// If `policy` is supplied, `maximum_amount_for_user` is computed for each
/// spec; otherwise it mirrors `remaining`.
///
/// Returns `Err(Unavailable)` only when `requested` names a spec whose
/// remaining capacity (after all subtractions) would drop below its
/// `minimum_amount` — i.e. the caller is actually asking for a slice of a
/// spec that can no longer satisfy the floor.
pub async fn available_hardware(
    db: &Database,
    t0: DateTime<Utc>,
    t1: DateTime<Utc>,
    reducible_specs: Option<&HashMap<String, f64>>,
    policy: Option<&EffectivePolicy>,
    ignore_reservation_id: Option<&str>,
    requested: Option<&HashMap<String, f64>>,
) -> Result<Result<AvailabilityResult, Unavailable>> {
    let computers: Vec<Computer> = sqlx::query_as(
        "SELECT id, name, ip, public, removed FROM computers WHERE removed = 0 AND public = 1",
    )
    .fetch_all(&db.pool)
    .await?;

    let containers: Vec<Container> = sqlx::query_as(
        "SELECT id, image_name, name, description, public, removed FROM containers",
    )
    .fetch_all(&db.pool)
    .await?;

    // Reservations overlapping the interval in an admitting status.
    let overlapping: Vec<Reservation> = sqlx::query_as(
        "SELECT id, user_id, computer_id, reserved_container_id, start_date, end_date, description, status \
         FROM reservations WHERE start_date < ? AND end_date > ? AND status IN ('reserved', 'started')",
    )
    .bind(t1)
    .bind(t0)
    .fetch_all(&db.pool)
    .await?;

    let mut removable: HashMap<String, f64> = HashMap::new();
    for res in &overlapping {
        if Some(res.id.as_str()) == ignore_reservation_id {
            continue;
        }
        let specs: Vec<(String, f64)> = sqlx::query_as(
            "SELECT hardware_spec_id, amount FROM reserved_hardware_specs WHERE reservation_id = ?",
        )
        .bind(&res.id)
        .fetch_all(&db.pool)
        .await?;
        for (spec_id, amount) in specs {
            *removable.entry(spec_id).or_insert(0.0) += amount;
        }
    }

    if let Some(reducible) = reducible_specs {
        for (spec_id, amount) in reducible {
            if *amount == 0.0 {
                continue;
            }
            *removable.entry(spec_id.clone()).or_insert(0.0) += amount;
        }
    }

    let mut out_computers = Vec::with_capacity(computers.len());
    for computer in computers {
        let specs: Vec<HardwareSpec> = sqlx::query_as(
            "SELECT id, computer_id, internal_id, type, maximum_amount, minimum_amount, \
             maximum_amount_for_user, default_amount_for_user, format \
             FROM hardware_specs WHERE computer_id = ?",
        )
        .bind(&computer.id)
        .fetch_all(&db.pool)
        .await?;

        let mut available_specs = Vec::with_capacity(specs.len());
        for spec in specs {
            let mut remaining = spec.maximum_amount;
            if let Some(sub) = removable.get(&spec.id) {
                remaining -= sub;
            }
            if remaining < 0.0 {
                remaining = 0.0;
            }

            let is_requested = requested
                .map(|r| r.get(&spec.id).copied().unwrap_or(0.0) > 0.0)
                .unwrap_or(false);
            if is_requested && remaining < spec.minimum_amount {
                return Ok(Err(Unavailable {
                    spec_type: spec.kind().to_string(),
                    available: remaining.max(0.0),
                    format: spec.format.clone(),
                }));
            }

            let policy_cap = policy
                .map(|p| {
                    if p.is_admin {
                        spec.maximum_amount
                    } else if spec.kind() == HardwareType::Gpu {
                        p.hardware_cap(&spec.id, 1.0)
                    } else {
                        p.hardware_cap(&spec.id, spec.maximum_amount_for_user)
                    }
                })
                .unwrap_or(spec.maximum_amount_for_user);

            let maximum_amount_for_user = policy_cap.min(remaining);

            available_specs.push(AvailableSpec {
                spec,
                remaining,
                maximum_amount_for_user,
            });
        }

        out_computers.push(AvailableComputer {
            computer,
            specs: available_specs,
        });
    }

    Ok(Ok(AvailabilityResult {
        computers: out_computers,
        containers,
    }))
}

/// Bucket thresholds for the availability timeline (spec §6, §B): >75% of a
/// spec's `maximumAmount` remaining is `High`, >25% is `Medium`, else `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityLevel {
    High,
    Medium,
    Low,
}

/// One bucketed sub-interval of the timeline for one computer (spec §6
/// "Availability timeline").
#[derive(Debug, Clone)]
pub struct TimelineSegment {
    pub computer_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub level: AvailabilityLevel,
}

/// Given a date range, splits it at every reservation boundary overlapping
/// it and buckets each resulting sub-interval's availability per computer
/// (spec §6). Per-device `gpu` rows are excluded from the consolidated view;
/// only the aggregate `gpus` row (and `cpus`/`ram`) bound the bucket (spec §B
/// "Availability timeline bucketing thresholds and GPU consolidation"). A
/// segment's level is driven by its scarcest spec: the minimum
/// remaining-over-maximum ratio across all non-`gpu` specs on that computer.
pub async fn availability_timeline(
    db: &Database,
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
) -> Result<Vec<TimelineSegment>> {
    let computers: Vec<Computer> = sqlx::query_as(
        "SELECT id, name, ip, public, removed FROM computers WHERE removed = 0 AND public = 1",
    )
    .fetch_all(&db.pool)
    .await?;

    let reservations: Vec<Reservation> = sqlx::query_as(
        "SELECT id, user_id, computer_id, reserved_container_id, start_date, end_date, description, status \
         FROM reservations WHERE start_date < ? AND end_date > ? AND status IN ('reserved', 'started')",
    )
    .bind(range_end)
    .bind(range_start)
    .fetch_all(&db.pool)
    .await?;

    // reservation_id -> hardware_spec_id -> amount, fetched once up front so
    // the per-segment, per-spec bucketing below is pure in-memory work.
    let mut holdings: HashMap<String, HashMap<String, f64>> = HashMap::new();
    for res in &reservations {
        let specs: Vec<(String, f64)> = sqlx::query_as(
            "SELECT hardware_spec_id, amount FROM reserved_hardware_specs WHERE reservation_id = ?",
        )
        .bind(&res.id)
        .fetch_all(&db.pool)
        .await?;
        holdings.insert(res.id.clone(), specs.into_iter().collect());
    }

    let mut boundaries: Vec<DateTime<Utc>> = vec![range_start, range_end];
    for res in &reservations {
        if res.start_date > range_start && res.start_date < range_end {
            boundaries.push(res.start_date);
        }
        if res.end_date > range_start && res.end_date < range_end {
            boundaries.push(res.end_date);
        }
    }
    boundaries.sort();
    boundaries.dedup();

    let mut segments = Vec::new();
    for computer in &computers {
        let specs: Vec<HardwareSpec> = sqlx::query_as(
            "SELECT id, computer_id, internal_id, type, maximum_amount, minimum_amount, \
             maximum_amount_for_user, default_amount_for_user, format \
             FROM hardware_specs WHERE computer_id = ? AND type != 'gpu'",
        )
        .bind(&computer.id)
        .fetch_all(&db.pool)
        .await?;

        let computer_reservations: Vec<&Reservation> = reservations
            .iter()
            .filter(|r| r.computer_id == computer.id)
            .collect();

        for window in boundaries.windows(2) {
            let (seg_start, seg_end) = (window[0], window[1]);
            if seg_start >= seg_end {
                continue;
            }

            let mut min_ratio = 1.0_f64;
            for spec in &specs {
                if spec.maximum_amount <= 0.0 {
                    continue;
                }
                let mut used = 0.0;
                for res in &computer_reservations {
                    if !res.overlaps(seg_start, seg_end) {
                        continue;
                    }
                    if let Some(amount) = holdings.get(&res.id).and_then(|m| m.get(&spec.id)) {
                        used += amount;
                    }
                }
                let remaining = (spec.maximum_amount - used).max(0.0);
                let ratio = remaining / spec.maximum_amount;
                min_ratio = min_ratio.min(ratio);
            }

            let level = if min_ratio > 0.75 {
                AvailabilityLevel::High
            } else if min_ratio > 0.25 {
                AvailabilityLevel::Medium
            } else {
                AvailabilityLevel::Low
            };

            segments.push(TimelineSegment {
                computer_id: computer.id.clone(),
                start: seg_start,
                end: seg_end,
                level,
            });
        }
    }

    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::Duration;
    use uuid::Uuid;

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

    async fn seed_cpu_spec(db: &Database, computer_id: &str, max: f64) -> String {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO hardware_specs (id, computer_id, type, maximum_amount, minimum_amount, maximum_amount_for_user, default_amount_for_user, format) \
             VALUES (?, ?, 'cpus', ?, 0, ?, 1, 'cores')",
        )
        .bind(&id)
        .bind(computer_id)
        .bind(max)
        .bind(max)
        .execute(&db.pool)
        .await
        .unwrap();
        id
    }

    async fn seed_reservation(
        db: &Database,
        computer_id: &str,
        spec_id: &str,
        amount: f64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        status: &str,
    ) -> String {
        let user_id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO users (id, email) VALUES (?, ?)")
            .bind(&user_id)
            .bind(format!("{user_id}@example.com"))
            .execute(&db.pool)
            .await
            .unwrap();

        let container_id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO containers (id, image_name, name, public, removed) VALUES (?, ?, 'img', 1, 0)")
            .bind(&container_id)
            .bind(format!("img-{container_id}"))
            .execute(&db.pool)
            .await
            .unwrap();

        let reserved_container_id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO reserved_containers (id, container_id) VALUES (?, ?)")
            .bind(&reserved_container_id)
            .bind(&container_id)
            .execute(&db.pool)
            .await
            .unwrap();

        let res_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO reservations (id, user_id, computer_id, reserved_container_id, start_date, end_date, status) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&res_id)
        .bind(&user_id)
        .bind(computer_id)
        .bind(&reserved_container_id)
        .bind(start)
        .bind(end)
        .bind(status)
        .execute(&db.pool)
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO reserved_hardware_specs (id, reservation_id, hardware_spec_id, amount) VALUES (?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&res_id)
        .bind(spec_id)
        .bind(amount)
        .execute(&db.pool)
        .await
        .unwrap();

        res_id
    }

    /// Scenario 1: fits exactly.
    #[tokio::test]
    async fn fits_exactly_at_full_overlap() {
        let db = Database::test_db().await;
        let computer = seed_computer(&db).await;
        let spec = seed_cpu_spec(&db, &computer, 8.0).await;

        let base = Utc::now();
        let a_start = base;
        let a_end = base + Duration::hours(2);
        seed_reservation(&db, &computer, &spec, 4.0, a_start, a_end, "reserved").await;

        let b_start = base + Duration::hours(1);
        let b_end = base + Duration::hours(3);
        let mut requested = HashMap::new();
        requested.insert(spec.clone(), 4.0);

        let result = available_hardware(&db, b_start, b_end, None, None, None, Some(&requested))
            .await
            .unwrap()
            .unwrap();
        let remaining = result.computers[0].specs[0].remaining;
        assert_eq!(remaining, 4.0);
    }

    /// Scenario 2: overfill rejected, message names the spec and available amount.
    #[tokio::test]
    async fn overfill_rejected_names_spec_and_available() {
        let db = Database::test_db().await;
        let computer = seed_computer(&db).await;
        let spec = seed_cpu_spec(&db, &computer, 8.0).await;

        let base = Utc::now();
        seed_reservation(
            &db,
            &computer,
            &spec,
            4.0,
            base,
            base + Duration::hours(2),
            "reserved",
        )
        .await;

        let mut requested = HashMap::new();
        requested.insert(spec.clone(), 5.0);

        let result = available_hardware(
            &db,
            base + Duration::hours(1),
            base + Duration::hours(3),
            None,
            None,
            None,
            Some(&requested),
        )
        .await
        .unwrap();

        let err = result.unwrap_err();
        assert_eq!(err.spec_type, "cpus");
        assert_eq!(err.available, 4.0);
    }

    /// Extension refund law: reducible_specs refunds the caller's own holdings.
    #[tokio::test]
    async fn reducible_specs_refunds_own_holdings() {
        let db = Database::test_db().await;
        let computer = seed_computer(&db).await;
        let spec = seed_cpu_spec(&db, &computer, 4.0).await;

        let base = Utc::now();
        let res_id = seed_reservation(
            &db,
            &computer,
            &spec,
            4.0,
            base,
            base + Duration::hours(2),
            "started",
        )
        .await;

        let mut reducible = HashMap::new();
        reducible.insert(spec.clone(), 4.0);

        // Extending into the same interval the reservation already owns must
        // succeed once its own holdings are refunded.
        let result = available_hardware(
            &db,
            base,
            base + Duration::hours(2),
            Some(&reducible),
            None,
            Some(&res_id),
            None,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(result.computers[0].specs[0].remaining, 4.0);
    }

    #[tokio::test]
    async fn removed_or_private_computers_excluded() {
        let db = Database::test_db().await;
        let removed_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO computers (id, name, ip, public, removed) VALUES (?, 'gone', '10.0.0.2', 1, 1)",
        )
        .bind(&removed_id)
        .execute(&db.pool)
        .await
        .unwrap();
        let private_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO computers (id, name, ip, public, removed) VALUES (?, 'priv', '10.0.0.3', 0, 0)",
        )
        .bind(&private_id)
        .execute(&db.pool)
        .await
        .unwrap();

        let base = Utc::now();
        let result = available_hardware(
            &db,
            base,
            base + Duration::hours(1),
            None,
            None,
            None,
            None,
        )
        .await
        .unwrap()
        .unwrap();
        assert!(result.computers.is_empty());
    }

    #[tokio::test]
    async fn timeline_splits_at_reservation_boundaries_and_buckets_by_scarcest_spec() {
        let db = Database::test_db().await;
        let computer_id = seed_computer(&db).await;
        let spec_id = seed_cpu_spec(&db, &computer_id, 8.0).await;

        let base = Utc::now();
        // 6 of 8 CPUs held 1h-2h into the range -> 25% remaining -> Low.
        seed_reservation(
            &db,
            &computer_id,
            &spec_id,
            6.0,
            base + Duration::hours(1),
            base + Duration::hours(2),
            "started",
        )
        .await;

        let segments = availability_timeline(&db, base, base + Duration::hours(3))
            .await
            .unwrap();

        // Three boundaries at 0h/1h/2h/3h -> two sub-intervals minimum around the hold.
        assert!(segments.len() >= 3);
        let busy = segments
            .iter()
            .find(|s| s.start == base + Duration::hours(1))
            .unwrap();
        assert_eq!(busy.level, AvailabilityLevel::Low);

        let free = segments.iter().find(|s| s.start == base).unwrap();
        assert_eq!(free.level, AvailabilityLevel::High);
    }

    #[tokio::test]
    async fn timeline_excludes_per_device_gpu_rows() {
        let db = Database::test_db().await;
        let computer_id = seed_computer(&db).await;
        let gpu_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO hardware_specs (id, computer_id, internal_id, type, maximum_amount, minimum_amount, maximum_amount_for_user, default_amount_for_user, format) \
             VALUES (?, ?, '0', 'gpu', 1, 0, 1, 1, 'count')",
        )
        .bind(&gpu_id)
        .bind(&computer_id)
        .execute(&db.pool)
        .await
        .unwrap();

        let base = Utc::now();
        let segments = availability_timeline(&db, base, base + Duration::hours(1))
            .await
            .unwrap();
        // No non-gpu specs exist on this computer, so the single segment
        // defaults to High (min_ratio starts at 1.0, untouched by the
        // excluded per-device gpu row).
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].level, AvailabilityLevel::High);
    }
}
