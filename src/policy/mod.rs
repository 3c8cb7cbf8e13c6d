//! Policy Resolver (spec §4.2): merges every role a user holds — plus the
//! implicit `everyone` role — into one effective policy. Pure function of
//! the current Store snapshot; performs no mutation.

use std::collections::HashMap;

use anyhow::Result;

use crate::db::models::{Role, RoleMount};
use crate::db::Database;

/// Default reservation limits applied when no role supplies a value.
const DEFAULT_MIN_DURATION_HOURS: i64 = 1;
const DEFAULT_MAX_DURATION_HOURS_ADMIN: i64 = 1440;
const DEFAULT_MAX_DURATION_HOURS_USER: i64 = 48;
const DEFAULT_MAX_ACTIVE_RESERVATIONS_ADMIN: i64 = 99;
const DEFAULT_MAX_ACTIVE_RESERVATIONS_USER: i64 = 1;

/// A mount resolved for container launch: already filtered to one computer,
/// already de-duplicated against `everyone`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

/// Effective policy for one (user, computer) pair.
#[derive(Debug, Clone)]
pub struct EffectivePolicy {
    pub is_admin: bool,
    /// hardware_spec_id -> most permissive cap across the user's roles.
    /// Absent entries fall back to the spec's own `maximum_amount_for_user`.
    pub hardware_caps: HashMap<String, f64>,
    pub min_duration_hours: i64,
    pub max_duration_hours: i64,
    pub max_active_reservations: i64,
    pub mounts: Vec<ResolvedMount>,
}

impl EffectivePolicy {
    /// The per-spec cap this policy grants, or `fallback` (the spec's own
    /// default user cap) if no role names this spec.
    pub fn hardware_cap(&self, hardware_spec_id: &str, fallback: f64) -> f64 {
        self.hardware_caps
            .get(hardware_spec_id)
            .copied()
            .unwrap_or(fallback)
    }
}

/// Resolve the effective policy for `user_id` on `computer_id`.
///
/// Gathers all roles the user holds, appends the implicit `everyone` role,
/// and merges hardware caps, reservation limits, and mounts using the
/// "most permissive wins" rule (spec §4.2).
pub async fn resolve_policy(
    db: &Database,
    user_id: &str,
    computer_id: &str,
) -> Result<EffectivePolicy> {
    let role_ids = effective_role_ids(db, user_id).await?;
    let is_admin = is_admin_among(db, &role_ids).await?;

    let hardware_caps = resolve_hardware_caps(db, &role_ids).await?;
    let (min_duration_hours, max_duration_hours, max_active_reservations) =
        resolve_reservation_limits(db, &role_ids, is_admin).await?;
    let mounts = resolve_mounts(db, &role_ids, computer_id).await?;

    Ok(EffectivePolicy {
        is_admin,
        hardware_caps,
        min_duration_hours,
        max_duration_hours,
        max_active_reservations,
        mounts,
    })
}

/// All role ids the user holds, plus the implicit `everyone` role.
pub async fn effective_role_ids(db: &Database, user_id: &str) -> Result<Vec<String>> {
    let mut role_ids: Vec<String> = sqlx::query_scalar(
        "SELECT role_id FROM user_roles WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_all(&db.pool)
    .await?;

    if let Some(everyone_id) = everyone_role_id(db).await? {
        if !role_ids.contains(&everyone_id) {
            role_ids.push(everyone_id);
        }
    }

    Ok(role_ids)
}

async fn everyone_role_id(db: &Database) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT id FROM roles WHERE name = ?")
        .bind(Role::EVERYONE)
        .fetch_optional(&db.pool)
        .await?;
    Ok(row.map(|(id,)| id))
}

async fn is_admin_among(db: &Database, role_ids: &[String]) -> Result<bool> {
    if role_ids.is_empty() {
        return Ok(false);
    }
    let placeholders = role_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!(
        "SELECT COUNT(*) FROM roles WHERE name = ? AND id IN ({placeholders})"
    );
    let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(Role::ADMIN);
    for id in role_ids {
        query = query.bind(id);
    }
    let count: i64 = query.fetch_one(&db.pool).await?;
    Ok(count > 0)
}

/// Hardware caps: for each `hardware_spec_id` named by any role, take the
/// maximum `maximum_amount_for_role` across the user's roles. A `NULL`
/// limit row ("use default") contributes nothing.
async fn resolve_hardware_caps(
    db: &Database,
    role_ids: &[String],
) -> Result<HashMap<String, f64>> {
    if role_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders = role_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!(
        "SELECT hardware_spec_id, maximum_amount_for_role FROM role_hardware_limits \
         WHERE role_id IN ({placeholders}) AND maximum_amount_for_role IS NOT NULL"
    );
    let mut query = sqlx::query_as::<_, (String, f64)>(&sql);
    for id in role_ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(&db.pool).await?;

    let mut caps: HashMap<String, f64> = HashMap::new();
    for (spec_id, cap) in rows {
        caps.entry(spec_id)
            .and_modify(|existing| {
                if cap > *existing {
                    *existing = cap;
                }
            })
            .or_insert(cap);
    }
    Ok(caps)
}

/// Reservation limits: `minDuration := min(non-null role minima, default)`,
/// `maxDuration := max(non-null role maxima, default)`,
/// `maxActiveReservations := max(non-null role values, default)`.
async fn resolve_reservation_limits(
    db: &Database,
    role_ids: &[String],
    is_admin: bool,
) -> Result<(i64, i64, i64)> {
    let mut min_duration = DEFAULT_MIN_DURATION_HOURS;
    let mut max_duration = if is_admin {
        DEFAULT_MAX_DURATION_HOURS_ADMIN
    } else {
        DEFAULT_MAX_DURATION_HOURS_USER
    };
    let mut max_active = if is_admin {
        DEFAULT_MAX_ACTIVE_RESERVATIONS_ADMIN
    } else {
        DEFAULT_MAX_ACTIVE_RESERVATIONS_USER
    };

    if role_ids.is_empty() {
        return Ok((min_duration, max_duration, max_active));
    }

    let placeholders = role_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!(
        "SELECT min_duration_hours, max_duration_hours, max_active_reservations \
         FROM role_reservation_limits WHERE role_id IN ({placeholders})"
    );
    let mut query =
        sqlx::query_as::<_, (Option<i64>, Option<i64>, Option<i64>)>(&sql);
    for id in role_ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(&db.pool).await?;

    for (min_d, max_d, max_a) in rows {
        if let Some(v) = min_d {
            min_duration = min_duration.min(v);
        }
        if let Some(v) = max_d {
            max_duration = max_duration.max(v);
        }
        if let Some(v) = max_a {
            max_active = max_active.max(v);
        }
    }

    Ok((min_duration, max_duration, max_active))
}

/// Union of RoleMount rows across the user's roles, filtered to
/// `computer_id`, de-duplicated on `(hostPath, containerPath)`. The
/// `everyone` role's mounts are applied first so that a user-role mount
/// which duplicates an `everyone` mount is dropped rather than the reverse
/// (grounded in the original `startDockerContainer`'s mount-building order).
async fn resolve_mounts(
    db: &Database,
    role_ids: &[String],
    computer_id: &str,
) -> Result<Vec<ResolvedMount>> {
    if role_ids.is_empty() {
        return Ok(Vec::new());
    }

    let everyone_id = everyone_role_id(db).await?;

    let mut ordered_role_ids: Vec<&String> = Vec::with_capacity(role_ids.len());
    if let Some(ref everyone_id) = everyone_id {
        if let Some(pos) = role_ids.iter().position(|r| r == everyone_id) {
            ordered_role_ids.push(&role_ids[pos]);
        }
    }
    for id in role_ids {
        if Some(id) != everyone_id.as_ref() {
            ordered_role_ids.push(id);
        }
    }

    let mut mounts: Vec<ResolvedMount> = Vec::new();
    let mut seen: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();

    for role_id in ordered_role_ids {
        let rows: Vec<RoleMount> = sqlx::query_as(
            "SELECT id, role_id, computer_id, host_path, container_path, read_only \
             FROM role_mounts WHERE role_id = ? AND computer_id = ?",
        )
        .bind(role_id)
        .bind(computer_id)
        .fetch_all(&db.pool)
        .await?;

        for row in rows {
            let key = (row.host_path.clone(), row.container_path.clone());
            if seen.insert(key) {
                mounts.push(ResolvedMount {
                    host_path: row.host_path,
                    container_path: row.container_path,
                    read_only: row.read_only,
                });
            }
        }
    }

    Ok(mounts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use uuid::Uuid;

    async fn seed_role(db: &Database, name: &str) -> String {
        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO roles (id, name) VALUES (?, ?)")
            .bind(&id)
            .bind(name)
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

    async fn assign_role(db: &Database, user_id: &str, role_id: &str) {
        sqlx::query("INSERT INTO user_roles (id, user_id, role_id) VALUES (?, ?, ?)")
            .bind(Uuid::new_v4().to_string())
            .bind(user_id)
            .bind(role_id)
            .execute(&db.pool)
            .await
            .unwrap();
    }

    async fn seed_computer(db: &Database, name: &str) -> String {
        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO computers (id, name, ip, public, removed) VALUES (?, ?, '10.0.0.1', 1, 0)")
            .bind(&id)
            .bind(name)
            .execute(&db.pool)
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn everyone_role_applies_even_without_explicit_membership() {
        let db = Database::test_db().await;
        seed_role(&db, Role::EVERYONE).await;
        let user = seed_user(&db, "a@example.com").await;

        let role_ids = effective_role_ids(&db, &user).await.unwrap();
        assert_eq!(role_ids.len(), 1);
    }

    #[tokio::test]
    async fn admin_detected_via_any_held_role() {
        let db = Database::test_db().await;
        seed_role(&db, Role::EVERYONE).await;
        let admin_role = seed_role(&db, Role::ADMIN).await;
        let user = seed_user(&db, "admin@example.com").await;
        assign_role(&db, &user, &admin_role).await;
        let computer = seed_computer(&db, "node-1").await;

        let policy = resolve_policy(&db, &user, &computer).await.unwrap();
        assert!(policy.is_admin);
        assert_eq!(policy.max_active_reservations, DEFAULT_MAX_ACTIVE_RESERVATIONS_ADMIN);
        assert_eq!(policy.max_duration_hours, DEFAULT_MAX_DURATION_HOURS_ADMIN);
    }

    #[tokio::test]
    async fn most_permissive_duration_wins_across_roles() {
        let db = Database::test_db().await;
        seed_role(&db, Role::EVERYONE).await;
        let role_x = seed_role(&db, "x").await;
        let role_y = seed_role(&db, "y").await;
        let user = seed_user(&db, "u@example.com").await;
        assign_role(&db, &user, &role_x).await;
        assign_role(&db, &user, &role_y).await;
        let computer = seed_computer(&db, "node-1").await;

        sqlx::query(
            "INSERT INTO role_reservation_limits (id, role_id, max_duration_hours) VALUES (?, ?, 12)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&role_x)
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO role_reservation_limits (id, role_id, max_duration_hours) VALUES (?, ?, 48)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&role_y)
        .execute(&db.pool)
        .await
        .unwrap();

        let policy = resolve_policy(&db, &user, &computer).await.unwrap();
        assert_eq!(policy.max_duration_hours, 48);
    }

    #[tokio::test]
    async fn hardware_cap_takes_maximum_across_roles() {
        let db = Database::test_db().await;
        seed_role(&db, Role::EVERYONE).await;
        let role_x = seed_role(&db, "x").await;
        let role_y = seed_role(&db, "y").await;
        let user = seed_user(&db, "u@example.com").await;
        assign_role(&db, &user, &role_x).await;
        assign_role(&db, &user, &role_y).await;
        let computer = seed_computer(&db, "node-1").await;

        let spec_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO hardware_specs (id, computer_id, type, maximum_amount, minimum_amount, maximum_amount_for_user, default_amount_for_user, format) VALUES (?, ?, 'gpu', 1, 0, 1, 1, 'count')",
        )
        .bind(&spec_id)
        .bind(&computer)
        .execute(&db.pool)
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO role_hardware_limits (id, role_id, hardware_spec_id, maximum_amount_for_role) VALUES (?, ?, ?, 2)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&role_x)
        .bind(&spec_id)
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO role_hardware_limits (id, role_id, hardware_spec_id, maximum_amount_for_role) VALUES (?, ?, ?, 4)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&role_y)
        .bind(&spec_id)
        .execute(&db.pool)
        .await
        .unwrap();

        let policy = resolve_policy(&db, &user, &computer).await.unwrap();
        assert_eq!(policy.hardware_cap(&spec_id, 1.0), 4.0);
    }

    #[tokio::test]
    async fn mounts_deduplicate_against_everyone() {
        let db = Database::test_db().await;
        let everyone = seed_role(&db, Role::EVERYONE).await;
        let role_x = seed_role(&db, "x").await;
        let user = seed_user(&db, "u@example.com").await;
        assign_role(&db, &user, &role_x).await;
        let computer = seed_computer(&db, "node-1").await;

        sqlx::query(
            "INSERT INTO role_mounts (id, role_id, computer_id, host_path, container_path, read_only) VALUES (?, ?, ?, '/data', '/home/user/datasets', 1)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&everyone)
        .bind(&computer)
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO role_mounts (id, role_id, computer_id, host_path, container_path, read_only) VALUES (?, ?, ?, '/data', '/home/user/datasets', 0)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&role_x)
        .bind(&computer)
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO role_mounts (id, role_id, computer_id, host_path, container_path, read_only) VALUES (?, ?, ?, '/data/{email}', '/home/user/persistent', 0)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&role_x)
        .bind(&computer)
        .execute(&db.pool)
        .await
        .unwrap();

        let policy = resolve_policy(&db, &user, &computer).await.unwrap();
        assert_eq!(policy.mounts.len(), 2);
        let dedup = policy
            .mounts
            .iter()
            .find(|m| m.container_path == "/home/user/datasets")
            .unwrap();
        // The everyone-role copy (read_only = true) wins because it's inserted first.
        assert!(dedup.read_only);
    }
}
