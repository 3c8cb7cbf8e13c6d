use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// Reservation lifecycle state. Persisted as a string column; see
/// `Display`/`FromStr` for the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Reserved,
    Started,
    Stopped,
    Error,
    Restart,
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Started => "started",
            ReservationStatus::Stopped => "stopped",
            ReservationStatus::Error => "error",
            ReservationStatus::Restart => "restart",
        };
        f.write_str(s)
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(ReservationStatus::Reserved),
            "started" => Ok(ReservationStatus::Started),
            "stopped" => Ok(ReservationStatus::Stopped),
            "error" => Ok(ReservationStatus::Error),
            "restart" => Ok(ReservationStatus::Restart),
            other => Err(format!("unknown reservation status: {other}")),
        }
    }
}

/// Hardware dimension kind. `Gpu` rows are per-device (carry `internal_id`);
/// `Gpus` is the machine-wide aggregate used for display and role limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HardwareType {
    Cpus,
    Ram,
    Gpus,
    Gpu,
}

impl fmt::Display for HardwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HardwareType::Cpus => "cpus",
            HardwareType::Ram => "ram",
            HardwareType::Gpus => "gpus",
            HardwareType::Gpu => "gpu",
        };
        f.write_str(s)
    }
}

impl FromStr for HardwareType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpus" => Ok(HardwareType::Cpus),
            "ram" => Ok(HardwareType::Ram),
            "gpus" => Ok(HardwareType::Gpus),
            "gpu" => Ok(HardwareType::Gpu),
            other => Err(format!("unknown hardware spec type: {other}")),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub password_hash: Option<String>,
    pub password_salt: Option<String>,
    pub login_token: Option<String>,
    pub login_token_created_at: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub name: String,
}

impl Role {
    pub const EVERYONE: &'static str = "everyone";
    pub const ADMIN: &'static str = "admin";
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Computer {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub public: bool,
    pub removed: bool,
}

/// Raw DB row for a hardware spec. `type` is stored as text; callers parse
/// it via `kind()` — kept as a plain string field here to avoid forcing
/// sqlx to understand the enum at the query layer.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct HardwareSpec {
    pub id: String,
    pub computer_id: String,
    pub internal_id: Option<String>,
    #[sqlx(rename = "type")]
    pub spec_type: String,
    pub maximum_amount: f64,
    pub minimum_amount: f64,
    pub maximum_amount_for_user: f64,
    pub default_amount_for_user: f64,
    pub format: String,
}

impl HardwareSpec {
    pub fn kind(&self) -> HardwareType {
        // Rows are only ever written through migrations/seed code that use
        // the canonical strings, so this cannot fail in practice.
        HardwareType::from_str(&self.spec_type).expect("valid hardware spec type in store")
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub image_name: String,
    pub name: String,
    pub description: Option<String>,
    pub public: bool,
    pub removed: bool,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ContainerPort {
    pub id: String,
    pub container_id: String,
    pub service_name: String,
    pub port: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RoleMount {
    pub id: String,
    pub role_id: String,
    pub computer_id: String,
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RoleHardwareLimit {
    pub id: String,
    pub role_id: String,
    pub hardware_spec_id: String,
    pub maximum_amount_for_role: Option<f64>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RoleReservationLimit {
    pub id: String,
    pub role_id: String,
    pub min_duration_hours: Option<i64>,
    pub max_duration_hours: Option<i64>,
    pub max_active_reservations: Option<i64>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ReservedContainer {
    pub id: String,
    pub container_id: String,
    pub started_at: Option<String>,
    pub stopped_at: Option<String>,
    pub container_docker_name: Option<String>,
    pub container_status: Option<String>,
    pub ssh_password: Option<String>,
    pub container_docker_error_message: Option<String>,
    pub shm_size_percent: i64,
    pub ram_disk_size_percent: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ReservedContainerPort {
    pub id: String,
    pub reserved_container_id: String,
    pub container_port_id: String,
    pub outside_port: i64,
}

/// Raw DB row for a reservation. `status` is stored as text — parse via
/// `status()`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub user_id: String,
    pub computer_id: String,
    pub reserved_container_id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub description: Option<String>,
    pub status: String,
}

impl Reservation {
    pub fn status(&self) -> ReservationStatus {
        ReservationStatus::from_str(&self.status).expect("valid reservation status in store")
    }

    /// `R.startDate < t1 ∧ R.endDate > t0` — the overlap predicate used
    /// throughout the Availability Engine and Reconciler.
    pub fn overlaps(&self, t0: DateTime<Utc>, t1: DateTime<Utc>) -> bool {
        self.start_date < t1 && self.end_date > t0
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ReservedHardwareSpec {
    pub id: String,
    pub reservation_id: String,
    pub hardware_spec_id: String,
    pub amount: f64,
}
