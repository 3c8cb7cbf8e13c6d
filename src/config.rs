//! Node-level configuration (spec §6). None of this is user-facing — it is
//! read once at startup and handed to the components that need it.

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite database URL.
    pub database_url: String,

    /// Docker socket path, passed to `bollard::Docker::connect_with_local_defaults`
    /// via `DOCKER_HOST` (bollard reads this env var itself; kept here for
    /// logging/visibility at startup).
    pub docker_host: String,

    /// Registry address images are pulled from (spec §4.4 step 2).
    pub registry_address: String,

    /// Identifies this node's `computers.name` row; the reconciler only acts
    /// on reservations whose `computer_id` matches this row's id (spec §4.3).
    pub server_name: String,

    /// Outside port range the Port Allocator draws from (spec §4.4).
    pub port_range_start: u16,
    pub port_range_end: u16,

    /// Reconciler tick period in seconds (spec §4.3: "every ~10 seconds").
    pub reconciler_tick_secs: u64,

    /// Sweep runs every Nth tick (spec §4.3: "every ~60 seconds", i.e. every
    /// sixth 10s tick).
    pub orphan_sweep_every_n_ticks: u64,

    /// Orphan containers younger than this are left alone — they may still
    /// be mid-launch (spec §4.3 Sweep).
    pub orphan_container_age_minutes: i64,

    /// Gate login on `user_whitelist`/`user_blacklist` (spec §3). Enforcement
    /// itself lives in the auth layer this spec places out of scope; the
    /// toggle is carried here because it is node-level configuration.
    pub whitelist_enabled: bool,
    pub blacklist_enabled: bool,

    /// SMTP relay for launch-failure notifications (spec §4.3 "An email may
    /// be dispatched"). Delivery itself is out of scope; only the
    /// configuration surface is carried.
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_from: Option<String>,

    /// LDAP bind DN for login (out of scope; configuration surface only).
    pub ldap_url: Option<String>,
    pub ldap_bind_dn: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:///var/lib/reservations/db.sqlite".into()),
            docker_host: std::env::var("DOCKER_HOST")
                .unwrap_or_else(|_| "unix:///var/run/docker.sock".into()),
            registry_address: std::env::var("REGISTRY_ADDRESS")
                .unwrap_or_else(|_| "registry.hub.docker.com".into()),
            server_name: std::env::var("SERVER_NAME")
                .unwrap_or_else(|_| "localhost".into()),
            port_range_start: std::env::var("PORT_RANGE_START")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20000),
            port_range_end: std::env::var("PORT_RANGE_END")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(21000),
            reconciler_tick_secs: std::env::var("RECONCILER_TICK_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            orphan_sweep_every_n_ticks: std::env::var("ORPHAN_SWEEP_EVERY_N_TICKS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(6),
            orphan_container_age_minutes: std::env::var("ORPHAN_CONTAINER_AGE_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            whitelist_enabled: std::env::var("WHITELIST_ENABLED")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            blacklist_enabled: std::env::var("BLACKLIST_ENABLED")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            smtp_host: std::env::var("SMTP_HOST").ok(),
            smtp_port: std::env::var("SMTP_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(587),
            smtp_from: std::env::var("SMTP_FROM").ok(),
            ldap_url: std::env::var("LDAP_URL").ok(),
            ldap_bind_dn: std::env::var("LDAP_BIND_DN").ok(),
        })
    }

    /// `[portRangeStart, portRangeEnd)` as the Port Allocator expects it.
    pub fn port_range(&self) -> (u16, u16) {
        (self.port_range_start, self.port_range_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal `AppConfig` with all fields defaulted. Override
    /// specific fields in each test via struct update syntax.
    fn base_config() -> AppConfig {
        AppConfig {
            database_url: "sqlite::memory:".into(),
            docker_host: "unix:///var/run/docker.sock".into(),
            registry_address: "registry.hub.docker.com".into(),
            server_name: "node-1".into(),
            port_range_start: 20000,
            port_range_end: 21000,
            reconciler_tick_secs: 10,
            orphan_sweep_every_n_ticks: 6,
            orphan_container_age_minutes: 30,
            whitelist_enabled: false,
            blacklist_enabled: false,
            smtp_host: None,
            smtp_port: 587,
            smtp_from: None,
            ldap_url: None,
            ldap_bind_dn: None,
        }
    }

    #[test]
    fn port_range_returns_configured_bounds() {
        let cfg = AppConfig {
            port_range_start: 30000,
            port_range_end: 30100,
            ..base_config()
        };
        assert_eq!(cfg.port_range(), (30000, 30100));
    }

    #[test]
    fn defaults_are_sane_when_unset() {
        let cfg = base_config();
        assert!(cfg.port_range_start < cfg.port_range_end);
        assert_eq!(cfg.reconciler_tick_secs, 10);
        assert_eq!(cfg.orphan_sweep_every_n_ticks, 6);
    }
}
