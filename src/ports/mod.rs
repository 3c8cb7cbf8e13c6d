//! Port Allocator (spec §4.1/§4.4): picks a free outside port from the
//! configured range, avoiding ports held by any `started` reservation on the
//! same computer and ports the local OS reports bound. Allocation is
//! serialized per computer so two concurrent launches cannot race on the
//! same port (spec §5).

use std::collections::{HashMap, HashSet};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::RngExt;
use tokio::sync::Mutex;

use crate::db::Database;

const MAX_ATTEMPTS: usize = 50;
const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Per-computer allocation locks, held across the allocate-and-record
/// critical section so two concurrent launches on the same computer never
/// pick the same port (spec §5 "Ordering guarantees").
#[derive(Clone, Default)]
pub struct PortAllocator {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl PortAllocator {
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

    /// Allocates one outside port on `computer_id` from
    /// `[range_start, range_end)`, holding the per-computer lock for the
    /// duration of the call.
    pub async fn allocate(
        &self,
        db: &Database,
        computer_id: &str,
        range_start: u16,
        range_end: u16,
    ) -> Result<u16> {
        let lock = self.lock_for(computer_id).await;
        let _guard = lock.lock().await;
        allocate_locked(db, computer_id, range_start, range_end).await
    }

    /// Allocates `count` distinct outside ports in one critical section —
    /// used by container launch, which needs one port per exposed service.
    pub async fn allocate_many(
        &self,
        db: &Database,
        computer_id: &str,
        range_start: u16,
        range_end: u16,
        count: usize,
    ) -> Result<Vec<u16>> {
        let lock = self.lock_for(computer_id).await;
        let _guard = lock.lock().await;

        let in_use = ports_in_use(db, computer_id).await?;
        let mut taken: HashSet<u16> = in_use;
        let mut result = Vec::with_capacity(count);
        for _ in 0..count {
            let port = pick_port(range_start, range_end, &taken)?;
            taken.insert(port);
            result.push(port);
        }
        Ok(result)
    }
}

async fn allocate_locked(
    db: &Database,
    computer_id: &str,
    range_start: u16,
    range_end: u16,
) -> Result<u16> {
    let in_use = ports_in_use(db, computer_id).await?;
    pick_port(range_start, range_end, &in_use)
}

/// Every `outsidePort` bound by a reservation with status `started` on this
/// computer (grounded in `get_available_port`'s scan of started
/// reservations).
async fn ports_in_use(db: &Database, computer_id: &str) -> Result<HashSet<u16>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT rcp.outside_port \
         FROM reserved_container_ports rcp \
         JOIN reserved_containers rc ON rc.id = rcp.reserved_container_id \
         JOIN reservations r ON r.reserved_container_id = rc.id \
         WHERE r.computer_id = ? AND r.status = 'started'",
    )
    .bind(computer_id)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows.into_iter().map(|(p,)| p as u16).collect())
}

/// Scans up to `MAX_ATTEMPTS` random candidates from the range minus
/// `excluded`, verifying each is unbound on localhost. Falls back to a
/// random choice from the candidate pool on exhaustion — the subsequent
/// Docker publish will fail and the reservation moves to `error` if it was
/// actually taken (spec §4.4 Port Allocator contract).
fn pick_port(range_start: u16, range_end: u16, excluded: &HashSet<u16>) -> Result<u16> {
    let candidates: Vec<u16> = (range_start..range_end)
        .filter(|p| !excluded.contains(p))
        .collect();
    if candidates.is_empty() {
        anyhow::bail!("no ports available in range {range_start}..{range_end}");
    }

    let mut rng = rand::rng();
    for _ in 0..MAX_ATTEMPTS {
        let candidate = candidates[rng.random_range(0..candidates.len())];
        if !is_port_in_use(candidate) {
            return Ok(candidate);
        }
    }

    tracing::warn!(
        "port allocator exhausted {MAX_ATTEMPTS} attempts in {range_start}..{range_end}; \
         falling back to an unverified candidate"
    );
    Ok(candidates[rng.random_range(0..candidates.len())])
}

fn is_port_in_use(port: u16) -> bool {
    TcpStream::connect_timeout(
        &std::net::SocketAddr::from(([127, 0, 0, 1], port)),
        PROBE_TIMEOUT,
    )
    .is_ok()
}
