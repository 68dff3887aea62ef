//! Process-wide registry of live sessions.
//!
//! Alive only while the process runs. Job fan-out rides a broadcast channel,
//! so registering or dropping a session never blocks a broadcast in
//! progress, and each receiver observes jobs in publication order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::job::Job;

// ─── Per-session shared state (stats surface) ────────────────────────

/// Counters a session keeps current for external stats queries.
pub struct SessionShared {
    miner: std::sync::RwLock<Option<String>>,
    difficulty_bits: AtomicU64,
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub stale: AtomicU64,
}

impl SessionShared {
    fn new(difficulty: f64) -> Self {
        SessionShared {
            miner: std::sync::RwLock::new(None),
            difficulty_bits: AtomicU64::new(difficulty.to_bits()),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            stale: AtomicU64::new(0),
        }
    }

    pub fn miner(&self) -> Option<String> {
        self.miner.read().unwrap().clone()
    }

    pub fn set_miner(&self, identity: &str) {
        *self.miner.write().unwrap() = Some(identity.to_string());
    }

    pub fn difficulty(&self) -> f64 {
        f64::from_bits(self.difficulty_bits.load(Ordering::Relaxed))
    }

    pub fn set_difficulty(&self, difficulty: f64) {
        self.difficulty_bits.store(difficulty.to_bits(), Ordering::Relaxed);
    }
}

/// Stats snapshot for one live session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionStats {
    pub session_id: u64,
    pub peer: String,
    pub difficulty: f64,
    pub accepted: u64,
    pub rejected: u64,
    pub stale: u64,
}

// ─── Registry ────────────────────────────────────────────────────────

struct Registered {
    peer: String,
    extranonce1: u32,
    shared: Arc<SessionShared>,
}

/// Everything a freshly-registered connection needs.
pub struct SessionSeat {
    pub session_id: u64,
    pub extranonce1: u32,
    pub shared: Arc<SessionShared>,
    pub job_rx: broadcast::Receiver<Arc<Job>>,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<u64, Registered>>,
    next_id: AtomicU64,
    job_tx: broadcast::Sender<Arc<Job>>,
    extranonces: std::sync::Mutex<ExtranonceAllocator>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (job_tx, _) = broadcast::channel(64);
        SessionRegistry {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            job_tx,
            extranonces: std::sync::Mutex::new(ExtranonceAllocator::new()),
        }
    }

    pub async fn register(&self, peer: &str, start_difficulty: f64) -> SessionSeat {
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let extranonce1 = self.extranonces.lock().unwrap().alloc();
        let shared = Arc::new(SessionShared::new(start_difficulty));
        let job_rx = self.job_tx.subscribe();
        self.sessions.write().await.insert(
            session_id,
            Registered { peer: peer.to_string(), extranonce1, shared: shared.clone() },
        );
        SessionSeat { session_id, extranonce1, shared, job_rx }
    }

    /// Drop a closed session and return its extranonce1 to the free pool.
    /// Only called after the connection is gone, so a still-buffered share
    /// can never race a reused extranonce.
    pub async fn unregister(&self, session_id: u64) {
        if let Some(registered) = self.sessions.write().await.remove(&session_id) {
            self.extranonces.lock().unwrap().release(registered.extranonce1);
        }
    }

    /// Fan a job out to every subscribed session. Sessions not yet in a
    /// job-receiving state ignore it on their side.
    pub fn broadcast(&self, job: Arc<Job>) -> usize {
        self.job_tx.send(job).unwrap_or(0)
    }

    pub async fn find(&self, miner: &str) -> Vec<SessionStats> {
        let sessions = self.sessions.read().await;
        let mut stats: Vec<SessionStats> = sessions
            .iter()
            .filter(|(_, s)| s.shared.miner().as_deref() == Some(miner))
            .map(|(id, s)| SessionStats {
                session_id: *id,
                peer: s.peer.clone(),
                difficulty: s.shared.difficulty(),
                accepted: s.shared.accepted.load(Ordering::Relaxed),
                rejected: s.shared.rejected.load(Ordering::Relaxed),
                stale: s.shared.stale.load(Ordering::Relaxed),
            })
            .collect();
        stats.sort_by_key(|s| s.session_id);
        stats
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Extranonce1 allocation ──────────────────────────────────────────

/// Hands out per-session extranonce1 values, unique among live sessions.
/// The base is randomized per process so values do not repeat across
/// restarts in predictable ways.
struct ExtranonceAllocator {
    next: u32,
    free: Vec<u32>,
    in_use: HashSet<u32>,
}

impl ExtranonceAllocator {
    fn new() -> Self {
        ExtranonceAllocator { next: rand::random(), free: Vec::new(), in_use: HashSet::new() }
    }

    fn alloc(&mut self) -> u32 {
        if let Some(value) = self.free.pop() {
            self.in_use.insert(value);
            return value;
        }
        loop {
            let candidate = self.next;
            self.next = self.next.wrapping_add(1);
            if self.in_use.insert(candidate) {
                return candidate;
            }
        }
    }

    fn release(&mut self, value: u32) {
        if self.in_use.remove(&value) {
            self.free.push(value);
        }
    }
}
