//! Per-connection protocol state machine.
//!
//! A session walks `Connected → Subscribed → Authorized → Working → Closed`.
//! Out-of-order messages get a protocol error and count toward a consecutive
//! violation limit; share rejections do not. All share validation happens
//! here, in order: job staleness, well-formedness, pool target, duplicate.
//! Accepted shares are durably recorded before the miner sees the ack, and
//! the network-target check runs afterwards, independently.

use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use super::registry::{SessionRegistry, SessionShared};
use super::{
    err_response, notification, ok_response, reject_response, valid_miner_identity,
    StratumRequest, ERR_DUPLICATE, ERR_LOW_DIFFICULTY, ERR_NOT_SUBSCRIBED, ERR_OTHER,
    ERR_STALE_JOB, ERR_UNAUTHORIZED_WORKER,
};
use crate::config::PoolSettings;
use crate::job::{Job, JobLookup, JobStore};
use crate::ledger::Ledger;
use crate::pow::{self, Hash256, Target};
use crate::vardiff::{DifficultyController, VardiffSettings};

/// Shared collaborators every session works against.
pub struct SessionCtx {
    pub settings: Arc<PoolSettings>,
    pub jobs: Arc<JobStore>,
    pub registry: Arc<SessionRegistry>,
    pub ledger: Arc<Ledger>,
    pub candidates: mpsc::Sender<BlockCandidate>,
}

/// An accepted share that also met the network target; handed to the block
/// submitter exactly once.
pub struct BlockCandidate {
    pub job: Arc<Job>,
    pub miner: String,
    pub coinbase: Vec<u8>,
    pub header: [u8; 80],
    pub hash: Hash256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Subscribed,
    Authorized,
    Working,
    Closed,
}

struct DecodedShare {
    extranonce2: Vec<u8>,
    ntime: u32,
    nonce: u32,
}

pub struct Session {
    id: u64,
    peer: String,
    state: SessionState,
    miner: Option<String>,
    extranonce1: u32,
    extranonce2_size: usize,
    /// Difficulty governing jobs sent from now on.
    difficulty: f64,
    /// Difficulty announced to the miner so far, if any.
    announced_difficulty: Option<f64>,
    /// Takes effect on the next job push, never retroactively.
    pending_difficulty: Option<f64>,
    /// Difficulty each live job was served at, keyed by job id.
    job_difficulty: HashMap<u64, f64>,
    vardiff: DifficultyController,
    current_job_id: Option<u64>,
    previous_job_id: Option<u64>,
    /// (job_id, extranonce2, nonce) tuples already accepted.
    accepted_tuples: HashSet<(u64, String, u32)>,
    violations: u32,
    max_violations: u32,
    shared: Arc<SessionShared>,
}

impl Session {
    pub fn new(
        id: u64,
        peer: String,
        extranonce1: u32,
        shared: Arc<SessionShared>,
        settings: &PoolSettings,
    ) -> Self {
        let vardiff = DifficultyController::new(
            settings.start_difficulty,
            VardiffSettings {
                target_share_secs: settings.vardiff_target_secs,
                min_shares: settings.vardiff_min_shares,
                eval_interval: std::time::Duration::from_secs(settings.vardiff_eval_secs),
                min_difficulty: settings.min_difficulty,
                max_difficulty: settings.max_difficulty,
            },
        );
        Session {
            id,
            peer,
            state: SessionState::Connected,
            miner: None,
            extranonce1,
            extranonce2_size: settings.extranonce2_size,
            difficulty: settings.start_difficulty,
            announced_difficulty: None,
            pending_difficulty: None,
            job_difficulty: HashMap::new(),
            vardiff,
            current_job_id: None,
            previous_job_id: None,
            accepted_tuples: HashSet::new(),
            violations: 0,
            max_violations: settings.max_violations,
            shared,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    pub fn miner(&self) -> Option<String> {
        self.miner.clone()
    }

    // ── Message dispatch ──

    /// Handle one wire line; returns the messages to send back, in order.
    pub async fn handle_line(&mut self, line: &str, ctx: &SessionCtx) -> Vec<Value> {
        let request: StratumRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("Session {}: invalid JSON from {}: {}", self.id, self.peer, e);
                self.note_violation();
                return Vec::new();
            }
        };
        match request.method.as_str() {
            "mining.subscribe" => self.handle_subscribe(request.id),
            "mining.authorize" => self.handle_authorize(request.id, &request.params, ctx).await,
            "mining.submit" => self.handle_submit(request.id, &request.params, ctx).await,
            other => {
                tracing::debug!("Session {}: unknown method {}", self.id, other);
                self.protocol_error(request.id, ERR_OTHER, "Method not found")
            }
        }
    }

    /// React to a job broadcast. No-op unless the session can receive work,
    /// and an already-seen (or older) job is never re-delivered.
    pub fn on_job(&mut self, job: &Arc<Job>) -> Vec<Value> {
        match self.state {
            SessionState::Authorized | SessionState::Working => {
                if let Some(current) = self.current_job_id {
                    if job.id <= current {
                        return Vec::new();
                    }
                }
                self.push_job(job)
            }
            _ => Vec::new(),
        }
    }

    // ── Handlers ──

    fn handle_subscribe(&mut self, id: Option<Value>) -> Vec<Value> {
        if self.state != SessionState::Connected {
            return self.protocol_error(id, ERR_OTHER, "Already subscribed");
        }
        self.violations = 0;
        self.state = SessionState::Subscribed;
        let result = json!([
            [
                ["mining.set_difficulty", "subscription_id"],
                ["mining.notify", "notification_id"]
            ],
            format!("{:08x}", self.extranonce1),
            self.extranonce2_size,
        ]);
        vec![ok_response(id, result)]
    }

    async fn handle_authorize(
        &mut self,
        id: Option<Value>,
        params: &Value,
        ctx: &SessionCtx,
    ) -> Vec<Value> {
        match self.state {
            SessionState::Subscribed => {}
            SessionState::Connected => {
                return self.protocol_error(id, ERR_NOT_SUBSCRIBED, "Not subscribed")
            }
            _ => return self.protocol_error(id, ERR_OTHER, "Already authorized"),
        }
        let parsed = params.as_array().filter(|p| p.len() >= 2).and_then(|p| {
            Some((p[0].as_str()?, p[1].as_str()?))
        });
        let Some((worker, password)) = parsed else {
            return self.protocol_error(id, ERR_OTHER, "Invalid authorize params");
        };
        self.violations = 0;

        if password != ctx.settings.join_password {
            tracing::debug!("Session {}: bad password for {}", self.id, worker);
            return vec![reject_response(id, ERR_UNAUTHORIZED_WORKER, "Unauthorized worker")];
        }
        if !valid_miner_identity(worker) {
            return vec![reject_response(id, ERR_UNAUTHORIZED_WORKER, "Invalid miner address")];
        }

        self.miner = Some(worker.to_string());
        self.shared.set_miner(worker);
        self.state = SessionState::Authorized;
        tracing::info!("✅ Authorized {} from {}", worker, self.peer);

        let mut out = vec![ok_response(id, json!(true))];
        if let Some(job) = ctx.jobs.current().await {
            out.extend(self.push_job(&job));
        }
        out
    }

    async fn handle_submit(
        &mut self,
        id: Option<Value>,
        params: &Value,
        ctx: &SessionCtx,
    ) -> Vec<Value> {
        match self.state {
            SessionState::Authorized | SessionState::Working => {}
            _ => {
                return self.protocol_error(id, ERR_UNAUTHORIZED_WORKER, "Unauthorized worker")
            }
        }
        let parsed = params.as_array().filter(|p| p.len() >= 5).and_then(|p| {
            Some((p[1].as_str()?, p[2].as_str()?, p[3].as_str()?, p[4].as_str()?))
        });
        let Some((job_id_hex, en2_hex, ntime_hex, nonce_hex)) = parsed else {
            return self.protocol_error(id, ERR_OTHER, "Invalid submit params");
        };
        self.violations = 0;

        // (a) the job must be current, or the graced previous one.
        let lookup = match u64::from_str_radix(job_id_hex, 16) {
            Ok(job_id) => ctx.jobs.lookup(job_id).await,
            Err(_) => JobLookup::Stale,
        };
        let job = match lookup {
            JobLookup::Current(job) | JobLookup::Graced(job) => job,
            JobLookup::Stale => {
                self.shared.stale.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Session {}: stale share for job {}", self.id, job_id_hex);
                return vec![reject_response(id, ERR_STALE_JOB, "Job not found (stale)")];
            }
        };

        // (b) fields must be well-formed for this job's encoding.
        let share = match self.decode_share(&job, en2_hex, ntime_hex, nonce_hex) {
            Ok(share) => share,
            Err(reason) => {
                self.reject_share();
                return vec![reject_response(id, ERR_OTHER, reason)];
            }
        };

        // (c) the rebuilt header must meet the difficulty this job was
        // served at. A later vardiff step never re-judges in-flight work.
        let difficulty = self.job_difficulty.get(&job.id).copied().unwrap_or(self.difficulty);
        let coinbase = job.assemble_coinbase(&self.extranonce1.to_be_bytes(), &share.extranonce2);
        let merkle_root = job.merkle_root(&coinbase);
        let header = pow::serialize_header(
            job.version,
            &job.prev_hash_le,
            &merkle_root,
            share.ntime,
            job.nbits,
            share.nonce,
        );
        let hash = pow::header_hash(&header);
        if !Target::from_difficulty(difficulty).is_met_by(&hash) {
            self.reject_share();
            tracing::debug!("Session {}: low difficulty share (need {})", self.id, difficulty);
            return vec![reject_response(id, ERR_LOW_DIFFICULTY, "Low difficulty share")];
        }

        // (d) reject what this session already got credit for.
        let tuple = (job.id, en2_hex.to_ascii_lowercase(), share.nonce);
        if self.accepted_tuples.contains(&tuple) {
            self.reject_share();
            tracing::debug!("Session {}: duplicate share nonce={:08x}", self.id, share.nonce);
            return vec![reject_response(id, ERR_DUPLICATE, "Duplicate share")];
        }

        // Durably record before acknowledging.
        let miner = self.miner.clone().unwrap_or_default();
        match ctx.ledger.apply_share(&miner, difficulty).await {
            Ok(total) => {
                tracing::debug!(
                    "💎 Share accepted from {} (session {}, total {})",
                    miner,
                    self.id,
                    total
                );
            }
            Err(e) => {
                tracing::error!("💾 Share from {} not recorded: {}", miner, e);
                self.reject_share();
                return vec![reject_response(id, ERR_OTHER, "Share not recorded, storage unavailable")];
            }
        }
        self.accepted_tuples.insert(tuple);
        self.shared.accepted.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        self.vardiff.record_share(now);
        if let Some(next) = self.vardiff.evaluate(now) {
            // Applied when the next job goes out.
            self.pending_difficulty = Some(next);
        }

        // Network-target check: independent of pool acceptance.
        if job.network_target.is_met_by(&hash) {
            tracing::info!(
                "🎉 Block candidate from {} at height {}: {}",
                miner,
                job.height,
                pow::display_hash(&hash)
            );
            let candidate = BlockCandidate {
                job: job.clone(),
                miner: miner.clone(),
                coinbase,
                header,
                hash,
            };
            if ctx.candidates.send(candidate).await.is_err() {
                tracing::error!("Block candidate channel closed, submission lost");
            }
        }

        vec![ok_response(id, json!(true))]
    }

    // ── Helpers ──

    fn decode_share(
        &self,
        job: &Job,
        en2_hex: &str,
        ntime_hex: &str,
        nonce_hex: &str,
    ) -> Result<DecodedShare, &'static str> {
        let extranonce2 = hex::decode(en2_hex).map_err(|_| "Malformed extranonce2")?;
        if extranonce2.len() != job.extranonce2_size {
            return Err("Malformed extranonce2");
        }
        if ntime_hex.len() != 8 {
            return Err("Malformed ntime");
        }
        let ntime = u32::from_str_radix(ntime_hex, 16).map_err(|_| "Malformed ntime")?;
        if job.min_time > 0 && ntime < job.min_time {
            return Err("ntime below template minimum");
        }
        if nonce_hex.len() != 8 {
            return Err("Malformed nonce");
        }
        let nonce = u32::from_str_radix(nonce_hex, 16).map_err(|_| "Malformed nonce")?;
        Ok(DecodedShare { extranonce2, ntime, nonce })
    }

    /// Send a job (and any pending difficulty) to the miner. The difficulty
    /// each job is served at is pinned so in-flight shares keep their terms.
    fn push_job(&mut self, job: &Arc<Job>) -> Vec<Value> {
        if self.pending_difficulty.is_none() {
            // Time-based half of the vardiff cadence: a session too quiet to
            // trip the share-count path still steps down on job refresh.
            self.pending_difficulty = self.vardiff.evaluate(Instant::now());
        }
        if let Some(next) = self.pending_difficulty.take() {
            self.difficulty = next;
            self.shared.set_difficulty(next);
        }
        let mut out = Vec::with_capacity(2);
        if self.announced_difficulty != Some(self.difficulty) {
            out.push(notification("mining.set_difficulty", json!([self.difficulty])));
            self.announced_difficulty = Some(self.difficulty);
        }
        out.push(notification("mining.notify", job.notify_params()));

        self.job_difficulty.insert(job.id, self.difficulty);
        self.previous_job_id = self.current_job_id.replace(job.id);
        let (current, previous) = (self.current_job_id, self.previous_job_id);
        self.accepted_tuples
            .retain(|(jid, _, _)| Some(*jid) == current || Some(*jid) == previous);
        self.job_difficulty
            .retain(|jid, _| Some(*jid) == current || Some(*jid) == previous);
        self.state = SessionState::Working;
        out
    }

    fn reject_share(&mut self) {
        self.shared.rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn protocol_error(&mut self, id: Option<Value>, code: i64, message: &str) -> Vec<Value> {
        self.note_violation();
        vec![err_response(id, code, message)]
    }

    fn note_violation(&mut self) {
        self.violations += 1;
        if self.violations >= self.max_violations {
            tracing::warn!(
                "🔌 Session {} ({}) closed after {} consecutive protocol violations",
                self.id,
                self.peer,
                self.violations
            );
            self.state = SessionState::Closed;
        }
    }
}
