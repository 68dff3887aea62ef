//! Durable share ledger: who earned what, surviving crashes.
//!
//! All mutation goes through one serialized path (an async mutex), and every
//! mutation is flushed to disk before the call returns. The on-disk layout is
//! a primary JSON snapshot plus one rotated backup:
//!
//!   write temp → fsync → copy primary to `.bak` → rename temp over primary
//!
//! so an interrupted write can never corrupt the previous snapshot. Startup
//! loads the primary, falls back to the backup when the primary is truncated
//! or unparseable, and refuses to start only when both are unreadable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

/// Bumped when the snapshot layout changes shape.
pub const LEDGER_SCHEMA_VERSION: u32 = 1;

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

// ─── Entries ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditStatus {
    Immature,
    Confirmed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockCredit {
    pub height: u64,
    pub hash: String,
    pub amount_sats: u64,
    pub status: CreditStatus,
    pub unix_time: u64,
}

/// Per-miner accumulated state. Counters only ever grow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub accepted_shares: u64,
    pub accepted_weight: f64,
    pub blocks: Vec<BlockCredit>,
    pub paid_sats: u64,
    pub first_share: u64,
    pub last_updated: u64,
}

impl LedgerEntry {
    fn new(now: u64) -> Self {
        LedgerEntry {
            accepted_shares: 0,
            accepted_weight: 0.0,
            blocks: Vec::new(),
            paid_sats: 0,
            first_share: now,
            last_updated: now,
        }
    }

    pub fn immature_sats(&self) -> u64 {
        self.blocks
            .iter()
            .filter(|b| b.status == CreditStatus::Immature)
            .map(|b| b.amount_sats)
            .sum()
    }

    pub fn confirmed_sats(&self) -> u64 {
        self.blocks
            .iter()
            .filter(|b| b.status == CreditStatus::Confirmed)
            .map(|b| b.amount_sats)
            .sum()
    }

    /// Confirmed value not yet disbursed.
    pub fn unpaid_sats(&self) -> u64 {
        self.confirmed_sats().saturating_sub(self.paid_sats)
    }
}

/// On-disk snapshot shape. Round-trips every entry field exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerFile {
    pub version: u32,
    pub entries: BTreeMap<String, LedgerEntry>,
}

/// Read-only per-miner view for the stats API.
#[derive(Debug, Clone, Serialize)]
pub struct MinerStats {
    pub address: String,
    pub shares: u64,
    pub share_weight: f64,
    pub blocks_found: usize,
    pub immature_sats: u64,
    pub confirmed_sats: u64,
    pub unpaid_sats: u64,
    pub paid_sats: u64,
    pub first_share: u64,
    pub last_share: u64,
}

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum LedgerError {
    /// Both snapshot copies are present but unreadable; startup must stop.
    Corrupt(String),
    /// Writing failed on both the primary and the backup path; the mutation
    /// was rolled back and must not be acknowledged.
    StorageFailed(String),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Corrupt(e) => write!(f, "ledger unreadable: {}", e),
            LedgerError::StorageFailed(e) => write!(f, "ledger write failed: {}", e),
        }
    }
}

impl std::error::Error for LedgerError {}

// ─── Ledger ──────────────────────────────────────────────────────────

pub struct Ledger {
    path: PathBuf,
    bak_path: PathBuf,
    tmp_path: PathBuf,
    entries: Mutex<BTreeMap<String, LedgerEntry>>,
}

enum Loaded {
    Missing,
    Ok(LedgerFile),
    Bad(String),
}

fn load_file(path: &Path) -> Loaded {
    let json = match std::fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Loaded::Missing,
        Err(e) => return Loaded::Bad(e.to_string()),
    };
    match serde_json::from_str::<LedgerFile>(&json) {
        Ok(file) if file.version == LEDGER_SCHEMA_VERSION => Loaded::Ok(file),
        Ok(file) => Loaded::Bad(format!("unsupported schema version {}", file.version)),
        Err(e) => Loaded::Bad(e.to_string()),
    }
}

impl Ledger {
    /// Load the latest valid snapshot, preferring the primary.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let bak_path = PathBuf::from(format!("{}.bak", path.display()));
        let tmp_path = PathBuf::from(format!("{}.tmp", path.display()));

        let entries = match load_file(&path) {
            Loaded::Ok(file) => file.entries,
            Loaded::Missing => match load_file(&bak_path) {
                Loaded::Ok(file) => {
                    tracing::warn!("📂 Ledger primary missing, recovered from backup");
                    file.entries
                }
                Loaded::Missing => BTreeMap::new(),
                Loaded::Bad(bak_err) => {
                    // The only surviving copy is unreadable; starting fresh
                    // here would zero every balance.
                    return Err(LedgerError::Corrupt(format!(
                        "primary missing and backup unreadable: {}",
                        bak_err
                    )));
                }
            },
            Loaded::Bad(primary_err) => match load_file(&bak_path) {
                Loaded::Ok(file) => {
                    tracing::warn!(
                        "📂 Ledger primary unreadable ({}), recovered from backup",
                        primary_err
                    );
                    file.entries
                }
                Loaded::Missing => {
                    return Err(LedgerError::Corrupt(format!(
                        "primary unreadable ({}) and no backup exists",
                        primary_err
                    )))
                }
                Loaded::Bad(bak_err) => {
                    return Err(LedgerError::Corrupt(format!(
                        "primary: {}; backup: {}",
                        primary_err, bak_err
                    )))
                }
            },
        };

        Ok(Ledger { path, bak_path, tmp_path, entries: Mutex::new(entries) })
    }

    /// Write the snapshot: temp + fsync, rotate the old primary to `.bak`,
    /// atomically replace. On failure, retry directly against the backup
    /// path so the mutation still lands somewhere durable.
    fn persist(&self, entries: &BTreeMap<String, LedgerEntry>) -> Result<(), LedgerError> {
        let file = LedgerFile { version: LEDGER_SCHEMA_VERSION, entries: entries.clone() };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| LedgerError::StorageFailed(e.to_string()))?;

        match self.write_rotated(&json) {
            Ok(()) => Ok(()),
            Err(primary_err) => match std::fs::write(&self.bak_path, &json) {
                Ok(()) => {
                    tracing::warn!(
                        "💾 Ledger primary write failed ({}), snapshot landed on backup",
                        primary_err
                    );
                    Ok(())
                }
                Err(bak_err) => Err(LedgerError::StorageFailed(format!(
                    "primary: {}; backup: {}",
                    primary_err, bak_err
                ))),
            },
        }
    }

    fn write_rotated(&self, json: &str) -> Result<(), std::io::Error> {
        let mut tmp = std::fs::File::create(&self.tmp_path)?;
        tmp.write_all(json.as_bytes())?;
        tmp.sync_all()?;
        drop(tmp);
        if self.path.exists() {
            std::fs::copy(&self.path, &self.bak_path)?;
        }
        std::fs::rename(&self.tmp_path, &self.path)
    }

    /// Record one accepted share. Returns the miner's new accepted count.
    /// The increment is rolled back when it cannot be made durable.
    pub async fn apply_share(&self, identity: &str, weight: f64) -> Result<u64, LedgerError> {
        let now = unix_now();
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(identity.to_string()).or_insert_with(|| LedgerEntry::new(now));
        entry.accepted_shares += 1;
        entry.accepted_weight += weight;
        entry.last_updated = now;
        let count = entry.accepted_shares;

        if let Err(e) = self.persist(&entries) {
            let entry = entries.get_mut(identity).unwrap();
            entry.accepted_shares -= 1;
            entry.accepted_weight -= weight;
            return Err(e);
        }
        Ok(count)
    }

    /// Credit a found block. Idempotent per (identity, height): re-crediting
    /// the same height is a no-op returning `false`.
    pub async fn apply_block_credit(
        &self,
        identity: &str,
        height: u64,
        hash: &str,
        amount_sats: u64,
    ) -> Result<bool, LedgerError> {
        let now = unix_now();
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(identity.to_string()).or_insert_with(|| LedgerEntry::new(now));
        if entry.blocks.iter().any(|b| b.height == height) {
            return Ok(false);
        }
        entry.blocks.push(BlockCredit {
            height,
            hash: hash.to_string(),
            amount_sats,
            status: CreditStatus::Immature,
            unix_time: now,
        });
        entry.last_updated = now;

        if let Err(e) = self.persist(&entries) {
            entries.get_mut(identity).unwrap().blocks.pop();
            return Err(e);
        }
        Ok(true)
    }

    /// Flip credits buried `confirmations` deep to `Confirmed`. Returns how
    /// many flipped. Credits are never reversed here; reorg handling is an
    /// explicit operator decision outside the ledger.
    pub async fn confirm_credits(
        &self,
        tip_height: u64,
        confirmations: u64,
    ) -> Result<usize, LedgerError> {
        let now = unix_now();
        let mut entries = self.entries.lock().await;
        let mut flipped: Vec<(String, usize)> = Vec::new();
        for (identity, entry) in entries.iter_mut() {
            let before = flipped.len();
            for (i, credit) in entry.blocks.iter_mut().enumerate() {
                if credit.status == CreditStatus::Immature
                    && tip_height >= credit.height + confirmations
                {
                    credit.status = CreditStatus::Confirmed;
                    flipped.push((identity.clone(), i));
                }
            }
            if flipped.len() > before {
                entry.last_updated = now;
            }
        }
        if flipped.is_empty() {
            return Ok(0);
        }
        if let Err(e) = self.persist(&entries) {
            for (identity, i) in &flipped {
                entries.get_mut(identity).unwrap().blocks[*i].status = CreditStatus::Immature;
            }
            return Err(e);
        }
        Ok(flipped.len())
    }

    /// Record a completed disbursement of confirmed value.
    pub async fn record_payout(&self, identity: &str, amount_sats: u64) -> Result<(), LedgerError> {
        let now = unix_now();
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(identity) else { return Ok(()) };
        entry.paid_sats += amount_sats;
        entry.last_updated = now;
        if let Err(e) = self.persist(&entries) {
            entries.get_mut(identity).unwrap().paid_sats -= amount_sats;
            return Err(e);
        }
        Ok(())
    }

    pub async fn stats(&self, identity: &str) -> Option<MinerStats> {
        let entries = self.entries.lock().await;
        entries.get(identity).map(|e| MinerStats {
            address: identity.to_string(),
            shares: e.accepted_shares,
            share_weight: e.accepted_weight,
            blocks_found: e.blocks.len(),
            immature_sats: e.immature_sats(),
            confirmed_sats: e.confirmed_sats(),
            unpaid_sats: e.unpaid_sats(),
            paid_sats: e.paid_sats,
            first_share: e.first_share,
            last_share: e.last_updated,
        })
    }

    /// Full read-only snapshot for the payout sweep.
    pub async fn snapshot(&self) -> BTreeMap<String, LedgerEntry> {
        self.entries.lock().await.clone()
    }

    /// Re-persist the current state, refreshing the backup rotation.
    pub async fn flush(&self) -> Result<(), LedgerError> {
        let entries = self.entries.lock().await;
        self.persist(&entries)
    }
}
