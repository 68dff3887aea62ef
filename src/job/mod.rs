//! Mining job construction and publication.
//!
//! A `Job` is an immutable unit of work derived from a block template:
//! coinbase halves with the extranonce gap, the merkle branch for the
//! coinbase, and the network target. Jobs are built by one updater
//! (`JobBuilder`), published whole through the `JobStore` (snapshot-publish,
//! never mutated in place), and fanned out to sessions by the registry.

use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::pow::{double_sha256, Hash256, Target};

/// Size of the per-session extranonce1, in bytes.
pub const EXTRANONCE1_SIZE: usize = 4;

// ─── Template (node boundary shape) ─────────────────────────────────

/// The subset of `getblocktemplate` the pool consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct Template {
    pub version: u32,
    pub previousblockhash: String,
    pub height: u64,
    #[serde(default)]
    pub coinbasevalue: u64,
    #[serde(default)]
    pub bits: String,
    #[serde(default)]
    pub target: Option<String>,
    pub curtime: u32,
    #[serde(default)]
    pub mintime: Option<u32>,
    #[serde(default)]
    pub transactions: Vec<TemplateTx>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateTx {
    /// Raw transaction hex, appended verbatim when a block is assembled.
    pub data: String,
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
}

impl TemplateTx {
    /// Display-order txid hex (bitcoind reports `txid` separately from the
    /// witness `hash`; older nodes only send `hash`).
    fn id_hex(&self) -> Option<&str> {
        self.txid.as_deref().or(self.hash.as_deref())
    }
}

// ─── Job ─────────────────────────────────────────────────────────────

/// One unit of mining work. Immutable once built; superseded, never mutated.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: u64,
    pub height: u64,
    /// Previous block hash, display (big-endian) hex from the template.
    pub prev_hash: String,
    /// The same hash in internal (little-endian) order, for header assembly.
    pub prev_hash_le: Hash256,
    pub coinb1: String,
    pub coinb2: String,
    /// Sibling hashes for the coinbase's merkle path, internal order hex.
    pub merkle_branch: Vec<String>,
    pub version: u32,
    pub nbits: u32,
    pub ntime: u32,
    pub min_time: u32,
    pub clean_jobs: bool,
    pub network_target: Target,
    pub extranonce2_size: usize,
    pub coinbase_value: u64,
    /// Raw template transactions, kept for full-block assembly.
    pub raw_transactions: Vec<String>,
}

impl Job {
    /// Job id as the wire string sent in `mining.notify`.
    pub fn id_hex(&self) -> String {
        format!("{:x}", self.id)
    }

    /// `mining.notify` params, in the conventional order.
    pub fn notify_params(&self) -> serde_json::Value {
        serde_json::json!([
            self.id_hex(),
            stratum_prev_hash(&self.prev_hash_le),
            self.coinb1,
            self.coinb2,
            self.merkle_branch,
            format!("{:08x}", self.version),
            format!("{:08x}", self.nbits),
            format!("{:08x}", self.ntime),
            self.clean_jobs,
        ])
    }

    /// Rebuild the full coinbase from the halves and the two extranonces.
    pub fn assemble_coinbase(&self, extranonce1: &[u8], extranonce2: &[u8]) -> Vec<u8> {
        let mut coinbase = hex::decode(&self.coinb1).unwrap_or_default();
        coinbase.extend_from_slice(extranonce1);
        coinbase.extend_from_slice(extranonce2);
        coinbase.extend_from_slice(&hex::decode(&self.coinb2).unwrap_or_default());
        coinbase
    }

    /// Merkle root for a given coinbase, folding the branch upward.
    pub fn merkle_root(&self, coinbase: &[u8]) -> Hash256 {
        let mut root = double_sha256(coinbase);
        for sibling_hex in &self.merkle_branch {
            let sibling = hex::decode(sibling_hex).unwrap_or_default();
            let mut concat = Vec::with_capacity(64);
            concat.extend_from_slice(&root);
            concat.extend_from_slice(&sibling);
            root = double_sha256(&concat);
        }
        root
    }
}

/// Stratum's historical prev-hash encoding: internal byte order with each
/// 4-byte word reversed.
fn stratum_prev_hash(prev_le: &Hash256) -> String {
    let mut bytes = *prev_le;
    for word in bytes.chunks_mut(4) {
        word.reverse();
    }
    hex::encode(bytes)
}

// ─── Job Builder ─────────────────────────────────────────────────────

/// Fixed policy applied to every job the builder produces.
#[derive(Debug, Clone)]
pub struct JobPolicy {
    /// scriptPubKey the coinbase output pays to.
    pub coinbase_script: Vec<u8>,
    /// Arbitrary tag appended to the coinbase scriptSig.
    pub coinbase_tag: Vec<u8>,
    pub extranonce2_size: usize,
}

/// Turns templates into jobs. Single updater; ids increase monotonically.
pub struct JobBuilder {
    policy: JobPolicy,
    last_id: u64,
    last_height: u64,
}

#[derive(Debug)]
pub enum BuildError {
    MissingField(&'static str),
    /// Template height did not advance and the caller did not force a
    /// clean rebuild.
    StaleTemplate { height: u64, last: u64 },
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::MissingField(name) => write!(f, "template missing field: {}", name),
            BuildError::StaleTemplate { height, last } => {
                write!(f, "stale template: height {} <= last built {}", height, last)
            }
        }
    }
}

impl std::error::Error for BuildError {}

impl JobBuilder {
    pub fn new(policy: JobPolicy) -> Self {
        JobBuilder { policy, last_id: 0, last_height: 0 }
    }

    /// Build the next job from a template.
    ///
    /// `clean_jobs` marks the job as work-discarding on the wire and also
    /// forces acceptance of a template whose height has not advanced (the
    /// periodic refresh case). Without it, a non-advancing height is treated
    /// as a stale or duplicate template.
    ///
    /// Ids are `previous + 1`; the only wrap point is `u64::MAX → 0`, which
    /// no pool lifetime reaches but is pinned down by a test anyway.
    pub fn build(&mut self, template: &Template, clean_jobs: bool) -> Result<Job, BuildError> {
        let prev_bytes =
            hex::decode(&template.previousblockhash).map_err(|_| BuildError::MissingField("previousblockhash"))?;
        if prev_bytes.len() != 32 {
            return Err(BuildError::MissingField("previousblockhash"));
        }
        let nbits = u32::from_str_radix(&template.bits, 16)
            .map_err(|_| BuildError::MissingField("bits"))?;
        if template.coinbasevalue == 0 {
            return Err(BuildError::MissingField("coinbasevalue"));
        }
        if !clean_jobs && template.height <= self.last_height {
            return Err(BuildError::StaleTemplate { height: template.height, last: self.last_height });
        }

        let mut prev_hash_le: Hash256 = [0; 32];
        prev_hash_le.copy_from_slice(&prev_bytes);
        prev_hash_le.reverse();

        let network_target = template
            .target
            .as_deref()
            .and_then(Target::from_hex)
            .unwrap_or_else(|| Target::from_compact(nbits));

        let (coinb1, coinb2) = build_coinbase_halves(
            template.height,
            template.coinbasevalue,
            &self.policy.coinbase_script,
            &self.policy.coinbase_tag,
            self.policy.extranonce2_size,
        );

        let txids: Vec<Hash256> = template
            .transactions
            .iter()
            .filter_map(|tx| tx.id_hex())
            .filter_map(|id| {
                let bytes = hex::decode(id).ok()?;
                if bytes.len() != 32 {
                    return None;
                }
                let mut le: Hash256 = [0; 32];
                le.copy_from_slice(&bytes);
                le.reverse();
                Some(le)
            })
            .collect();
        let merkle_branch = merkle_branch(&txids).iter().map(hex::encode).collect();

        self.last_id = self.last_id.wrapping_add(1);
        self.last_height = self.last_height.max(template.height);

        Ok(Job {
            id: self.last_id,
            height: template.height,
            prev_hash: template.previousblockhash.clone(),
            prev_hash_le,
            coinb1: hex::encode(coinb1),
            coinb2: hex::encode(coinb2),
            merkle_branch,
            version: template.version,
            nbits,
            ntime: template.curtime,
            min_time: template.mintime.unwrap_or(0),
            clean_jobs,
            network_target,
            extranonce2_size: self.policy.extranonce2_size,
            coinbase_value: template.coinbasevalue,
            raw_transactions: template.transactions.iter().map(|tx| tx.data.clone()).collect(),
        })
    }
}

/// Serialize the coinbase transaction split around the extranonce gap.
///
/// The miner (and the validator) rebuilds it as
/// `coinb1 ‖ extranonce1 ‖ extranonce2 ‖ coinb2`.
fn build_coinbase_halves(
    height: u64,
    value_sats: u64,
    output_script: &[u8],
    tag: &[u8],
    extranonce2_size: usize,
) -> (Vec<u8>, Vec<u8>) {
    let height_push = bip34_height_push(height);
    let script_sig_len = height_push.len() + EXTRANONCE1_SIZE + extranonce2_size + tag.len();

    // coinb1: everything up to (not including) extranonce1.
    let mut coinb1 = Vec::with_capacity(64);
    coinb1.extend_from_slice(&1u32.to_le_bytes()); // tx version
    coinb1.push(0x01); // input count
    coinb1.extend_from_slice(&[0u8; 32]); // null prevout hash
    coinb1.extend_from_slice(&[0xff; 4]); // prevout index
    coinb1.push(script_sig_len as u8);
    coinb1.extend_from_slice(&height_push);

    // coinb2: everything after extranonce2.
    let mut coinb2 = Vec::with_capacity(64 + output_script.len());
    coinb2.extend_from_slice(tag);
    coinb2.extend_from_slice(&[0xff; 4]); // sequence
    coinb2.push(0x01); // output count
    coinb2.extend_from_slice(&value_sats.to_le_bytes());
    coinb2.push(output_script.len() as u8);
    coinb2.extend_from_slice(output_script);
    coinb2.extend_from_slice(&[0u8; 4]); // lock time

    (coinb1, coinb2)
}

/// BIP34 height serialization for the coinbase scriptSig.
fn bip34_height_push(height: u64) -> Vec<u8> {
    if height < 17 {
        vec![height as u8]
    } else if height < 128 {
        vec![1, height as u8]
    } else if height < 32_768 {
        let mut v = vec![2];
        v.extend_from_slice(&(height as u16).to_le_bytes());
        v
    } else {
        let mut v = vec![4];
        v.extend_from_slice(&(height as u32).to_le_bytes());
        v
    }
}

/// Merkle branch for the coinbase (leaf index 0) over the template txids.
///
/// Per level: record the sibling adjacent to the coinbase position, pair the
/// remaining nodes (duplicating the last on odd counts), repeat until the
/// tree collapses. Validation folds the branch upward from the coinbase hash.
fn merkle_branch(txids_le: &[Hash256]) -> Vec<Hash256> {
    let mut branch = Vec::new();
    let mut level: Vec<Hash256> = txids_le.to_vec();
    while !level.is_empty() {
        // `level` excludes the coinbase-side slot, so the full width is
        // level.len() + 1; pad to an even width.
        if (level.len() + 1) % 2 == 1 {
            let last = *level.last().unwrap();
            level.push(last);
        }
        branch.push(level[0]);
        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level[1..].chunks(2) {
            let mut concat = Vec::with_capacity(64);
            concat.extend_from_slice(&pair[0]);
            concat.extend_from_slice(&pair[1]);
            next.push(double_sha256(&concat));
        }
        level = next;
    }
    branch
}

// ─── Job Store ───────────────────────────────────────────────────────

/// Outcome of resolving a submitted job id.
#[derive(Debug, Clone)]
pub enum JobLookup {
    Current(Arc<Job>),
    /// The immediately-previous job, still inside the grace window.
    Graced(Arc<Job>),
    Stale,
}

struct StoreInner {
    current: Option<Arc<Job>>,
    previous: Option<(Arc<Job>, Instant)>,
}

/// Holder of the current job plus the graced previous one.
///
/// Publication is snapshot-style: a job is fully built before it becomes
/// visible, and readers only ever see complete jobs.
pub struct JobStore {
    grace: Duration,
    inner: RwLock<StoreInner>,
}

impl JobStore {
    pub fn new(grace: Duration) -> Self {
        JobStore { grace, inner: RwLock::new(StoreInner { current: None, previous: None }) }
    }

    /// Make `job` the current job; the old current becomes the graced
    /// previous job from this instant.
    pub async fn publish(&self, job: Arc<Job>) {
        let mut inner = self.inner.write().await;
        if let Some(old) = inner.current.take() {
            inner.previous = Some((old, Instant::now()));
        }
        inner.current = Some(job);
    }

    pub async fn current(&self) -> Option<Arc<Job>> {
        self.inner.read().await.current.clone()
    }

    pub async fn lookup(&self, job_id: u64) -> JobLookup {
        let inner = self.inner.read().await;
        if let Some(current) = &inner.current {
            if current.id == job_id {
                return JobLookup::Current(current.clone());
            }
        }
        if let Some((previous, superseded_at)) = &inner.previous {
            if previous.id == job_id && superseded_at.elapsed() <= self.grace {
                return JobLookup::Graced(previous.clone());
            }
        }
        JobLookup::Stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_template(height: u64) -> Template {
        Template {
            version: 0x2000_0000,
            previousblockhash: "00000000000000000001529600000000000000000000000000000000000000aa"
                .to_string(),
            height,
            coinbasevalue: 312_500_000,
            bits: "207fffff".to_string(),
            target: None,
            curtime: 1_700_000_000,
            mintime: Some(1_699_999_000),
            transactions: Vec::new(),
        }
    }

    fn test_policy() -> JobPolicy {
        JobPolicy {
            coinbase_script: hex::decode(format!("76a914{}88ac", "00".repeat(20))).unwrap(),
            coinbase_tag: b"/solopool/".to_vec(),
            extranonce2_size: 4,
        }
    }

    #[test]
    fn test_job_ids_strictly_increase() {
        let mut builder = JobBuilder::new(test_policy());
        let a = builder.build(&test_template(100), true).unwrap();
        let b = builder.build(&test_template(101), true).unwrap();
        let c = builder.build(&test_template(101), true).unwrap();
        assert!(a.id < b.id && b.id < c.id);
    }

    #[test]
    fn test_non_advancing_height_rejected_without_clean() {
        let mut builder = JobBuilder::new(test_policy());
        builder.build(&test_template(100), true).unwrap();
        match builder.build(&test_template(100), false) {
            Err(BuildError::StaleTemplate { height: 100, last: 100 }) => {}
            other => panic!("expected stale template, got {:?}", other.map(|j| j.id)),
        }
        // Advancing height passes without the clean flag.
        assert!(builder.build(&test_template(101), false).is_ok());
    }

    #[test]
    fn test_missing_fields_rejected() {
        let mut builder = JobBuilder::new(test_policy());
        let mut t = test_template(100);
        t.bits = "zzzz".to_string();
        assert!(matches!(builder.build(&t, true), Err(BuildError::MissingField("bits"))));

        let mut t = test_template(100);
        t.previousblockhash = "abcd".to_string();
        assert!(matches!(
            builder.build(&t, true),
            Err(BuildError::MissingField("previousblockhash"))
        ));

        let mut t = test_template(100);
        t.coinbasevalue = 0;
        assert!(matches!(
            builder.build(&t, true),
            Err(BuildError::MissingField("coinbasevalue"))
        ));
    }

    #[test]
    fn test_job_id_wrap_boundary() {
        let mut builder = JobBuilder::new(test_policy());
        builder.last_id = u64::MAX;
        let job = builder.build(&test_template(100), true).unwrap();
        assert_eq!(job.id, 0);
    }

    #[test]
    fn test_coinbase_halves_reassemble_consistently() {
        let policy = test_policy();
        let mut builder = JobBuilder::new(policy.clone());
        let job = builder.build(&test_template(850_000), true).unwrap();

        let en1 = [0xaa, 0xbb, 0xcc, 0xdd];
        let en2 = [0x01, 0x02, 0x03, 0x04];
        let coinbase = job.assemble_coinbase(&en1, &en2);

        // version | in-count | null prevout | index
        assert_eq!(&coinbase[0..4], &1u32.to_le_bytes());
        assert_eq!(coinbase[4], 0x01);
        assert_eq!(&coinbase[5..37], &[0u8; 32]);
        assert_eq!(&coinbase[37..41], &[0xff; 4]);

        // scriptSig length covers the height push, both extranonces, and tag
        let script_len = coinbase[41] as usize;
        let height_push_len = 1 + 4; // 0x04 marker + u32 for height 850_000
        assert_eq!(script_len, height_push_len + 4 + 4 + policy.coinbase_tag.len());

        // extranonces land exactly inside the scriptSig gap
        let gap_start = 42 + height_push_len;
        assert_eq!(&coinbase[gap_start..gap_start + 4], &en1);
        assert_eq!(&coinbase[gap_start + 4..gap_start + 8], &en2);

        // output value and script round-trip
        let after_script = 42 + script_len;
        let value_at = after_script + 4 + 1; // sequence + out-count
        assert_eq!(
            &coinbase[value_at..value_at + 8],
            &312_500_000u64.to_le_bytes()
        );
        let out_script_len = coinbase[value_at + 8] as usize;
        assert_eq!(out_script_len, policy.coinbase_script.len());
        // trailing lock time
        assert_eq!(&coinbase[coinbase.len() - 4..], &[0u8; 4]);
    }

    // Reference tree: full bottom-up merkle over [coinbase, txids...].
    fn reference_root(coinbase_hash: Hash256, txids: &[Hash256]) -> Hash256 {
        let mut level = vec![coinbase_hash];
        level.extend_from_slice(txids);
        while level.len() > 1 {
            if level.len() % 2 == 1 {
                let last = *level.last().unwrap();
                level.push(last);
            }
            level = level
                .chunks(2)
                .map(|pair| {
                    let mut concat = Vec::with_capacity(64);
                    concat.extend_from_slice(&pair[0]);
                    concat.extend_from_slice(&pair[1]);
                    double_sha256(&concat)
                })
                .collect();
        }
        level[0]
    }

    #[test]
    fn test_merkle_branch_folds_to_tree_root() {
        let coinbase_hash = double_sha256(b"coinbase");
        for n in 0..6usize {
            let txids: Vec<Hash256> =
                (0..n).map(|i| double_sha256(&[i as u8])).collect();
            let branch = merkle_branch(&txids);

            let mut root = coinbase_hash;
            for sibling in &branch {
                let mut concat = Vec::with_capacity(64);
                concat.extend_from_slice(&root);
                concat.extend_from_slice(sibling);
                root = double_sha256(&concat);
            }
            assert_eq!(root, reference_root(coinbase_hash, &txids), "n = {}", n);
        }
    }

    #[test]
    fn test_empty_branch_root_is_coinbase_hash() {
        assert!(merkle_branch(&[]).is_empty());
    }

    #[test]
    fn test_stratum_prev_hash_word_swap() {
        // Display hex → internal order → word-swapped wire form, and the
        // word-swap is its own inverse.
        let display = "000000000000000000015296bc96391d0d67f4a301f2d4fc6db962c16b6455fd";
        let mut le: Hash256 = [0; 32];
        le.copy_from_slice(&hex::decode(display).unwrap());
        le.reverse();
        let wire = stratum_prev_hash(&le);
        assert_eq!(
            wire,
            "6b6455fd6db962c101f2d4fc0d67f4a3bc96391d000152960000000000000000"
        );
    }

    #[tokio::test]
    async fn test_store_lookup_current_graced_stale() {
        let store = JobStore::new(Duration::from_secs(60));
        let mut builder = JobBuilder::new(test_policy());
        let a = Arc::new(builder.build(&test_template(100), true).unwrap());
        let b = Arc::new(builder.build(&test_template(101), true).unwrap());

        store.publish(a.clone()).await;
        assert!(matches!(store.lookup(a.id).await, JobLookup::Current(_)));

        store.publish(b.clone()).await;
        assert!(matches!(store.lookup(b.id).await, JobLookup::Current(_)));
        assert!(matches!(store.lookup(a.id).await, JobLookup::Graced(_)));
        assert!(matches!(store.lookup(999).await, JobLookup::Stale));
    }

    #[tokio::test]
    async fn test_store_grace_window_expires() {
        let store = JobStore::new(Duration::ZERO);
        let mut builder = JobBuilder::new(test_policy());
        let a = Arc::new(builder.build(&test_template(100), true).unwrap());
        let b = Arc::new(builder.build(&test_template(101), true).unwrap());
        store.publish(a.clone()).await;
        store.publish(b).await;
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(store.lookup(a.id).await, JobLookup::Stale));
    }
}
