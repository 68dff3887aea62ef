//! Pool configuration, loaded from a JSON file with serde defaults.

use serde::Deserialize;
use std::path::Path;

/// Runtime settings for the pool. Every field has a default so a partial
/// config file is enough to run against a regtest node.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    // ── Listeners ──
    pub stratum_port: u16,
    pub api_port: u16,

    // ── Blockchain node RPC (absent url = built-in test mode) ──
    pub rpc_url: Option<String>,
    pub rpc_user: String,
    pub rpc_password: String,

    // ── Membership ──
    /// Flat shared secret checked on authorize and on every HTTP call.
    pub join_password: String,

    // ── Economics ──
    /// Fraction of each block reward kept by the pool, 0.0..1.0.
    pub pool_fee: f64,
    pub min_payout_sats: u64,
    pub confirmations_required: u64,

    // ── Difficulty ──
    pub start_difficulty: f64,
    pub min_difficulty: f64,
    pub max_difficulty: f64,
    /// Desired seconds between shares per connection.
    pub vardiff_target_secs: f64,
    /// Evaluate after this many shares, or after `vardiff_eval_secs`,
    /// whichever comes first.
    pub vardiff_min_shares: u32,
    pub vardiff_eval_secs: u64,

    // ── Jobs ──
    pub job_refresh_secs: u64,
    /// How long shares for the immediately-previous job remain acceptable.
    pub job_grace_secs: u64,

    // ── Sessions ──
    pub idle_timeout_secs: u64,
    pub max_violations: u32,
    pub extranonce2_size: usize,

    // ── Coinbase ──
    /// scriptPubKey the coinbase pays to, as hex. Deriving a script from an
    /// address is the payout wallet's concern, so operators paste the script
    /// itself here.
    pub coinbase_script_hex: String,
    pub coinbase_tag: String,

    // ── Persistence / background cadence ──
    pub ledger_path: String,
    pub payout_interval_secs: u64,
    pub backup_interval_secs: u64,
    /// Consecutive template-fetch failures before an operator alert.
    pub node_alert_failures: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            stratum_port: 3333,
            api_port: 5000,
            rpc_url: None,
            rpc_user: String::new(),
            rpc_password: String::new(),
            join_password: String::new(),
            pool_fee: 0.02,
            min_payout_sats: 100_000,
            confirmations_required: 100,
            start_difficulty: 10_000.0,
            min_difficulty: 1_000.0,
            max_difficulty: 100_000_000.0,
            vardiff_target_secs: 30.0,
            vardiff_min_shares: 8,
            vardiff_eval_secs: 120,
            job_refresh_secs: 30,
            job_grace_secs: 10,
            idle_timeout_secs: 300,
            max_violations: 5,
            extranonce2_size: 4,
            // Standard-length P2PKH placeholder; operators must set their own.
            coinbase_script_hex: format!("76a914{}88ac", "00".repeat(20)),
            coinbase_tag: "/solopool/".to_string(),
            ledger_path: "miners.json".to_string(),
            payout_interval_secs: 3600,
            backup_interval_secs: 1800,
            node_alert_failures: 5,
        }
    }
}

impl PoolSettings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        let settings: PoolSettings =
            serde_json::from_str(&json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.pool_fee) {
            return Err(ConfigError::Invalid("pool_fee must be in [0, 1)".into()));
        }
        if self.min_difficulty <= 0.0
            || self.min_difficulty > self.start_difficulty
            || self.start_difficulty > self.max_difficulty
        {
            return Err(ConfigError::Invalid(
                "difficulty bounds must satisfy 0 < min <= start <= max".into(),
            ));
        }
        if self.vardiff_target_secs <= 0.0 {
            return Err(ConfigError::Invalid("vardiff_target_secs must be positive".into()));
        }
        if !(1..=8).contains(&self.extranonce2_size) {
            return Err(ConfigError::Invalid("extranonce2_size must be 1..=8".into()));
        }
        self.coinbase_script()?;
        Ok(())
    }

    /// Decoded coinbase output script.
    pub fn coinbase_script(&self) -> Result<Vec<u8>, ConfigError> {
        let script = hex::decode(&self.coinbase_script_hex)
            .map_err(|e| ConfigError::Invalid(format!("coinbase_script_hex: {}", e)))?;
        if script.is_empty() || script.len() > 0xff {
            return Err(ConfigError::Invalid("coinbase script must be 1..=255 bytes".into()));
        }
        Ok(script)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config read error: {}", e),
            ConfigError::Parse(e) => write!(f, "config parse error: {}", e),
            ConfigError::Invalid(e) => write!(f, "invalid config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
