//! Blockchain node boundary: template fetch, block submission, payouts.
//!
//! The pool talks to the node through this narrow surface only. With no RPC
//! url configured the built-in test node takes over, handing out a
//! regtest-style template so the rest of the pool can be exercised without a
//! running daemon.

use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::PoolSettings;
use crate::job::Template;

#[derive(Debug)]
pub enum NodeError {
    /// The node could not serve the request; callers keep their previous
    /// state and retry later.
    Unavailable(String),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::Unavailable(e) => write!(f, "node unavailable: {}", e),
        }
    }
}

impl std::error::Error for NodeError {}

#[derive(Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected(String),
}

// ─── Client ──────────────────────────────────────────────────────────

pub enum NodeClient {
    Bitcoind(BitcoindRpc),
    Test(TestNode),
}

impl NodeClient {
    pub fn from_settings(settings: &PoolSettings) -> Self {
        match &settings.rpc_url {
            Some(url) => NodeClient::Bitcoind(BitcoindRpc::new(
                url.clone(),
                settings.rpc_user.clone(),
                settings.rpc_password.clone(),
            )),
            None => {
                tracing::warn!("⚠️  No rpc_url configured, running in test mode without a node");
                NodeClient::Test(TestNode)
            }
        }
    }

    pub fn is_test(&self) -> bool {
        matches!(self, NodeClient::Test(_))
    }

    pub async fn get_template(&self) -> Result<Template, NodeError> {
        match self {
            NodeClient::Bitcoind(rpc) => rpc.get_template().await,
            NodeClient::Test(node) => Ok(node.template()),
        }
    }

    pub async fn submit_block(&self, block_hex: &str) -> Result<SubmitOutcome, NodeError> {
        match self {
            NodeClient::Bitcoind(rpc) => rpc.submit_block(block_hex).await,
            NodeClient::Test(_) => {
                tracing::info!("🧪 Test mode: block of {} bytes accepted locally", block_hex.len() / 2);
                Ok(SubmitOutcome::Accepted)
            }
        }
    }

    /// Disburse a payout. Returns the transaction id.
    pub async fn send_to_address(&self, address: &str, amount_sats: u64) -> Result<String, NodeError> {
        match self {
            NodeClient::Bitcoind(rpc) => rpc.send_to_address(address, amount_sats).await,
            NodeClient::Test(_) => {
                tracing::info!("🧪 Test mode: would pay {} sats to {}", amount_sats, address);
                Ok("test_txid".to_string())
            }
        }
    }
}

// ─── Bitcoind JSON-RPC ───────────────────────────────────────────────

/// Thin JSON-RPC 1.0 wrapper around a bitcoind endpoint.
pub struct BitcoindRpc {
    url: String,
    user: String,
    password: String,
    client: reqwest::Client,
}

impl BitcoindRpc {
    pub fn new(url: String, user: String, password: String) -> Self {
        BitcoindRpc { url, user, password, client: reqwest::Client::new() }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, NodeError> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "solopool",
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| NodeError::Unavailable(format!("{}: {}", method, e)))?;
        let envelope: Value = response
            .json()
            .await
            .map_err(|e| NodeError::Unavailable(format!("{}: bad response: {}", method, e)))?;
        if !envelope["error"].is_null() {
            return Err(NodeError::Unavailable(format!("{}: {}", method, envelope["error"])));
        }
        Ok(envelope["result"].clone())
    }

    pub async fn get_template(&self) -> Result<Template, NodeError> {
        let result = self
            .call(
                "getblocktemplate",
                json!([{
                    "rules": ["segwit"],
                    "capabilities": ["coinbasetxn", "workid", "coinbase/append"],
                }]),
            )
            .await?;
        serde_json::from_value(result)
            .map_err(|e| NodeError::Unavailable(format!("template decode: {}", e)))
    }

    pub async fn submit_block(&self, block_hex: &str) -> Result<SubmitOutcome, NodeError> {
        let result = self.call("submitblock", json!([block_hex])).await?;
        // submitblock returns null on acceptance, a reason string otherwise.
        match result {
            Value::Null => Ok(SubmitOutcome::Accepted),
            Value::String(reason) => Ok(SubmitOutcome::Rejected(reason)),
            other => Ok(SubmitOutcome::Rejected(other.to_string())),
        }
    }

    pub async fn send_to_address(&self, address: &str, amount_sats: u64) -> Result<String, NodeError> {
        let btc = amount_sats as f64 / 100_000_000.0;
        let result = self.call("sendtoaddress", json!([address, btc])).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| NodeError::Unavailable("sendtoaddress: no txid".to_string()))
    }
}

// ─── Test node ───────────────────────────────────────────────────────

/// Stand-in template source used when no node is configured.
pub struct TestNode;

impl TestNode {
    fn template(&self) -> Template {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as u32;
        Template {
            version: 0x2000_0000,
            previousblockhash: "0".repeat(64),
            height: 1,
            coinbasevalue: 625_000_000,
            bits: "207fffff".to_string(),
            target: None,
            curtime: now,
            mintime: Some(now.saturating_sub(3600)),
            transactions: Vec::new(),
        }
    }
}
