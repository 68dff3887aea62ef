//! HTTP convenience API: getwork, share submission, and stats as REST.
//!
//! Deliberately minimal plumbing: request line + headers + Content-Length
//! body over a plain TCP stream, JSON in and out. Consumes core state
//! read-only except for the share-accounting path, which goes through the
//! same ledger the Stratum sessions use.

use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::stratum::session::SessionCtx;
use crate::stratum::valid_miner_identity;

/// Keeps the per-identity duplicate-nonce set from growing without bound.
const MAX_TRACKED_NONCES: usize = 65_536;

struct ApiState {
    ctx: Arc<SessionCtx>,
    seen_nonces: tokio::sync::Mutex<HashSet<(String, u64)>>,
}

pub async fn start_api_server(ctx: Arc<SessionCtx>, port: u16) {
    let addr = format!("0.0.0.0:{}", port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("❌ API server failed to bind {}: {}", addr, e);
            return;
        }
    };
    tracing::info!("🌐 HTTP API on http://{}", addr);
    serve(listener, ctx).await;
}

async fn serve(listener: TcpListener, ctx: Arc<SessionCtx>) {
    let state = Arc::new(ApiState { ctx, seen_nonces: tokio::sync::Mutex::new(HashSet::new()) });
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    handle_http(stream, state).await;
                });
            }
            Err(e) => tracing::error!("API accept error: {}", e),
        }
    }
}

async fn handle_http(mut stream: TcpStream, state: Arc<ApiState>) {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await.is_err() {
        return;
    }
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else { return };
    let (path, query) = split_target(target);
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    // Drain headers, remembering the body length.
    let mut content_length: usize = 0;
    loop {
        let mut header_line = String::new();
        if reader.read_line(&mut header_line).await.is_err() {
            return;
        }
        let trimmed = header_line.trim();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }
    let mut body = vec![0u8; content_length.min(1 << 20)];
    if !body.is_empty() && reader.read_exact(&mut body).await.is_err() {
        return;
    }

    let (status, reason, payload) = match (method, segments.as_slice()) {
        ("GET", ["getwork", address]) => get_work(&state, address, &query).await,
        ("POST", ["submit", address]) => submit_share(&state, address, &body).await,
        ("GET", ["stats", address]) => miner_stats(&state, address, &query).await,
        _ => (404, "Not Found", json!({ "error": "Unknown endpoint" })),
    };
    let _ = respond(&mut writer, status, reason, &payload).await;
}

fn split_target(target: &str) -> (String, Vec<(String, String)>) {
    match target.split_once('?') {
        Some((path, query)) => {
            let pairs = query
                .split('&')
                .filter_map(|pair| {
                    let (key, value) = pair.split_once('=')?;
                    Some((key.to_string(), value.to_string()))
                })
                .collect();
            (path.to_string(), pairs)
        }
        None => (target.to_string(), Vec::new()),
    }
}

fn query_param<'a>(query: &'a [(String, String)], key: &str) -> Option<&'a str> {
    query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

async fn respond(
    writer: &mut (impl AsyncWriteExt + Unpin),
    status: u16,
    reason: &str,
    payload: &Value,
) -> std::io::Result<()> {
    let body = payload.to_string();
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nAccess-Control-Allow-Origin: *\r\nContent-Length: {}\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    writer.write_all(response.as_bytes()).await
}

// ─── Handlers ────────────────────────────────────────────────────────

type ApiReply = (u16, &'static str, Value);

fn check_access(state: &ApiState, address: &str, password: Option<&str>) -> Option<ApiReply> {
    if password != Some(state.ctx.settings.join_password.as_str()) {
        return Some((401, "Unauthorized", json!({ "error": "Invalid password" })));
    }
    if !valid_miner_identity(address) {
        return Some((400, "Bad Request", json!({ "error": "Invalid Bitcoin address" })));
    }
    None
}

/// The caller's live session difficulty when one exists, the pool default
/// otherwise.
async fn difficulty_for(state: &ApiState, address: &str) -> f64 {
    state
        .ctx
        .registry
        .find(address)
        .await
        .first()
        .map(|s| s.difficulty)
        .unwrap_or(state.ctx.settings.start_difficulty)
}

async fn get_work(state: &ApiState, address: &str, query: &[(String, String)]) -> ApiReply {
    if let Some(denied) = check_access(state, address, query_param(query, "password")) {
        return denied;
    }
    let Some(job) = state.ctx.jobs.current().await else {
        return (503, "Service Unavailable", json!({ "error": "No current job" }));
    };
    let difficulty = difficulty_for(state, address).await;
    let work = json!({
        "job_id": job.id_hex(),
        "version": job.version,
        "previousblockhash": job.prev_hash,
        "time": job.ntime,
        "bits": format!("{:08x}", job.nbits),
        "height": job.height,
        "target": hex::encode(job.network_target.to_be_bytes()),
        "difficulty": difficulty,
        "share_target": hex::encode(crate::pow::Target::from_difficulty(difficulty).to_be_bytes()),
        "coinb1": job.coinb1,
        "coinb2": job.coinb2,
        "merkle_branch": job.merkle_branch,
        "extranonce2_size": job.extranonce2_size,
        "transactions": job.raw_transactions,
    });
    (200, "OK", work)
}

async fn submit_share(state: &ApiState, address: &str, body: &[u8]) -> ApiReply {
    let Ok(payload) = serde_json::from_slice::<Value>(body) else {
        return (400, "Bad Request", json!({ "error": "Invalid JSON body" }));
    };
    if let Some(denied) = check_access(state, address, payload["password"].as_str()) {
        return denied;
    }
    let nonce = match &payload["nonce"] {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse::<u64>().ok().or_else(|| u64::from_str_radix(s, 16).ok()),
        _ => None,
    };
    let Some(nonce) = nonce else {
        return (400, "Bad Request", json!({ "error": "Missing nonce" }));
    };
    if state.ctx.jobs.current().await.is_none() {
        return (503, "Service Unavailable", json!({ "error": "No current job" }));
    }

    {
        let mut seen = state.seen_nonces.lock().await;
        if seen.len() >= MAX_TRACKED_NONCES {
            seen.clear();
        }
        if !seen.insert((address.to_string(), nonce)) {
            return (400, "Bad Request", json!({ "error": "Duplicate share" }));
        }
    }

    let difficulty = difficulty_for(state, address).await;
    match state.ctx.ledger.apply_share(address, difficulty).await {
        Ok(total) => (200, "OK", json!({ "result": "Share accepted", "shares": total })),
        Err(e) => {
            tracing::error!("💾 HTTP share from {} not recorded: {}", address, e);
            (500, "Internal Server Error", json!({ "error": "Share not recorded" }))
        }
    }
}

async fn miner_stats(state: &ApiState, address: &str, query: &[(String, String)]) -> ApiReply {
    if let Some(denied) = check_access(state, address, query_param(query, "password")) {
        return denied;
    }
    let Some(stats) = state.ctx.ledger.stats(address).await else {
        return (404, "Not Found", json!({ "error": "Miner not found" }));
    };
    let sessions = state.ctx.registry.find(address).await;
    let mut payload = serde_json::to_value(&stats).unwrap_or_else(|_| json!({}));
    payload["active_sessions"] = json!(sessions.len());
    (200, "OK", payload)
}
