//! Stratum TCP server: line-delimited JSON-RPC, conventional method names.
//!
//! One task per connection. Each connection loop selects between the job
//! broadcast and socket reads (with the idle timeout), so a slow or closing
//! session never delays anyone else. Message shapes mirror what standard
//! miner firmware expects:
//!
//!   request:  {"id": 1, "method": "mining.subscribe", "params": [...]}
//!   response: {"id": 1, "result": ..., "error": null | [code, msg, null]}

pub mod registry;
pub mod session;

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};

use self::session::{Session, SessionCtx};

// Conventional Stratum reject codes.
pub const ERR_OTHER: i64 = 20;
pub const ERR_STALE_JOB: i64 = 21;
pub const ERR_DUPLICATE: i64 = 22;
pub const ERR_LOW_DIFFICULTY: i64 = 23;
pub const ERR_UNAUTHORIZED_WORKER: i64 = 24;
pub const ERR_NOT_SUBSCRIBED: i64 = 25;

// ─── Wire shapes ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StratumRequest {
    /// Echoed back verbatim; null for notifications.
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

pub fn ok_response(id: Option<Value>, result: Value) -> Value {
    json!({ "id": id, "result": result, "error": null })
}

/// Protocol-level error (unknown method, bad params).
pub fn err_response(id: Option<Value>, code: i64, message: &str) -> Value {
    json!({ "id": id, "result": null, "error": [code, message, null] })
}

/// Share or authorization rejection: `result: false` plus a reason.
pub fn reject_response(id: Option<Value>, code: i64, message: &str) -> Value {
    json!({ "id": id, "result": false, "error": [code, message, null] })
}

pub fn notification(method: &str, params: Value) -> Value {
    json!({ "id": null, "method": method, "params": params })
}

/// Shape check for miner identities: mainnet/testnet address forms.
pub fn valid_miner_identity(address: &str) -> bool {
    let rest = if let Some(rest) =
        address.strip_prefix("bc1").or_else(|| address.strip_prefix("tb1"))
    {
        rest
    } else {
        match address.chars().next() {
            Some('1') | Some('3') | Some('m') | Some('n') | Some('2') => &address[1..],
            _ => return false,
        }
    };
    (25..=62).contains(&rest.len())
        && rest.chars().all(|c| c.is_ascii_alphanumeric() && c != 'I' && c != 'O')
}

// ─── Server ──────────────────────────────────────────────────────────

pub async fn start_stratum_server(ctx: Arc<SessionCtx>, port: u16) {
    let addr = format!("0.0.0.0:{}", port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("❌ Stratum server failed to bind {}: {}", addr, e);
            return;
        }
    };
    tracing::info!("⛏️  Stratum server on {}", addr);
    serve(listener, ctx).await;
}

async fn serve(listener: TcpListener, ctx: Arc<SessionCtx>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let ctx = ctx.clone();
                let peer = peer.to_string();
                tokio::spawn(async move {
                    handle_miner(stream, peer, ctx).await;
                });
            }
            Err(e) => tracing::error!("Stratum accept error: {}", e),
        }
    }
}

async fn handle_miner(stream: TcpStream, peer: String, ctx: Arc<SessionCtx>) {
    let _ = stream.set_nodelay(true);
    tracing::info!("📱 Miner connected from {}", peer);

    let seat = ctx.registry.register(&peer, ctx.settings.start_difficulty).await;
    let session_id = seat.session_id;
    let mut job_rx = seat.job_rx;
    let mut session =
        Session::new(session_id, peer.clone(), seat.extranonce1, seat.shared, &ctx.settings);

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let idle = Duration::from_secs(ctx.settings.idle_timeout_secs);

    'conn: loop {
        tokio::select! {
            job = job_rx.recv() => match job {
                Ok(job) => {
                    for msg in session.on_job(&job) {
                        if write_line(&mut writer, &msg).await.is_err() {
                            break 'conn;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Fell behind the fan-out: resynchronize on the newest
                    // job rather than replaying the backlog out of order.
                    tracing::debug!("Session {} lagged {} jobs, resyncing", session_id, skipped);
                    if let Some(job) = ctx.jobs.current().await {
                        for msg in session.on_job(&job) {
                            if write_line(&mut writer, &msg).await.is_err() {
                                break 'conn;
                            }
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break 'conn,
            },

            line = timeout(idle, lines.next_line()) => match line {
                Ok(Ok(Some(line))) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    for msg in session.handle_line(&line, &ctx).await {
                        if write_line(&mut writer, &msg).await.is_err() {
                            break 'conn;
                        }
                    }
                    if session.is_closed() {
                        break 'conn;
                    }
                }
                Ok(Ok(None)) => break 'conn,
                Ok(Err(e)) => {
                    tracing::debug!("Session {} read error: {}", session_id, e);
                    break 'conn;
                }
                Err(_) => {
                    tracing::debug!("Session {} idle timeout", session_id);
                    break 'conn;
                }
            },
        }
    }

    session.close();
    ctx.registry.unregister(session_id).await;
    match session.miner() {
        Some(miner) => tracing::info!("🔌 Miner {} ({}) disconnected", miner, peer),
        None => tracing::info!("🔌 Miner {} disconnected", peer),
    }
}

async fn write_line(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    msg: &Value,
) -> std::io::Result<()> {
    let mut line = msg.to_string();
    line.push('\n');
    writer.write_all(line.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolSettings;
    use crate::job::{JobBuilder, JobPolicy, JobStore, Template};
    use crate::ledger::Ledger;
    use super::registry::SessionRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_response_wire_shapes() {
        let ok = ok_response(Some(json!(7)), json!(true));
        assert_eq!(ok.to_string(), r#"{"error":null,"id":7,"result":true}"#);

        let err = err_response(Some(json!(7)), ERR_OTHER, "Method not found");
        assert_eq!(err["error"], json!([20, "Method not found", null]));
        assert!(err["result"].is_null());

        let reject = reject_response(None, ERR_LOW_DIFFICULTY, "Low difficulty share");
        assert_eq!(reject["result"], json!(false));
        assert_eq!(reject["error"][0], json!(23));
        assert!(reject["id"].is_null());

        let notify = notification("mining.set_difficulty", json!([8192.0]));
        assert!(notify["id"].is_null());
        assert_eq!(notify["method"], "mining.set_difficulty");
    }

    #[test]
    fn test_request_parsing_with_and_without_id() {
        let req: StratumRequest =
            serde_json::from_str(r#"{"id":3,"method":"mining.subscribe","params":[]}"#).unwrap();
        assert_eq!(req.id, Some(json!(3)));
        assert_eq!(req.method, "mining.subscribe");

        // A null id deserializes to None and echoes back as null.
        let req: StratumRequest =
            serde_json::from_str(r#"{"id":null,"method":"mining.notify","params":[]}"#).unwrap();
        assert_eq!(req.id, None);
        assert!(ok_response(req.id, json!(true))["id"].is_null());
    }

    #[test]
    fn test_miner_identity_shapes() {
        assert!(valid_miner_identity("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq"));
        assert!(valid_miner_identity("tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx"));
        assert!(valid_miner_identity("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"));
        assert!(valid_miner_identity("mipcBbFg9gMiCh81Kj8tqqdgoZub1ZJRfn"));

        assert!(!valid_miner_identity(""));
        assert!(!valid_miner_identity("bc1"));
        assert!(!valid_miner_identity("xyzzy"));
        assert!(!valid_miner_identity("4A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"));
        assert!(!valid_miner_identity("1A1zP1eP5QGefi2DMPTfTO5SLmv7DivfNa")); // 'O'
        assert!(!valid_miner_identity("bc1qshort"));
    }

    static DIR_SEQ: AtomicUsize = AtomicUsize::new(0);

    async fn spawn_test_server() -> (std::net::SocketAddr, Arc<SessionCtx>) {
        let mut settings = PoolSettings::default();
        settings.join_password = "pw".to_string();
        let settings = Arc::new(settings);

        let dir = std::env::temp_dir().join(format!(
            "solopool-stratum-{}-{}",
            std::process::id(),
            DIR_SEQ.fetch_add(1, Ordering::SeqCst)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let (candidate_tx, _candidate_rx) = tokio::sync::mpsc::channel(8);
        let ctx = Arc::new(SessionCtx {
            settings: settings.clone(),
            jobs: Arc::new(JobStore::new(Duration::from_secs(10))),
            registry: Arc::new(SessionRegistry::new()),
            ledger: Arc::new(Ledger::open(dir.join("miners.json")).unwrap()),
            candidates: candidate_tx,
        });

        let mut builder = JobBuilder::new(JobPolicy {
            coinbase_script: settings.coinbase_script().unwrap(),
            coinbase_tag: b"/solopool/".to_vec(),
            extranonce2_size: settings.extranonce2_size,
        });
        let template = Template {
            version: 0x2000_0000,
            previousblockhash: "11".repeat(32),
            height: 100,
            coinbasevalue: 312_500_000,
            bits: "207fffff".to_string(),
            target: None,
            curtime: 1_700_000_000,
            mintime: None,
            transactions: Vec::new(),
        };
        ctx.jobs.publish(Arc::new(builder.build(&template, true).unwrap())).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serve_ctx = ctx.clone();
        tokio::spawn(async move { serve(listener, serve_ctx).await });
        (addr, ctx)
    }

    async fn read_json_line<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Value {
        let mut line = String::new();
        timeout(Duration::from_secs(5), reader.read_line(&mut line)).await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_subscribe_authorize_and_job_push() {
        let (addr, ctx) = spawn_test_server().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        writer
            .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[]}\n")
            .await
            .unwrap();
        let response = read_json_line(&mut reader).await;
        assert_eq!(response["id"], json!(1));
        let extranonce1 = response["result"][1].as_str().unwrap();
        assert_eq!(extranonce1.len(), 8);
        assert_eq!(response["result"][2], json!(4));

        writer
            .write_all(
                b"{\"id\":2,\"method\":\"mining.authorize\",\"params\":[\"bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq\",\"pw\"]}\n",
            )
            .await
            .unwrap();
        let auth = read_json_line(&mut reader).await;
        assert_eq!(auth["result"], json!(true));
        let set_difficulty = read_json_line(&mut reader).await;
        assert_eq!(set_difficulty["method"], "mining.set_difficulty");
        let notify = read_json_line(&mut reader).await;
        assert_eq!(notify["method"], "mining.notify");
        let first_job_id = notify["params"][0].as_str().unwrap().to_string();

        // A fresh broadcast reaches the working session.
        let current = ctx.jobs.current().await.unwrap();
        let mut next = (*current).clone();
        next.id += 1;
        let next = Arc::new(next);
        ctx.jobs.publish(next.clone()).await;
        ctx.registry.broadcast(next);
        let pushed = read_json_line(&mut reader).await;
        assert_eq!(pushed["method"], "mining.notify");
        assert_ne!(pushed["params"][0].as_str().unwrap(), first_job_id);
    }

    #[tokio::test]
    async fn test_unknown_method_gets_error_20() {
        let (addr, _ctx) = spawn_test_server().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        writer
            .write_all(b"{\"id\":5,\"method\":\"mining.bogus\",\"params\":[]}\n")
            .await
            .unwrap();
        let response = read_json_line(&mut reader).await;
        assert_eq!(response["error"][0], json!(20));
    }

    #[tokio::test]
    async fn test_connection_closed_after_repeated_garbage() {
        let (addr, ctx) = spawn_test_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        for _ in 0..ctx.settings.max_violations {
            stream.write_all(b"garbage\n").await.unwrap();
        }
        // Server closes; the read eventually returns EOF.
        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(5), stream.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
    }
}
