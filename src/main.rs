use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use solopool::config::PoolSettings;
use solopool::job::{JobBuilder, JobPolicy, JobStore};
use solopool::ledger::Ledger;
use solopool::node::{NodeClient, SubmitOutcome};
use solopool::pow;
use solopool::rpc;
use solopool::stratum::registry::SessionRegistry;
use solopool::stratum::session::{BlockCandidate, SessionCtx};
use solopool::stratum;

#[derive(Parser)]
#[command(name = "solopool", version)]
#[command(about = "SoloPool - a solo Bitcoin mining pool")]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "config.json")]
    config: String,
    /// Override the Stratum listen port
    #[arg(long)]
    stratum_port: Option<u16>,
    /// Override the HTTP API listen port
    #[arg(long)]
    api_port: Option<u16>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("solopool=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = match PoolSettings::load(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    };
    if let Some(port) = cli.stratum_port {
        settings.stratum_port = port;
    }
    if let Some(port) = cli.api_port {
        settings.api_port = port;
    }

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(run_pool(settings));
}

async fn run_pool(settings: PoolSettings) {
    let settings = Arc::new(settings);

    println!("🚀 SoloPool v{}", env!("CARGO_PKG_VERSION"));
    println!("  Stratum:  0.0.0.0:{}", settings.stratum_port);
    println!("  HTTP API: 0.0.0.0:{}", settings.api_port);
    println!("  Ledger:   {}", settings.ledger_path);
    println!(
        "  Fee: {:.1}%  |  Start diff: {}  |  Target share time: {}s",
        settings.pool_fee * 100.0,
        settings.start_difficulty,
        settings.vardiff_target_secs
    );

    // Ledger first: unrecoverable corruption must stop us before we accept
    // any work.
    let ledger = match Ledger::open(&settings.ledger_path) {
        Ok(ledger) => Arc::new(ledger),
        Err(e) => {
            tracing::error!("❌ {}", e);
            std::process::exit(1);
        }
    };

    let node = Arc::new(NodeClient::from_settings(&settings));
    if node.is_test() {
        println!("  Mode:     TEST (no blockchain node configured)");
    }

    let coinbase_script = match settings.coinbase_script() {
        Ok(script) => script,
        Err(e) => {
            tracing::error!("❌ {}", e);
            std::process::exit(1);
        }
    };
    let policy = JobPolicy {
        coinbase_script,
        coinbase_tag: settings.coinbase_tag.clone().into_bytes(),
        extranonce2_size: settings.extranonce2_size,
    };

    let registry = Arc::new(SessionRegistry::new());
    let jobs = Arc::new(JobStore::new(Duration::from_secs(settings.job_grace_secs)));
    let (candidate_tx, candidate_rx) = mpsc::channel::<BlockCandidate>(64);
    let ctx = Arc::new(SessionCtx {
        settings: settings.clone(),
        jobs: jobs.clone(),
        registry: registry.clone(),
        ledger: ledger.clone(),
        candidates: candidate_tx,
    });

    // First job before the listeners open.
    let mut builder = JobBuilder::new(policy);
    let mut last_prev: Option<String> = None;
    match node.get_template().await {
        Ok(template) => {
            last_prev = Some(template.previousblockhash.clone());
            match builder.build(&template, true) {
                Ok(job) => {
                    let job = Arc::new(job);
                    tracing::info!("⛏️  Initial job #{} at height {}", job.id, job.height);
                    jobs.publish(job).await;
                }
                Err(e) => tracing::warn!("⚠️  Initial template rejected: {}", e),
            }
        }
        Err(e) => tracing::warn!("⚠️  No initial template: {} (will keep retrying)", e),
    }

    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = stop.clone();
    ctrlc::set_handler(move || {
        println!("\n🛑 Shutting down gracefully...");
        stop_clone.store(true, Ordering::SeqCst);
    })
    .expect("Ctrl-C");

    // Listeners
    {
        let ctx = ctx.clone();
        let port = settings.stratum_port;
        tokio::spawn(async move { stratum::start_stratum_server(ctx, port).await });
    }
    {
        let ctx = ctx.clone();
        let port = settings.api_port;
        tokio::spawn(async move { rpc::start_api_server(ctx, port).await });
    }

    // Background tasks
    {
        let node = node.clone();
        let jobs = jobs.clone();
        let registry = registry.clone();
        let settings = settings.clone();
        tokio::spawn(async move {
            template_poll_task(node, builder, last_prev, jobs, registry, settings).await
        });
    }
    {
        let node = node.clone();
        let ledger = ledger.clone();
        let settings = settings.clone();
        tokio::spawn(async move { block_submit_task(candidate_rx, node, ledger, settings).await });
    }
    {
        let node = node.clone();
        let ledger = ledger.clone();
        let jobs = jobs.clone();
        let settings = settings.clone();
        tokio::spawn(async move { maturity_payout_task(node, ledger, jobs, settings).await });
    }
    {
        let ledger = ledger.clone();
        let interval = settings.backup_interval_secs;
        tokio::spawn(async move { backup_task(ledger, interval).await });
    }
    {
        let registry = registry.clone();
        let jobs = jobs.clone();
        tokio::spawn(async move { status_task(registry, jobs).await });
    }

    println!("🎯 Pool is ready for miners!");

    // Shutdown watcher: drain and flush, then exit.
    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        if stop.load(Ordering::Relaxed) {
            tracing::info!("💾 Flushing ledger...");
            if let Err(e) = ledger.flush().await {
                tracing::error!("❌ Final ledger flush failed: {}", e);
            }
            tracing::info!("👋 Shutdown complete.");
            tokio::time::sleep(Duration::from_millis(200)).await;
            std::process::exit(0);
        }
    }
}

// ─── Template polling ────────────────────────────────────────────────

async fn template_poll_task(
    node: Arc<NodeClient>,
    mut builder: JobBuilder,
    mut last_prev: Option<String>,
    jobs: Arc<JobStore>,
    registry: Arc<SessionRegistry>,
    settings: Arc<PoolSettings>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(settings.job_refresh_secs));
    interval.tick().await; // the initial fetch already happened
    let mut failures: u32 = 0;
    loop {
        interval.tick().await;
        let template = match node.get_template().await {
            Ok(template) => {
                if failures >= settings.node_alert_failures {
                    tracing::info!("✅ Node recovered after {} failed polls", failures);
                }
                failures = 0;
                template
            }
            Err(e) => {
                // Keep the previous job current; retry next tick, easing off
                // a little more for each consecutive failure.
                failures += 1;
                if failures == settings.node_alert_failures {
                    tracing::error!("🚨 Node unreachable for {} consecutive polls: {}", failures, e);
                } else {
                    tracing::warn!("⚠️  Template fetch failed ({}): {}", failures, e);
                }
                tokio::time::sleep(Duration::from_secs(2 * failures.min(5) as u64)).await;
                continue;
            }
        };

        let new_block = last_prev.as_deref() != Some(template.previousblockhash.as_str());
        last_prev = Some(template.previousblockhash.clone());

        match builder.build(&template, true) {
            Ok(job) => {
                let job = Arc::new(job);
                if new_block {
                    tracing::info!(
                        "⛏️  New job #{}: height={} prev={}…",
                        job.id,
                        job.height,
                        &job.prev_hash[..16.min(job.prev_hash.len())]
                    );
                } else {
                    tracing::debug!("⛏️  Refreshed job #{} at height {}", job.id, job.height);
                }
                jobs.publish(job.clone()).await;
                let delivered = registry.broadcast(job);
                tracing::debug!("📡 Job delivered to {} session(s)", delivered);
            }
            Err(e) => tracing::warn!("⚠️  Template rejected: {}", e),
        }
    }
}

// ─── Block submission ────────────────────────────────────────────────

async fn block_submit_task(
    mut candidates: mpsc::Receiver<BlockCandidate>,
    node: Arc<NodeClient>,
    ledger: Arc<Ledger>,
    settings: Arc<PoolSettings>,
) {
    while let Some(candidate) = candidates.recv().await {
        let block_hex = assemble_block(&candidate);
        let hash = pow::display_hash(&candidate.hash);
        tracing::info!("📤 Submitting block {} ({} bytes)", hash, block_hex.len() / 2);

        match node.submit_block(&block_hex).await {
            Ok(SubmitOutcome::Accepted) => {
                let reward =
                    (candidate.job.coinbase_value as f64 * (1.0 - settings.pool_fee)) as u64;
                match ledger
                    .apply_block_credit(&candidate.miner, candidate.job.height, &hash, reward)
                    .await
                {
                    Ok(true) => tracing::info!(
                        "🎉 Block {} accepted! {} sats credited to {} ({} confirmations to mature)",
                        candidate.job.height,
                        reward,
                        candidate.miner,
                        settings.confirmations_required
                    ),
                    Ok(false) => {
                        tracing::debug!("Credit for height {} already recorded", candidate.job.height)
                    }
                    Err(e) => {
                        tracing::error!("💾 Block credit for {} not recorded: {}", candidate.miner, e)
                    }
                }
            }
            Ok(SubmitOutcome::Rejected(reason)) => {
                tracing::warn!("❌ Block {} rejected by network: {}", hash, reason)
            }
            Err(e) => tracing::error!("❌ Block submission failed: {}", e),
        }
    }
}

/// header ‖ varint(tx count) ‖ coinbase ‖ template transactions.
fn assemble_block(candidate: &BlockCandidate) -> String {
    let mut block = candidate.header.to_vec();
    block.extend_from_slice(&varint(candidate.job.raw_transactions.len() as u64 + 1));
    block.extend_from_slice(&candidate.coinbase);
    let mut block_hex = hex::encode(block);
    for tx in &candidate.job.raw_transactions {
        block_hex.push_str(tx);
    }
    block_hex
}

fn varint(n: u64) -> Vec<u8> {
    if n < 0xfd {
        vec![n as u8]
    } else if n <= 0xffff {
        let mut v = vec![0xfd];
        v.extend_from_slice(&(n as u16).to_le_bytes());
        v
    } else if n <= 0xffff_ffff {
        let mut v = vec![0xfe];
        v.extend_from_slice(&(n as u32).to_le_bytes());
        v
    } else {
        let mut v = vec![0xff];
        v.extend_from_slice(&n.to_le_bytes());
        v
    }
}

// ─── Maturity + payouts ──────────────────────────────────────────────

async fn maturity_payout_task(
    node: Arc<NodeClient>,
    ledger: Arc<Ledger>,
    jobs: Arc<JobStore>,
    settings: Arc<PoolSettings>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(settings.payout_interval_secs));
    interval.tick().await;
    loop {
        interval.tick().await;

        // The current job targets the next block, so the tip is one below.
        let Some(job) = jobs.current().await else { continue };
        let tip = job.height.saturating_sub(1);
        match ledger.confirm_credits(tip, settings.confirmations_required).await {
            Ok(0) => {}
            Ok(n) => tracing::info!("🏦 {} block credit(s) matured at tip {}", n, tip),
            Err(e) => tracing::error!("💾 Maturity sweep failed: {}", e),
        }

        for (address, entry) in ledger.snapshot().await {
            let unpaid = entry.unpaid_sats();
            if unpaid < settings.min_payout_sats {
                continue;
            }
            match node.send_to_address(&address, unpaid).await {
                Ok(txid) => {
                    tracing::info!("💰 Paid {} sats to {} (txid {})", unpaid, address, txid);
                    if let Err(e) = ledger.record_payout(&address, unpaid).await {
                        tracing::error!("💾 Payout for {} not recorded: {}", address, e);
                    }
                }
                Err(e) => tracing::warn!("⚠️  Payout to {} failed: {}", address, e),
            }
        }
    }
}

// ─── Housekeeping ────────────────────────────────────────────────────

async fn backup_task(ledger: Arc<Ledger>, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    interval.tick().await;
    loop {
        interval.tick().await;
        match ledger.flush().await {
            Ok(()) => tracing::debug!("💾 Ledger backup refreshed"),
            Err(e) => tracing::error!("❌ Ledger backup failed: {}", e),
        }
    }
}

async fn status_task(registry: Arc<SessionRegistry>, jobs: Arc<JobStore>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.tick().await;
    loop {
        interval.tick().await;
        let sessions = registry.session_count().await;
        let height = jobs.current().await.map(|j| j.height).unwrap_or(0);
        tracing::info!("⛏️  Pool: {} session(s), serving height {}", sessions, height);
    }
}
