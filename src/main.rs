//! volley: HTTP load generation from a JSON test plan.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;

use volley::plan::LoadPlan;
use volley::proxy::{self, ProxyStrategy};
use volley::{config, summary, Engine};

/// Shaped HTTP load generation with multi-step scenarios.
#[derive(Parser)]
#[command(name = "volley", version)]
#[command(about = "Issue shaped HTTP load from a JSON test plan", long_about = None)]
struct Cli {
    /// Path to the JSON test plan.
    #[arg(short, long)]
    config: PathBuf,

    /// Per-request debug output (one sequential iteration per tick).
    #[arg(long)]
    debug: bool,

    /// Proxy URL, overriding the plan.
    #[arg(long)]
    proxy: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("volley=info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Plan loading stages payloads with blocking I/O, so it happens
    // before the runtime starts.
    let mut plan = config::load_plan(&cli.config)
        .with_context(|| format!("cannot load plan {}", cli.config.display()))?;
    if cli.debug {
        plan.debug = true;
    }
    if let Some(raw) = &cli.proxy {
        plan.proxy = Some(Url::parse(raw).with_context(|| format!("invalid proxy {raw}"))?);
    }

    if plan.output != "stdout" {
        bail!("unsupported output type: {}", plan.output);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("cannot start runtime")?;
    runtime.block_on(run(plan))
}

async fn run(plan: LoadPlan) -> Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn(handle_ctrl_c(cancel.clone()));

    let pool = proxy::new_pool(
        ProxyStrategy::Single,
        plan.proxy.clone().into_iter().collect(),
    );

    let started = Instant::now();
    let (engine, _snapshots) = Engine::new(plan, pool, cancel)?;
    let state = engine.run().await?;

    println!("{}", summary::render_summary(&state, started.elapsed()));
    Ok(())
}

/// First Ctrl+C drains gracefully through the cancellation token; the
/// second aborts the process.
async fn handle_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    eprintln!("\nreceived Ctrl+C, stopping gracefully...");
    cancel.cancel();

    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    eprintln!("\nreceived second Ctrl+C, aborting.");
    std::process::exit(1);
}
