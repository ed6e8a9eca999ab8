//! # Clickgate - click-CAPTCHA operator tool
//!
//! Runs the pregeneration worker and exercises the artifact lifecycle
//! and mask codec from the command line.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use clickgate::captcha::{CaptchaManager, pregeneration_worker};
use clickgate::config::AppConfig;
use clickgate::ledger::PoolLedger;
use clickgate::mask::{self, MaskReader};
use clickgate_common::{ArtifactId, Symbol};

/// Clickgate - click-CAPTCHA pool and mask tool
#[derive(Parser, Debug)]
#[command(name = "clickgate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/clickgate.toml")]
    config: PathBuf,

    /// Pool file name prefix (overrides config)
    #[arg(long, env = "CLICKGATE_PATTERN")]
    pattern: Option<String>,

    /// Ledger file path (overrides config)
    #[arg(long)]
    ledger_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Keep the pool replenished until Ctrl+C
    Pregen,
    /// Issue one live artifact
    Issue,
    /// Verify a click against a live artifact (consumes it)
    Verify { id: String, x: i64, y: i64 },
    /// Convert a solution raster to an RLE mask
    Encode { input: PathBuf, output: PathBuf },
    /// Look up one pixel of an RLE mask
    Check {
        mask: PathBuf,
        x: i64,
        y: i64,
        #[arg(long, value_enum, default_value = "white")]
        expect: Expect,
    },
    /// Print the header and decoded pixels of an RLE mask
    Inspect { mask: PathBuf },
    /// Print the pool index record
    Ledger,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Expect {
    White,
    Black,
}

impl From<Expect> for Symbol {
    fn from(expect: Expect) -> Self {
        match expect {
            Expect::White => Symbol::White,
            Expect::Black => Symbol::Black,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    init_logging(&args.log_level, args.json_logs)?;

    match args.command {
        Command::Encode { ref input, ref output } => {
            let header = mask::convert_image_to_mask(input, output)
                .with_context(|| format!("Failed to convert {}", input.display()))?;
            println!("{}", header.to_line().trim_end());
            return Ok(());
        }
        Command::Check { ref mask, x, y, expect } => {
            let matched = MaskReader::open_and_check(mask, x, y, expect.into())?;
            println!("{matched}");
            return Ok(());
        }
        Command::Inspect { ref mask } => {
            let reader = MaskReader::open(mask)?;
            println!("{}", reader.header().to_line().trim_end());
            let bytes = std::fs::read(mask)
                .with_context(|| format!("Failed to read {}", mask.display()))?;
            let grid = mask::decode(&bytes)?;
            for y in 0..grid.rows() {
                let line: String = grid
                    .row(y)
                    .iter()
                    .map(|s| if *s == Symbol::CLICKABLE { '#' } else { '.' })
                    .collect();
                println!("{line}");
            }
            return Ok(());
        }
        _ => {}
    }

    let mut config = AppConfig::load(&args.config)?;
    if let Some(pattern) = args.pattern {
        config.captcha.pattern = pattern;
    }
    if let Some(ledger_path) = args.ledger_path {
        config.captcha.ledger_path = ledger_path;
    }
    // a one-shot command must not leave a worker cut off mid-cycle
    config.captcha.auto_spawn_worker = false;
    config.validate()?;
    info!("📋 Configuration loaded from {}", args.config.display());

    let manager = CaptchaManager::from_config(&config);

    match args.command {
        Command::Pregen => run_pregen(&manager, config.captcha.watch_delay_secs).await?,
        Command::Issue => {
            let id = manager.get_artifact().await?;
            let output = serde_json::json!({
                "id": id,
                "image": manager.live_image_path(&id),
                "stats": manager.get_stats(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Verify { ref id, x, y } => {
            let id = ArtifactId::parse(id)?;
            let output = match manager.verify(&id, x, y).await {
                Ok(accepted) => serde_json::json!({ "accepted": accepted }),
                Err(e) if e.is_rejection() => {
                    serde_json::json!({ "accepted": false, "reason": e.to_string() })
                }
                Err(e) => return Err(e.into()),
            };
            println!("{output}");
        }
        Command::Ledger => {
            let Some(ledger) = manager.ledger() else {
                bail!("Ledger is disabled in configuration");
            };
            let record = ledger
                .read()
                .with_context(|| format!("Failed to read ledger at {}", ledger.location()))?;
            let output = serde_json::json!({
                "record": record,
                "depth": record.depth(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Encode { .. } | Command::Check { .. } | Command::Inspect { .. } => {}
    }

    Ok(())
}

/// Run the pregeneration worker until Ctrl+C
async fn run_pregen(manager: &CaptchaManager, watch_delay_secs: u64) -> Result<()> {
    let Some(pregen) = manager.pregenerator() else {
        bail!("Ledger is disabled in configuration; nothing to pregenerate");
    };

    info!("🔥 Starting Clickgate pregeneration v{}", env!("CARGO_PKG_VERSION"));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let worker = tokio::spawn(pregeneration_worker(
        Arc::clone(pregen),
        Duration::from_secs(watch_delay_secs),
        shutdown_tx.subscribe(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;
    info!("🛑 Shutdown signal received");
    let _ = shutdown_tx.send(());

    worker.await.context("Pregeneration worker panicked")?;
    info!("👋 Clickgate shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true).with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}
