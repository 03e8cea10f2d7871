use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use breakout_engine::execution::SimulatedVenue;
use breakout_engine::session::SnapshotStore;
use breakout_engine::trading_core::{PivotLevel, Tick};
use breakout_engine::{Clock, EngineConfig, TradingEngine};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "breakout-engine")]
#[command(about = "Pivot breakout decision engine")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Engine config (JSON); defaults apply for anything missing
    #[arg(short, long, global = true, env = "BREAKOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Snapshot directory, overrides the config file
    #[arg(long, global = true, env = "BREAKOUT_STATE_DIR")]
    state_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Trade NDJSON ticks from stdin against the simulated venue
    Run {
        /// Pivot levels (JSON array)
        #[arg(short, long, env = "BREAKOUT_PIVOTS")]
        pivots: PathBuf,

        /// Session date (YYYY-MM-DD), defaults to today in the configured timezone
        #[arg(short = 'D', long)]
        date: Option<NaiveDate>,

        /// Drive bar closes from tick timestamps instead of the wall clock
        #[arg(long)]
        replay: bool,

        /// Account value used for sizing
        #[arg(long, env = "BREAKOUT_ACCOUNT_VALUE")]
        account_value: Option<f64>,

        /// Fraction of the account risked per trade
        #[arg(long, env = "BREAKOUT_RISK_FRACTION")]
        risk_fraction: Option<f64>,
    },

    /// Print the latest snapshot for a session
    Inspect {
        /// Session date (YYYY-MM-DD), defaults to today in the configured timezone
        #[arg(short = 'D', long)]
        date: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("breakout_engine=info")))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = args.state_dir {
        config.snapshot.dir = dir;
    }

    match args.command {
        Commands::Run {
            pivots,
            date,
            replay,
            account_value,
            risk_fraction,
        } => {
            if let Some(value) = account_value {
                config.risk.account_value = value;
            }
            if let Some(fraction) = risk_fraction {
                config.risk.risk_fraction = fraction;
            }
            let clock = if replay { Clock::Feed } else { Clock::Wall };
            run(config, &pivots, date, clock).await?;
        }
        Commands::Inspect { date } => {
            inspect(&config, date)?;
        }
    }

    Ok(())
}

fn session_date(config: &EngineConfig, date: Option<NaiveDate>) -> NaiveDate {
    date.unwrap_or_else(|| Utc::now().with_timezone(&config.risk.timezone).date_naive())
}

fn load_pivots(path: &Path) -> Result<Vec<PivotLevel>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read pivots {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse pivots {}", path.display()))
}

async fn run(config: EngineConfig, pivots_path: &Path, date: Option<NaiveDate>, clock: Clock) -> Result<()> {
    let pivots = load_pivots(pivots_path)?;
    let date = session_date(&config, date);
    info!("Starting breakout engine for {} with {} pivots", date, pivots.len());
    info!("Snapshots: {}", config.snapshot.dir.display());

    let mut engine = TradingEngine::new(config, pivots, SimulatedVenue::new(), date);
    engine.recover(Utc::now()).await;

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!("EVENT: {:?}", event),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("Event log lagged by {} events", n),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let (tx, rx) = mpsc::channel::<Tick>(10_000);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut line_no = 0u64;
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    error!("Tick input error: {}", e);
                    break;
                }
            };
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Tick>(&line) {
                Ok(tick) => {
                    if tx.send(tick).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Skipping tick line {}: {}", line_no, e),
            }
        }
        info!("Tick input closed after {} lines", line_no);
    });

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };
    engine.run(rx, clock, shutdown).await
}

fn inspect(config: &EngineConfig, date: Option<NaiveDate>) -> Result<()> {
    let date = session_date(config, date);
    let store = SnapshotStore::new(config.snapshot.dir.clone());
    let Some(snapshot) = store.load_latest(date) else {
        info!("No snapshot for {} in {}", date, store.dir().display());
        return Ok(());
    };

    println!("Session {} | saved {}", snapshot.session_date, snapshot.saved_at);
    println!(
        "Realized: {:+.2} | Trades: {} ({}W/{}L){}",
        snapshot.daily.realized_pnl,
        snapshot.daily.trade_count,
        snapshot.daily.wins,
        snapshot.daily.losses,
        snapshot
            .daily
            .halted
            .as_ref()
            .map(|r| format!(" | HALTED: {r}"))
            .unwrap_or_default()
    );
    for instrument in &snapshot.instruments {
        println!("  {} {} | next bar {} | {:?}", instrument.symbol, instrument.pivot, instrument.next_seq, instrument.state);
    }
    for position in &snapshot.positions {
        println!(
            "  POSITION {} {} {} @ {:.2} | Stop: {:.2}{}",
            position.symbol,
            position.direction,
            position.remaining_shares,
            position.entry_price,
            position.stop_price,
            if position.metadata_light { " (reconstructed)" } else { "" }
        );
    }
    for record in &snapshot.attempts {
        println!("  ATTEMPTS {} = {}", record.key, record.entries);
    }
    Ok(())
}
