//! Handreceipt admin tool
//!
//! ## Usage
//!
//! ```bash
//! # Create the data directory, both databases and a default config
//! handreceipt init
//!
//! # Recompute every ledger hash and link
//! handreceipt verify-ledger
//!
//! # Ledger history for one item
//! handreceipt history W123456
//!
//! # Corrections, optionally only those for one original event
//! handreceipt corrections --original 3f0c...
//!
//! # Row counts
//! handreceipt --data-dir /srv/handreceipt stats
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use handreceipt::services::AuditService;
use handreceipt::{Config, HandReceiptDb, Ledger, Repository, SqliteLedger};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "handreceipt")]
#[command(about = "Property accountability registry and audit ledger")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "HANDRECEIPT_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (overrides the config file)
    #[arg(long, env = "HANDRECEIPT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the data directory, databases and a default config
    Init,
    /// Verify the whole ledger hash chain
    VerifyLedger,
    /// Print the ledger history of a property
    History {
        /// Serial number of the property
        serial: String,
    },
    /// List correction events
    Corrections {
        /// Only corrections of this original event id
        #[arg(long)]
        original: Option<String>,
    },
    /// Print registry row counts
    Stats,
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("handreceipt=info".parse()?))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    match args.command {
        Command::Init => {
            tokio::fs::create_dir_all(config.files_path()).await?;
            HandReceiptDb::open(&config.database_path())?;
            SqliteLedger::open(&config.ledger_path())?;

            let config_path = config.config_path();
            if !config_path.exists() {
                config.save(&config_path)?;
            }
            info!(data_dir = %config.data_dir.display(), "Initialized");
        }
        Command::VerifyLedger => {
            let ledger = SqliteLedger::open(&config.ledger_path())?;
            let audit = AuditService::new(std::sync::Arc::new(ledger));
            let verification = audit.verify_chain()?;
            print_json(&verification)?;
            if !verification.valid {
                bail!("ledger verification failed with {} problem(s)", verification.problems.len());
            }
        }
        Command::History { serial } => {
            let db = HandReceiptDb::open(&config.database_path())?;
            let property = db
                .get_property_by_serial(&serial)?
                .with_context(|| format!("No property with serial number {}", serial))?;
            let ledger = SqliteLedger::open(&config.ledger_path())?;
            print_json(&ledger.get_property_history(property.id)?)?;
        }
        Command::Corrections { original } => {
            let ledger = SqliteLedger::open(&config.ledger_path())?;
            let corrections = match original {
                Some(id) => ledger.get_correction_events_by_original_id(&id)?,
                None => ledger.get_all_correction_events()?,
            };
            print_json(&corrections)?;
        }
        Command::Stats => {
            let db = HandReceiptDb::open(&config.database_path())?;
            print_json(&db.stats()?)?;
        }
    }

    Ok(())
}
