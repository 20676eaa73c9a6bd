//! swap-bot: multi-account item trade bot, demo binary.
//!
//! Runs the full engine against the in-memory simulated platform: starts
//! the configured accounts, sends a demo offer, scripts the venue
//! accepting and completing it, and prints the resulting event stream.
//!
//! Usage:
//!   swap-bot [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>       Config file path (default: config/swap-bot.toml)
//!   -l, --log-level <LEVEL>   Log level override: trace, debug, info, warn, error

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use swap_common::{ExchangeDetails, ExchangeStatus, ItemKey, ItemRecord, OfferState};

use swap_bot::config::ManagerConfig;
use swap_bot::events::AccountEvent;
use swap_bot::manager::Manager;
use swap_bot::platform::sim::SimPlatform;
use swap_bot::AccountCollaborators;

/// CLI arguments for swap-bot.
#[derive(Parser, Debug)]
#[command(name = "swap-bot")]
#[command(about = "Multi-account item trade bot (simulated platform demo)")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/swap-bot.toml")]
    config: PathBuf,

    /// Log level override: trace, debug, info, warn, error
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // Load environment variables from .env file (if present)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: failed to load .env file: {e}");
        }
    }

    let args = Args::parse();

    let mut config = if args.config.exists() {
        ManagerConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?
    } else {
        eprintln!(
            "Config file not found at {:?}, using defaults",
            args.config
        );
        ManagerConfig::default()
    };
    config.apply_env_overrides();
    config.validate()?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    let log_level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to initialize logging")?;

    let (manager, mut events) = Manager::new(&config);

    // Print the merged event stream as operators would consume it.
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let account = &event.account_id;
            match event.event {
                AccountEvent::Info(message) => println!("[{account}] info: {message}"),
                AccountEvent::Warning(message) => println!("[{account}] warning: {message}"),
                AccountEvent::Err { message, cause } => match cause {
                    Some(cause) => println!("[{account}] error: {message} ({cause})"),
                    None => println!("[{account}] error: {message}"),
                },
                AccountEvent::Trade { offer_id, phase } => {
                    println!("[{account}] trade {offer_id}: {phase}")
                }
            }
        }
    });

    let account_cfg = config.accounts[0].clone();
    let pair = account_cfg.tracked[0].clone();

    // Seed the simulated venue with a small demo inventory.
    let sim = Arc::new(SimPlatform::new());
    let demo_items: Vec<ItemRecord> = (1..=4)
        .map(|i| {
            ItemRecord::new(
                ItemKey::new(
                    pair.collection.clone(),
                    pair.sub_collection.clone(),
                    format!("demo-{i}"),
                ),
                json!({ "name": format!("Demo Item {i}") }),
            )
        })
        .collect();
    sim.set_inventory(
        &account_cfg.id,
        &pair.collection,
        &pair.sub_collection,
        demo_items.clone(),
    );

    let platform_rx = sim.events();
    let collaborators = AccountCollaborators {
        session: sim.clone(),
        offers: sim.clone(),
        codes: sim.clone(),
        fetcher: sim.clone(),
    };
    let account_id = manager
        .add_account(&account_cfg, collaborators, platform_rx)
        .await?;

    // Send a demo offer: give demo-1, receive a new item.
    let give = demo_items[0].key.clone();
    let receive = ItemKey::new(
        pair.collection.clone(),
        pair.sub_collection.clone(),
        "incoming-1",
    );
    let offer_id = manager
        .send_trade(&account_id, "counterparty-demo", None, vec![give.clone()], vec![receive.clone()])
        .await?;

    // Script the venue: the counterparty accepts and the exchange
    // completes.
    sim.set_offer_state(&offer_id, OfferState::Accepted);
    sim.push_exchange_details(
        &offer_id,
        ExchangeDetails {
            status: ExchangeStatus::Completed,
            sent_items: vec![give],
            received_items: vec![receive.clone()],
        },
    );
    sim.set_received_items(
        &offer_id,
        vec![ItemRecord::new(
            receive.clone(),
            json!({ "name": "Incoming Item 1" }),
        )],
    );
    sim.emit_offer_changed(&offer_id, OfferState::Active);

    // Wait for the exchange to land in the ledger.
    let mut settled = false;
    for _ in 0..50 {
        if manager
            .account_inventories(&pair, None)
            .iter()
            .any(|item| item.key == receive)
        {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    anyhow::ensure!(settled, "demo exchange did not settle");

    println!("\nFinal inventory for {pair}:");
    for item in manager.account_inventories(&pair, None) {
        println!(
            "  {} reserved={} {}",
            item.key, item.reserved, item.payload
        );
    }

    manager.shutdown().await;
    printer.abort();
    Ok(())
}
