// lockbridge: BLE door-lock gateway
//
// Runs the gateway (BLE central + HTTP control surface) and offers offline
// maintenance commands against the same store.

mod ble;
mod config;
mod server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use lockbridge_core::{
    Gateway, HandlerSet, KeyStore, PeripheralId, PeripheralLog, PeripheralRoster, SettingsStore,
    SledStorage, StorageBackend,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

#[derive(Parser)]
#[command(name = "lockbridge")]
#[command(about = "Lockbridge: BLE gateway for an RFID reader and a door lock", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Run {
        /// Bridge only the configured test peripheral and log its traffic
        #[arg(long)]
        test_mode: bool,
        /// Override the HTTP listen port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Manage authorised RFID keys
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },
    /// Inspect or change stored lock settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Show the persisted log of a peripheral
    Logs {
        peripheral: String,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum KeysAction {
    Add { key: String },
    Remove { key: String },
    List,
}

#[derive(Subcommand)]
enum SettingsAction {
    List,
    Set { name: String, value: i64 },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { test_mode, port } => cmd_run(test_mode, port).await,
        Commands::Keys { action } => {
            init_console_logging();
            cmd_keys(action)
        }
        Commands::Settings { action } => {
            init_console_logging();
            cmd_settings(action)
        }
        Commands::Logs { peripheral, limit } => {
            init_console_logging();
            cmd_logs(peripheral, limit)
        }
        Commands::Config { action } => {
            init_console_logging();
            cmd_config(action)
        }
    }
}

fn init_console_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
}

/// Console output plus, when configured, daily-rolling JSON files. The guard
/// must outlive the gateway or buffered lines are lost.
fn init_logging(logging: &config::LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };
    let mut layers = vec![tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(filter())
        .boxed()];

    let guard = match &logging.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)
                .with_context(|| format!("Failed to create log directory: {}", directory))?;
            let appender = tracing_appender::rolling::daily(directory, "lockbridge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .json()
                    .with_filter(filter())
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    Registry::default().with(layers).init();
    Ok(guard)
}

fn open_storage(config: &config::Config) -> Result<Arc<dyn StorageBackend>> {
    let path = config.storage_dir()?;
    let storage = SledStorage::new(&path)
        .map_err(anyhow::Error::msg)
        .with_context(|| {
            format!(
                "Failed to open store at {} (is the gateway already running?)",
                path.display()
            )
        })?;
    Ok(Arc::new(storage))
}

async fn cmd_run(test_mode: bool, port: Option<u16>) -> Result<()> {
    let config = config::Config::load()?;
    let _log_guard = init_logging(&config.logging)?;
    let secrets = Arc::new(config::Config::load_secrets()?);

    let (roster, handlers) = if test_mode {
        let roster = PeripheralRoster::test_mode(&config.gateway)
            .context("Test mode needs `test_address` (lockbridge config set test_address <addr>)")?;
        (roster, HandlerSet::test_mode())
    } else {
        if config.gateway.peripherals.rfid_address.is_empty()
            || config.gateway.peripherals.lock_address.is_empty()
        {
            anyhow::bail!("Set `rfid_address` and `lock_address` before running the gateway");
        }
        (
            PeripheralRoster::from_config(&config.gateway),
            HandlerSet::standard(),
        )
    };

    let storage = open_storage(&config)?;

    println!("{}", "Lockbridge starting...".bold());
    println!();
    for id in roster.ids() {
        let role = roster
            .role_of(id)
            .map(|role| role.to_string())
            .unwrap_or_default();
        println!("  {} {:<6} {}", "•".bright_green(), role, id.to_string().bright_cyan());
    }

    let (events_tx, events_rx) = mpsc::channel(256);
    let transport = ble::BtleplugTransport::new(events_tx)
        .await
        .context("Failed to open Bluetooth adapter")?;
    let watcher = tokio::spawn(transport.clone().watch());

    let (gateway, handle) = Gateway::new(
        config.gateway.clone(),
        roster,
        handlers,
        (*secrets).clone(),
        storage,
        transport,
        events_rx,
    );
    let mut gateway_task = tokio::spawn(gateway.run());
    println!("{} Gateway started", "✓".green());

    let http_port = port.unwrap_or(config.http.listen_port);
    let addr: SocketAddr = format!("{}:{}", config.http.bind_address, http_port)
        .parse()
        .context("Invalid bind address")?;
    let server_task = if secrets.api_token.is_empty() {
        println!(
            "{} No api_token in secrets.json, control surface disabled",
            "!".yellow()
        );
        None
    } else {
        println!("{} Control surface on http://{}", "✓".green(), addr);
        Some(server::start(handle.clone(), secrets.clone(), addr))
    };
    println!();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("Shutting down...");
            if let Err(e) = handle.shutdown().await {
                tracing::warn!("Shutdown request failed: {}", e);
            }
            let _ = (&mut gateway_task).await;
        }
        result = &mut gateway_task => {
            if let Err(e) = result {
                tracing::error!("Gateway task failed: {}", e);
            }
        }
    }

    watcher.abort();
    if let Some(server_task) = server_task {
        server_task.abort();
    }
    Ok(())
}

fn cmd_keys(action: KeysAction) -> Result<()> {
    let config = config::Config::load()?;
    let keys = KeyStore::new(open_storage(&config)?);

    match action {
        KeysAction::Add { key } => {
            let key = keys.add_key(&key)?;
            println!("{} Key added: {}", "✓".green(), key.bright_cyan());
        }

        KeysAction::Remove { key } => {
            if keys.remove_key(&key)? {
                println!("{} Key removed: {}", "✓".green(), key.bright_cyan());
            } else {
                println!("{}", "No such key.".dimmed());
            }
        }

        KeysAction::List => {
            let list = keys.get_keys()?;
            if list.is_empty() {
                println!("{}", "No keys yet.".dimmed());
            } else {
                println!("{} ({} total)", "Keys".bold(), list.len());
                println!();
                for key in list {
                    println!("  {} {}", "•".bright_green(), key.bright_cyan());
                }
            }
        }
    }

    Ok(())
}

fn cmd_settings(action: SettingsAction) -> Result<()> {
    let config = config::Config::load()?;
    let settings = SettingsStore::new(open_storage(&config)?, Arc::new(config.gateway.clone()));

    match action {
        SettingsAction::List => {
            println!("{}", "Lock settings".bold());
            println!();
            for entry in settings.get_settings_map()? {
                println!(
                    "  {:<28} {:<8} {}",
                    entry.name.bright_cyan(),
                    format!("<{}>", entry.tag).dimmed(),
                    entry.value
                );
            }
        }

        SettingsAction::Set { name, value } => {
            if value < 0 {
                anyhow::bail!("{} must not be negative", name);
            }
            settings.save_setting(&name, value)?;
            println!("{} Set {} = {}", "✓".green(), name.bright_cyan(), value);
            println!(
                "  {}",
                "Pushed to the lock on its next initial sync or data request.".dimmed()
            );
        }
    }

    Ok(())
}

fn cmd_logs(peripheral: String, limit: usize) -> Result<()> {
    let config = config::Config::load()?;
    let log = PeripheralLog::new(open_storage(&config)?);
    let id = PeripheralId::new(&peripheral);
    let entries = log.entries(&id, limit)?;

    if entries.is_empty() {
        println!("{}", "No log entries.".dimmed());
        return Ok(());
    }

    let total = log.count(&id)?;
    println!(
        "{} ({} of {} entries)",
        id.to_string().bold(),
        entries.len(),
        total
    );
    println!();
    for entry in entries {
        println!(
            "  {} {}",
            format_timestamp(entry.timestamp_ms).dimmed(),
            entry.text
        );
    }

    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }

            println!();
            println!(
                "Secrets: {}",
                config::Config::secrets_file()?.display().to_string().dimmed()
            );
        }
    }

    Ok(())
}

fn format_timestamp(timestamp_ms: u64) -> String {
    use chrono::{DateTime, Local, Utc};

    let dt = DateTime::from_timestamp_millis(timestamp_ms as i64).unwrap_or_else(Utc::now);
    let local: DateTime<Local> = dt.into();

    local.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}
