//! Pulse Relay CLI
//!
//! Real-time sensor telemetry relay with per-user access control.

use clap::{Parser, Subcommand};
use pulse_relay::{
    config::Config,
    server::{self, AppState},
    sim::{default_fleet, Simulator},
    VERSION,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Parser)]
#[command(name = "pulse-relay")]
#[command(version = VERSION)]
#[command(about = "Real-time sensor telemetry relay with per-user access control", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve {
        /// Address to bind (overrides config)
        #[arg(long)]
        bind: Option<String>,

        /// Port to bind (overrides config)
        #[arg(long)]
        port: Option<u16>,

        /// Run built-in simulated sensors alongside the server
        #[arg(long)]
        simulate: bool,

        /// Path to a configuration file
        #[arg(long, short)]
        config: Option<PathBuf>,
    },

    /// Show configuration
    Config {
        /// Path to a configuration file
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            bind,
            port,
            simulate,
            config,
        } => cmd_serve(bind, port, simulate, config),
        Commands::Config { config } => cmd_config(config),
    }
}

fn load_config(path: Option<PathBuf>) -> Config {
    let loaded = match &path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    loaded.unwrap_or_else(|e| {
        eprintln!("Warning: could not load configuration: {e}");
        eprintln!("Falling back to defaults.");
        Config::default()
    })
}

fn cmd_serve(bind: Option<String>, port: Option<u16>, simulate: bool, config_path: Option<PathBuf>) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulse_relay=info,tower_http=warn".into()),
        )
        .init();

    let mut config = load_config(config_path);
    if let Some(bind) = bind {
        config.bind = bind;
    }
    if let Some(port) = port {
        config.port = port;
    }

    println!("Pulse Relay v{VERSION}");
    println!();
    println!("  Bind: {}:{}", config.bind, config.port);
    println!("  Seeded users: {}", config.users.len());
    println!("  Max subscribers: {}", config.max_subscribers);
    println!(
        "  Ingest auth: {}",
        if config.ingest_token.is_some() {
            "bearer token"
        } else {
            "open"
        }
    );
    println!(
        "  Simulated sensors: {}",
        if simulate { "enabled" } else { "disabled" }
    );
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: could not start runtime: {e}");
            std::process::exit(1);
        }
    };

    let result: anyhow::Result<()> = runtime.block_on(async {
        let state = AppState::new(&config);
        let (addr, shutdown_tx) = server::run(&config, state.clone()).await?;
        println!("Listening on http://{addr}");
        println!("Telemetry stream at ws://{addr}/ws");

        let simulator =
            simulate.then(|| Simulator::start(default_fleet(), Arc::clone(&state.ingest)));

        wait_for_ctrl_c().await;
        println!();
        println!("Shutting down...");

        let _ = shutdown_tx.send(());
        if let Some(simulator) = simulator {
            simulator.stop();
        }
        Ok(())
    });

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Block until Ctrl+C, bridged through the process signal handler.
async fn wait_for_ctrl_c() {
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let slot = Arc::new(Mutex::new(Some(tx)));

    let result = ctrlc::set_handler(move || {
        if let Ok(mut slot) = slot.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(());
            }
        }
    });
    if let Err(e) = result {
        eprintln!("Error setting Ctrl+C handler: {e}");
        std::process::exit(1);
    }

    let _ = rx.await;
}

fn cmd_config(config_path: Option<PathBuf>) {
    let config = load_config(config_path);

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&config).unwrap_or_else(|_| "Error".to_string())
    );
}
