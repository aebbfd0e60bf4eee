//! `bb8-bridge` – bench entry point for the BB-8 bridge.
//!
//! 1. Initialises tracing (`RUST_LOG`, `BB8_LOG_FORMAT`, optional OTLP).
//! 2. Loads `~/.bb8/config.toml`, writing defaults on first run.
//! 3. Resolves the robot address (configured, cached, or scanned).
//! 4. Runs the full dispatcher against the in-process bus and a simulated
//!    robot, and drops into the bench REPL.
//! 5. Ctrl-C or `/quit` shuts the dispatcher down cleanly.

mod repl;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bb8_hal::{Advertisement, SimBleLink, SimScanner};
use bb8_middleware::InMemoryBus;
use bb8_runtime::{BridgeConfig, Dispatcher, bridge, config, telemetry};
use colored::Colorize;
use tokio::sync::watch;
use tracing::{error, warn};

/// Address advertised by the simulated robot in bench mode.
const BENCH_MAC: &str = "EE:B8:08:00:00:01";

fn main() {
    let _telemetry = telemetry::init_tracing("bb8-bridge");

    print_banner();

    let cfg = match load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            println!("{}: {e}", "Config error".red());
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start Tokio runtime");
            std::process::exit(1);
        }
    };

    let scanner = Arc::new(SimScanner::seeing(vec![Advertisement::new(
        BENCH_MAC,
        Some("BB-8 Bench"),
        Some(-55),
    )]));
    let device = match runtime.block_on(bridge::locate_device(&cfg, scanner, bridge::file_cache(&cfg))) {
        Ok(device) => device,
        Err(e) => {
            println!("{}: {e}", "Device error".red());
            std::process::exit(1);
        }
    };
    println!(
        "  Robot {} {}",
        device.mac.bold(),
        if device.from_cache { "(cached)".dimmed() } else { "(scanned)".dimmed() }
    );

    let bus = InMemoryBus::default();
    let link = Arc::new(SimBleLink::connected());
    let dispatcher = Dispatcher::new(Arc::new(bus.clone()), link.clone(), &cfg).with_device(&device);
    let status = dispatcher.status();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let quit = Arc::new(AtomicBool::new(false));

    {
        let shutdown_tx = Arc::clone(&shutdown_tx);
        let quit = Arc::clone(&quit);
        if let Err(e) = ctrlc::set_handler(move || {
            println!();
            println!("{}", "⚠  Ctrl-C received – stopping the bridge …".yellow().bold());
            quit.store(true, Ordering::SeqCst);
            shutdown_tx.send_replace(true);
        }) {
            warn!(error = %e, "failed to install Ctrl-C handler");
        }
    }

    let task = runtime.spawn(dispatcher.run(shutdown_rx));

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    let mut bench = repl::Bench::new(bus, link, status, cfg.topics());
    repl::run(&mut bench, &quit);

    shutdown_tx.send_replace(true);
    match runtime.block_on(async { tokio::time::timeout(Duration::from_secs(2), task).await }) {
        Ok(Ok(Ok(()))) => println!("{}", "  ✓ Bridge stopped.".green()),
        Ok(Ok(Err(e))) => println!("{}: {e}", "Bridge error".red()),
        Ok(Err(e)) => error!(error = %e, "dispatcher task failed"),
        Err(_) => warn!("dispatcher did not stop in time"),
    }
}

/// Load the config file, writing defaults when none exists yet.
fn load_config() -> Result<BridgeConfig, bb8_types::BridgeError> {
    let cfg = match config::load()? {
        Some(cfg) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        None => {
            let mut cfg = BridgeConfig::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => warn!(error = %e, "could not write default config"),
            }
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };
    cfg.validate()?;
    Ok(cfg)
}

fn print_banner() {
    println!();
    println!("{}", r#"  ___ ___    ___ "#.bold().yellow());
    println!("{}", r#" | _ ) _ )__( _ )"#.bold().yellow());
    println!("{}", r#" | _ \ _ \___/ _ \"#.bold().yellow());
    println!("{}", r#" |___/___/   \___/"#.bold().yellow());
    println!();
    println!(
        "  {} {}",
        "bb8-bridge".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Bus ⇄ BLE command bridge (bench mode)");
    println!();
}
