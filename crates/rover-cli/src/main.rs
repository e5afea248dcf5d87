//! `rover-cli` – operator console for the rover relay.
//!
//! This binary:
//!
//! 1. Checks for `~/.rover-relay/config.toml`; runs a **First-Run Wizard**
//!    when the file is absent.  `ROVER_*` variables override whatever the
//!    file, the wizard or the defaults produced.
//! 2. Builds a relay [`Session`] over MQTT and prints connection changes as
//!    they are emitted.
//! 3. Drops the user into an **interactive REPL** with slash-commands
//!    (`/connect`, `/forward`, `/stop`, `/status`, `/help`, …).
//! 4. Intercepts **Ctrl-C** to send STOP to the active vehicle, disconnect,
//!    and exit.

mod config;
mod display;
mod observability;
mod repl;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use colored::Colorize;
use rover_relay::{RelayConfig, Session};
use rover_types::{CommandKind, ConnectionState};
use tracing::warn;

fn main() {
    let _tracing = observability::init_tracing("rover");

    print_banner();

    let cfg = match config::load() {
        Ok(None) => run_first_run_wizard(),
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            RelayConfig::default()
        }
    };
    let cfg = config::effective(cfg);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            std::process::exit(1);
        }
    };

    println!(
        "  Broker {}:{}  namespace {}  target {}",
        cfg.broker_host.bold(),
        cfg.broker_port,
        cfg.namespace.bold(),
        cfg.default_vehicle().to_string().bold()
    );

    let console = repl::Console {
        vehicle: Arc::new(Mutex::new(cfg.default_vehicle())),
        session: Arc::new(Session::with_mqtt(cfg)),
        rt: rt.handle().clone(),
    };
    repl::spawn_state_printer(&console);

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let session = Arc::clone(&console.session);
    let vehicle = Arc::clone(&console.vehicle);
    let handle = console.rt.clone();
    let shutdown_flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping the vehicle …".yellow().bold());
        shutdown_flag.store(true, Ordering::SeqCst);

        let target = vehicle.lock().unwrap_or_else(PoisonError::into_inner).clone();
        handle.block_on(async {
            if session.connection_state() == ConnectionState::Connected {
                match session.submit_command(&target, CommandKind::Stop, 0).await {
                    Ok(_) => println!("{}", format!("  ✓ STOP sent to {target}.").green()),
                    Err(e) => println!("  {} STOP not sent: {}", "✗".red(), e),
                }
            }
            session.disconnect().await;
        });

        println!("{}", "  ✓ Disconnected. Exiting rover.".green());
        std::process::exit(0);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; emergency stop on Ctrl-C will not be available");
    }

    println!();
    println!(
        "  Type {} to reach the broker, {} for all commands.\n",
        "/connect".bold().cyan(),
        "/help".bold().cyan()
    );

    repl::run(&console, shutdown);
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> RelayConfig {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║        Rover First-Run Wizard        ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's point rover at a broker.\n");

    let mut cfg = RelayConfig::default();

    cfg.broker_host = repl::prompt_str(
        &format!("  Broker host [{}]: ", cfg.broker_host),
        &cfg.broker_host,
    );
    cfg.use_tls = repl::prompt_bool("  Use TLS? [n]: ", false);
    let default_port = if cfg.use_tls { 8883 } else { cfg.broker_port };
    cfg.broker_port = repl::prompt_u16(&format!("  Broker port [{default_port}]: "), default_port);
    cfg.namespace = repl::prompt_str(
        &format!("  Topic namespace [{}]: ", cfg.namespace),
        &cfg.namespace,
    );

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ____                      "#.bold().cyan());
    println!("{}", r#"  / __ \____ _   _____  _____"#.bold().cyan());
    println!("{}", r#" / /_/ / __ \ | / / _ \/ ___/"#.bold().cyan());
    println!("{}", r#"/ _, _/ /_/ / |/ /  __/ /    "#.bold().cyan());
    println!("{}", r#"/_/ |_|\____/|___/\___/_/     "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Rover Relay".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Command and telemetry console");
    println!();
}
