//! REPL – the interactive operator console.
//!
//! Supported slash-commands:
//!   /help                 – show this list
//!   /connect              – connect to the configured broker
//!   /disconnect           – disconnect and stop reconnecting
//!   /vehicle [id]         – show or change the active vehicle (`ALL` = broadcast)
//!   /forward [speed]      – drive forward (default speed 150)
//!   /backward [speed]     – drive backward
//!   /left [speed]         – turn left
//!   /right [speed]        – turn right
//!   /stop                 – emergency stop
//!   /status               – connection state and latest telemetry
//!   /settings             – edit `~/.rover-relay/config.toml`
//!   /quit | /exit         – disconnect and exit

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use colored::Colorize;
use rover_relay::{RelayConfig, Session};
use rover_types::{CommandKind, ConnectionState, EventPayload, VehicleId};
use tokio::runtime::Handle;

use crate::config;
use crate::display::render_snapshot;

pub const DEFAULT_SPEED: i32 = 150;

/// A parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Help,
    Connect,
    Disconnect,
    Vehicle(Option<VehicleId>),
    Drive { kind: CommandKind, speed: i32 },
    Status,
    Settings,
    Quit,
}

impl ReplCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let Some(head) = words.next() else {
            return Err("empty command".to_string());
        };
        let arg = words.next();
        if let Some(extra) = words.next() {
            return Err(format!("unexpected argument '{extra}'"));
        }

        let command = match head {
            "/help" => ReplCommand::Help,
            "/connect" => ReplCommand::Connect,
            "/disconnect" => ReplCommand::Disconnect,
            "/vehicle" => ReplCommand::Vehicle(arg.map(VehicleId::new)),
            "/status" => ReplCommand::Status,
            "/settings" => ReplCommand::Settings,
            "/quit" | "/exit" => ReplCommand::Quit,
            "/stop" => ReplCommand::Drive {
                kind: CommandKind::Stop,
                speed: 0,
            },
            "/forward" | "/backward" | "/left" | "/right" => {
                let kind = head[1..]
                    .parse::<CommandKind>()
                    .map_err(|e| e.to_string())?;
                let speed = match arg {
                    Some(raw) => raw
                        .parse::<i32>()
                        .map_err(|_| format!("'{raw}' is not a speed"))?,
                    None => DEFAULT_SPEED,
                };
                return Ok(ReplCommand::Drive { kind, speed });
            }
            other => return Err(format!("unknown command '{other}'")),
        };

        match (&command, arg) {
            (ReplCommand::Vehicle(_), _) | (_, None) => Ok(command),
            (_, Some(extra)) => Err(format!("unexpected argument '{extra}'")),
        }
    }
}

/// Everything a console command acts on.
pub struct Console {
    pub session: Arc<Session>,
    pub vehicle: Arc<Mutex<VehicleId>>,
    pub rt: Handle,
}

impl Console {
    fn active_vehicle(&self) -> VehicleId {
        self.vehicle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Print connection events as they happen.
pub fn spawn_state_printer(console: &Console) {
    let mut changes = console.session.subscribe_to_state_changes();
    console.rt.spawn(async move {
        while let Some(event) = changes.next().await {
            match event.payload {
                EventPayload::ConnectionChanged { to, .. } => {
                    println!("\n  {} {}", "●".color(state_color(to)), to.to_string().bold());
                }
                EventPayload::ConnectFailed { reason, fatal } => {
                    let label = if fatal { "Connect failed (giving up):" } else { "Connect failed:" };
                    println!("\n  {} {}", label.red(), reason);
                }
                _ => {}
            }
        }
    });
}

fn state_color(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Connected => "green",
        ConnectionState::Connecting | ConnectionState::Reconnecting => "yellow",
        ConnectionState::Disconnected => "red",
    }
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(console: &Console, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", format!("rover[{}]>", console.active_vehicle()).bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match ReplCommand::parse(line) {
            Ok(ReplCommand::Help) => cmd_help(),
            Ok(ReplCommand::Connect) => cmd_connect(console),
            Ok(ReplCommand::Disconnect) => cmd_disconnect(console),
            Ok(ReplCommand::Vehicle(id)) => cmd_vehicle(console, id),
            Ok(ReplCommand::Drive { kind, speed }) => cmd_drive(console, kind, speed),
            Ok(ReplCommand::Status) => cmd_status(console),
            Ok(ReplCommand::Settings) => cmd_settings(),
            Ok(ReplCommand::Quit) => {
                console.rt.block_on(console.session.disconnect());
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Err(e) => {
                println!(
                    "{} {}. Type {} for available commands.",
                    "Error:".red(),
                    e,
                    "/help".bold()
                );
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "Rover Commands".bold().underline());
    println!("  {}        – connect to the broker", "/connect".bold().cyan());
    println!("  {}     – disconnect", "/disconnect".bold().cyan());
    println!("  {}   – show or set the target vehicle", "/vehicle [id]".bold().cyan());
    println!(
        "  {} – drive (default speed {DEFAULT_SPEED})",
        "/forward /backward /left /right [speed]".bold().cyan()
    );
    println!("  {}           – emergency stop", "/stop".bold().cyan());
    println!("  {}         – connection and telemetry", "/status".bold().cyan());
    println!("  {}       – edit broker settings", "/settings".bold().cyan());
    println!("  {}    – exit", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_connect(console: &Console) {
    let cfg = console.session.config();
    println!(
        "  Connecting to {}:{}{} …",
        cfg.broker_host.bold(),
        cfg.broker_port,
        if cfg.use_tls { " (TLS)" } else { "" }
    );
    if let Err(e) = console.rt.block_on(console.session.connect()) {
        println!("{}: {}", "Subscription failed".red(), e);
    }
}

fn cmd_disconnect(console: &Console) {
    console.rt.block_on(console.session.disconnect());
}

fn cmd_vehicle(console: &Console, id: Option<VehicleId>) {
    match id {
        Some(id) => {
            println!("  Target vehicle set to {}", id.to_string().bold());
            *console.vehicle.lock().unwrap_or_else(PoisonError::into_inner) = id;
        }
        None => println!("  Target vehicle: {}", console.active_vehicle().to_string().bold()),
    }
}

fn cmd_drive(console: &Console, kind: CommandKind, speed: i32) {
    let vehicle = console.active_vehicle();
    match console
        .rt
        .block_on(console.session.submit_command(&vehicle, kind, speed))
    {
        Ok(command) => println!(
            "  {} {} → {} (speed {}, seq {})",
            "✓".green(),
            command.kind.to_string().bold(),
            command.vehicle_id,
            command.speed,
            command.sequence
        ),
        Err(e) => println!("  {} {}", "✗".red(), e),
    }
}

fn cmd_status(console: &Console) {
    let session = &console.session;
    let state = session.connection_state();
    println!();
    println!("{}", "Status".bold().underline());
    println!(
        "  Connection : {}",
        state.to_string().color(state_color(state)).bold()
    );
    println!("  Broker     : {}:{}", session.config().broker_host, session.config().broker_port);
    println!("  Target     : {}", console.active_vehicle());

    let stats = session.ingest_stats();
    println!(
        "  Telemetry  : {} applied, {} out of order, {} malformed",
        stats.applied, stats.out_of_order, stats.malformed
    );

    let snapshots = session.snapshots();
    if snapshots.is_empty() {
        println!("  {}", "No telemetry received yet.".dimmed());
    }
    let now = chrono::Utc::now();
    for snapshot in &snapshots {
        let stale = session.is_stale(&snapshot.vehicle_id, now);
        print!("{}", render_snapshot(snapshot, stale));
    }
    println!();
}

fn cmd_settings() {
    let mut cfg = match config::load() {
        Ok(Some(c)) => c,
        Ok(None) => RelayConfig::default(),
        Err(e) => {
            println!("{}: {}", "Error loading config".red(), e);
            return;
        }
    };

    println!("{}", "Settings Editor".bold().underline());
    cfg.broker_host = prompt_str(&format!("  Broker host     [{}]: ", cfg.broker_host), &cfg.broker_host);
    cfg.broker_port = prompt_u16(&format!("  Broker port     [{}]: ", cfg.broker_port), cfg.broker_port);
    cfg.use_tls = prompt_bool(&format!("  Use TLS         [{}]: ", yes_no(cfg.use_tls)), cfg.use_tls);
    cfg.username = prompt_str(&format!("  Username        [{}]: ", cfg.username), &cfg.username);
    let password_hint = if cfg.password.is_empty() { "not set" } else { "keep" };
    cfg.password = prompt_str(&format!("  Password        [{password_hint}]: "), &cfg.password);
    cfg.namespace = prompt_str(&format!("  Topic namespace [{}]: ", cfg.namespace), &cfg.namespace);
    cfg.per_vehicle_topics = prompt_bool(
        &format!("  Per-vehicle topics [{}]: ", yes_no(cfg.per_vehicle_topics)),
        cfg.per_vehicle_topics,
    );
    cfg.default_vehicle = prompt_str(
        &format!("  Default vehicle [{}]: ", cfg.default_vehicle),
        &cfg.default_vehicle,
    );

    match config::save(&cfg) {
        Ok(()) => {
            println!(
                "{} {}",
                "✓ Settings saved to".green(),
                config::config_path().display().to_string().bold()
            );
            println!("  Restart rover to apply broker changes.");
        }
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn yes_no(flag: bool) -> &'static str {
    if flag { "y" } else { "n" }
}

/// Prompt for a u16 value.  Returns `default` when the user presses Enter.
pub(crate) fn prompt_u16(msg: &str, default: u16) -> u16 {
    let raw = prompt_str(msg, &default.to_string());
    match raw.parse::<u16>() {
        Ok(v) => v,
        Err(_) => {
            println!(
                "  {} '{}' is not a valid port number, keeping {}",
                "Warning:".yellow(),
                raw,
                default
            );
            default
        }
    }
}

pub(crate) fn prompt_bool(msg: &str, default: bool) -> bool {
    let raw = prompt_str(msg, yes_no(default));
    match raw.to_ascii_lowercase().as_str() {
        "y" | "yes" | "true" | "1" => true,
        "n" | "no" | "false" | "0" => false,
        _ => default,
    }
}

/// Prompt for a string value.  Returns `default` when the user presses Enter.
pub(crate) fn prompt_str(msg: &str, default: &str) -> String {
    print!("{}", msg);
    io::stdout().flush().ok();

    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let trimmed = line.trim().to_string();
            if trimmed.is_empty() {
                default.to_string()
            } else {
                trimmed
            }
        }
        Err(_) => default.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn movement_commands_default_to_150() {
        assert_eq!(
            ReplCommand::parse("/forward"),
            Ok(ReplCommand::Drive {
                kind: CommandKind::Forward,
                speed: DEFAULT_SPEED
            })
        );
        assert_eq!(
            ReplCommand::parse("/left 90"),
            Ok(ReplCommand::Drive {
                kind: CommandKind::Left,
                speed: 90
            })
        );
    }

    #[test]
    fn out_of_range_speed_is_left_to_the_relay() {
        // The relay reports InvalidSpeed; the parser only checks it is a number.
        assert_eq!(
            ReplCommand::parse("/backward 300"),
            Ok(ReplCommand::Drive {
                kind: CommandKind::Backward,
                speed: 300
            })
        );
        assert!(ReplCommand::parse("/right fast").is_err());
    }

    #[test]
    fn stop_and_simple_commands() {
        assert_eq!(
            ReplCommand::parse("/stop"),
            Ok(ReplCommand::Drive {
                kind: CommandKind::Stop,
                speed: 0
            })
        );
        assert_eq!(ReplCommand::parse("  /status "), Ok(ReplCommand::Status));
        assert_eq!(ReplCommand::parse("/exit"), Ok(ReplCommand::Quit));
        assert!(ReplCommand::parse("/stop now").is_err());
        assert!(ReplCommand::parse("/jump").is_err());
    }

    #[test]
    fn vehicle_command_optionally_takes_an_id() {
        assert_eq!(ReplCommand::parse("/vehicle"), Ok(ReplCommand::Vehicle(None)));
        assert_eq!(
            ReplCommand::parse("/vehicle ESP32_CAR_01"),
            Ok(ReplCommand::Vehicle(Some(VehicleId::new("ESP32_CAR_01"))))
        );
        assert!(ReplCommand::parse("/vehicle A B").is_err());
    }
}
