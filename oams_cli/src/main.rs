//! Operator shell: run the control core against simulated feeders.
//!
//! `self-check` exercises a full load/unload cycle and prints OK;
//! `exec` dispatches one gcode-style command line and waits for the
//! result; `status` dumps the system snapshot.

mod rig;

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use clap::{Parser, Subcommand};
use eyre::WrapErr;
use oams_core::error::Result as CoreResult;
use oams_core::{AmsError, CommandReply, TicketState};
use oams_traits::Host;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::rig::SimRig;

static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Host facade printing to the terminal; extruder position is scripted.
#[derive(Debug, Default)]
struct ShellHost {
    position: Mutex<f64>,
}

impl Host for ShellHost {
    fn extruder_position(&self, _extruder: &str) -> f64 {
        self.position.lock().map(|g| *g).unwrap_or(0.0)
    }

    fn pause_print(&self, reason: &str) {
        println!("PAUSE: {reason}");
    }

    fn respond(&self, message: &str) {
        println!("{message}");
    }
}

#[derive(Parser)]
#[command(name = "oams_cli", version, about = "AMS control core simulator shell")]
struct Cli {
    /// Path to the TOML configuration; a built-in single-feeder rig is
    /// used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set; falls back to the config's
    /// [logging] level, then "info".
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json: bool,

    /// Also write logs to this file; overrides the [logging] file.
    #[arg(long)]
    log_file: Option<String>,

    /// File rotation policy: never | daily | hourly.
    #[arg(long)]
    log_rotation: Option<String>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Load and unload a spool on the simulated rig, then print OK.
    SelfCheck,
    /// Dispatch one command line, e.g. `OAMS_LOAD_SPOOL FPS=fps0 GROUP=T0`.
    Exec {
        #[arg(required = true)]
        line: Vec<String>,
    },
    /// Print the system snapshot.
    Status,
}

const DEFAULT_CONFIG: &str = r#"
[manager]

[feeder.ams0]

[fps.fps0]
pin = "PA1"
extruder = "extruder"
feeders = ["ams0"]

[group.T0]
members = ["ams0-0", "ams0-1"]
"#;

/// Build the optional file sink, honoring the rotation policy. Unknown
/// policies fall back to a single unrotated file. The non-blocking guard
/// lives for the whole process in `FILE_GUARD`.
fn file_layer(
    file: Option<&str>,
    rotation: Option<&str>,
) -> Option<tracing_appender::non_blocking::NonBlocking> {
    let path = file?;
    let appender = match rotation.unwrap_or("never").to_ascii_lowercase().as_str() {
        "daily" => tracing_appender::rolling::daily(".", path),
        "hourly" => tracing_appender::rolling::hourly(".", path),
        _ => tracing_appender::rolling::never(".", path),
    };
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = FILE_GUARD.set(guard);
    Some(writer)
}

fn init_tracing(
    json: bool,
    level: &str,
    file_writer: Option<tracing_appender::non_blocking::NonBlocking>,
) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        let layer = fmt::layer().json().with_writer(std::io::stderr);
        match file_writer {
            Some(w) => registry
                .with(layer)
                .with(fmt::layer().json().with_ansi(false).with_writer(w))
                .init(),
            None => registry.with(layer).init(),
        }
    } else {
        let layer = fmt::layer().with_writer(std::io::stderr);
        match file_writer {
            Some(w) => registry
                .with(layer)
                .with(fmt::layer().with_ansi(false).with_writer(w))
                .init(),
            None => registry.with(layer).init(),
        }
    }
}

fn humanize(err: &eyre::Report) -> String {
    if let Some(ams) = err.downcast_ref::<AmsError>() {
        return match ams {
            AmsError::NotReady { feeder, bay } => format!(
                "NOT_READY: bay {bay} on {feeder} has no spool seated (or is already threaded).\nSeat a spool and retry."
            ),
            AmsError::NoSpoolAvailable { group } => format!(
                "NOT_READY: no bay in group {group} has a spool ready."
            ),
            AmsError::Busy { feeder } => format!(
                "BUSY: {feeder} is mid-operation; wait for it to finish or cancel it."
            ),
            AmsError::FeederFaulted { feeder } => format!(
                "{feeder} is in ERROR state. Check the CAN/serial link, then run OAMS_CLEAR_ERRORS."
            ),
            AmsError::LoadFailed { .. } | AmsError::UnloadFailed { .. } => format!(
                "{ams}\nCheck the filament path for jams; the bay LED marks the failing lane."
            ),
            other => other.to_string(),
        };
    }
    let mut out = err.to_string();
    if let Some(src) = err.source() {
        out.push_str(&format!(" (cause: {src})"));
    }
    out
}

fn load_config(path: Option<&PathBuf>) -> CoreResult<oams_config::Config> {
    let raw = match path {
        Some(p) => std::fs::read_to_string(p)
            .wrap_err_with(|| format!("reading config {}", p.display()))?,
        None => DEFAULT_CONFIG.to_string(),
    };
    let cfg = oams_config::load_toml(&raw).wrap_err("parsing config")?;
    cfg.validate().map_err(eyre::Report::new)?;
    Ok(cfg)
}

fn ticket_outcome(state: Option<TicketState>) -> CoreResult<()> {
    match state {
        Some(TicketState::Done(Ok(()))) => Ok(()),
        Some(TicketState::Done(Err(e))) => Err(eyre::Report::new(e)),
        _ => Err(eyre::Report::new(AmsError::Command(
            "operation did not resolve in time".into(),
        ))),
    }
}

fn self_check(cfg: &oams_config::Config) -> CoreResult<()> {
    let host = std::sync::Arc::new(ShellHost::default());
    let mut rig = SimRig::from_config(cfg, host)?;
    rig.seed_all_bays();
    rig.step();

    let fps = cfg
        .fps
        .keys()
        .next()
        .cloned()
        .ok_or_else(|| eyre::Report::new(AmsError::Command("config defines no fps".into())))?;

    let reply = rig
        .coordinator
        .run_command(&format!("OAMS_LOAD_SPOOL FPS={fps}"))?;
    if let CommandReply::InFlight(ticket) = reply {
        ticket_outcome(rig.run_until_resolved(ticket, 100)).wrap_err("load")?;
    }

    let reply = rig
        .coordinator
        .run_command(&format!("OAMS_UNLOAD_SPOOL FPS={fps}"))?;
    if let CommandReply::InFlight(ticket) = reply {
        ticket_outcome(rig.run_until_resolved(ticket, 100)).wrap_err("unload")?;
    }

    println!("self-check OK");
    Ok(())
}

fn exec(cfg: &oams_config::Config, line: &str) -> CoreResult<()> {
    let host = std::sync::Arc::new(ShellHost::default());
    let mut rig = SimRig::from_config(cfg, host)?;
    rig.seed_all_bays();
    rig.step();

    match rig.coordinator.run_command(line)? {
        CommandReply::Done(msg) => println!("{msg}"),
        CommandReply::InFlight(ticket) => {
            ticket_outcome(rig.run_until_resolved(ticket, 400))?;
            println!("OK");
        }
    }
    Ok(())
}

fn status(cfg: &oams_config::Config) -> CoreResult<()> {
    let host = std::sync::Arc::new(ShellHost::default());
    let mut rig = SimRig::from_config(cfg, host)?;
    rig.seed_all_bays();
    rig.step();
    println!("{:#?}", rig.coordinator.status());
    Ok(())
}

fn run() -> CoreResult<()> {
    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_ref())?;
    let logging = &cfg.logging;
    let level = cli
        .log_level
        .as_deref()
        .or(logging.level.as_deref())
        .unwrap_or("info");
    let writer = file_layer(
        cli.log_file.as_deref().or(logging.file.as_deref()),
        cli.log_rotation.as_deref().or(logging.rotation.as_deref()),
    );
    init_tracing(cli.json, level, writer);
    tracing::info!(config = ?cli.config, "oams_cli starting");
    match &cli.cmd {
        Cmd::SelfCheck => self_check(&cfg),
        Cmd::Exec { line } => exec(&cfg, &line.join(" ")),
        Cmd::Status => status(&cfg),
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{}", humanize(&err));
        std::process::exit(1);
    }
}
