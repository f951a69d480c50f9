//! devprobe: entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Resolve effective log level (CLI `-v` flags > env > config)
//!   4. Init logger once
//!   5. Open the record log
//!   6. Spawn Ctrl-C / SIGTERM → shutdown signal watcher
//!   7. Start listeners (plaintext, bootstrap, TLS)
//!   8. Print summary, then join listeners after shutdown

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use devprobe::config::{self, Config};
use devprobe::error::AppError;
use devprobe::logger;
use devprobe::sink::RecordSink;
use devprobe::subsystems::comms::{CommsState, RequestLimits};
use devprobe::subsystems::comms::listener::ListenerState;
use devprobe::subsystems::ui;
use devprobe::supervisor::{self, Availability};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    // Optional file.
    let _ = dotenvy::dotenv();

    let args = parse_cli_args();
    let config = config::load(args.config_path.as_deref())?;

    let effective_log_level = args.log_level.unwrap_or(config.log_level.as_str());
    let force_cli_level = args.log_level.is_some();
    if !force_cli_level {
        logger::parse_level(effective_log_level)?;
    }
    logger::init(effective_log_level, force_cli_level, config.log_file.as_deref())?;

    info!(
        host = %config.server.host,
        http_port = config.server.http_port,
        https_port = config.server.https_port,
        tls_enabled = config.tls.enabled,
        effective_log_level = %effective_log_level,
        "config loaded"
    );

    let sink = match RecordSink::open(&config.storage.log_dir, &config.storage.log_file).await {
        Ok(sink) => sink,
        Err(e) => {
            warn!("{e}; /collect will answer 500");
            RecordSink::unavailable(config.storage.log_path())
        }
    };
    let state = Arc::new(CommsState::new(
        ui::start(&config.site),
        Arc::new(sink),
        RequestLimits::from(&config.server),
    ));

    let shutdown = CancellationToken::new();
    spawn_signal_watcher(shutdown.clone());

    let running = supervisor::start(&config, state.clone(), shutdown.clone()).await?;
    let availability = running.settled().await;
    print_startup_summary(&config, &availability, state.sink.path());

    running.join().await?;
    info!("bye");
    Ok(())
}

/// Cancel `shutdown` on Ctrl-C or (Unix) SIGTERM.
fn spawn_signal_watcher(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("ctrl-c received: initiating shutdown"),
                        _ = term.recv() => info!("SIGTERM received: initiating shutdown"),
                    }
                }
                Err(e) => {
                    warn!("cannot install SIGTERM handler: {e}");
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("ctrl-c received: initiating shutdown");
                    }
                }
            }
        }
        #[cfg(not(unix))]
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received: initiating shutdown");
        }
        shutdown.cancel();
    });
}

fn print_startup_summary(config: &Config, availability: &Availability, log_path: &std::path::Path) {
    let fit = |text: String| -> String {
        const WIDTH: usize = 58;
        let char_count = text.chars().count();
        if char_count >= WIDTH {
            let mut out = text.chars().take(WIDTH - 1).collect::<String>();
            out.push('…');
            out
        } else {
            format!("{text:<WIDTH$}")
        }
    };

    let listener_line = |scheme: &str, state: &ListenerState| match state {
        ListenerState::Serving { local_addr } => format!("✅ {scheme}://{local_addr}/"),
        ListenerState::Stopped { reason } => format!("❌ {scheme}: {reason}"),
        ListenerState::Starting => format!("⏳ {scheme}: starting"),
    };

    let maps = if config.site.maps_api_key.is_some() { "configured" } else { "not set" };

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ 🛰️  devprobe                                                  ║");
    println!("╟──────────────────────────────────────────────────────────────╢");
    println!("║   {}║", fit(format!("PID: {}", std::process::id())));
    println!("║   {}║", fit(listener_line("http", &availability.http)));
    println!("║   {}║", fit(listener_line("https", &availability.https)));
    println!("╟──────────────────────────────────────────────────────────────╢");
    println!("║   {}║", fit(format!("log: {}", log_path.display())));
    println!("║   {}║", fit(format!("static: {}", config.site.static_root().display())));
    println!("║   {}║", fit(format!("maps key: {maps}")));
    println!("╚══════════════════════════════════════════════════════════════╝");
    if !availability.is_reachable() {
        println!("⚠️  no listener is serving; check the log for bind errors");
    }
}

struct CliArgs {
    log_level: Option<&'static str>,
    config_path: Option<String>,
}

fn parse_cli_args() -> CliArgs {
    let mut verbosity = 0u8;
    let mut config_path = None;

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }

        match arg.as_str() {
            "-h" | "--help" => {
                println!("Usage: devprobe [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -h, --help                 Print help");
                println!("  -f, --config <PATH>        Path to configuration file (default: config/default.toml)");
                println!("  -v, -vv, -vvv, -vvvv       Increase logging verbosity");
                std::process::exit(0);
            }
            "-f" | "--config" => {
                if let Some(path) = iter.next() {
                    config_path = Some(path);
                } else {
                    eprintln!("error: -f/--config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--verbose" => verbosity = verbosity.saturating_add(1),
            a if a.starts_with('-') && a.len() > 1 && a.chars().skip(1).all(|c| c == 'v') => {
                verbosity = verbosity.saturating_add((a.len() - 1) as u8);
            }
            _ => {}
        }
    }

    //   -v      → warn
    //   -vv     → info
    //   -vvv    → debug (route decisions, accepted connections)
    //   -vvvv+  → trace
    let log_level = match verbosity {
        0 => None,
        1 => Some("warn"),
        2 => Some("info"),
        3 => Some("debug"),
        _ => Some("trace"),
    };

    CliArgs { log_level, config_path }
}
