//! Binary entrypoint for the modemgate CLI.
//!
//! Commands:
//! - `start [--port <path>] [--local]` - answer calls on the modem, or serve the local terminal
//! - `init` - create a starter `config.toml` with one sample BBS entry
//! - `list` - print the configured BBS directory
//! - `probe [--entry <n>]` - check TCP reachability of configured entries (JSON output)
//!
//! See the library crate docs for module-level details: `modemgate::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::time::{Duration, Instant};

use modemgate::config::Config;
use modemgate::gateway::Gateway;
use modemgate::shutdown::ShutdownFlag;

#[derive(Parser)]
#[command(name = "modemgate")]
#[command(about = "Bridge dial-up modem callers to telnet, SSH and rlogin BBSes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer calls and bridge callers to the configured BBSes
    Start {
        /// Modem serial port (e.g., /dev/ttyUSB0); overrides the config file
        #[arg(short, long)]
        port: Option<String>,

        /// Use this terminal instead of a modem
        #[arg(short, long)]
        local: bool,
    },
    /// Write a starter configuration file
    Init,
    /// List configured BBS entries
    List,
    /// Check that configured BBS hosts accept TCP connections
    Probe {
        /// Only probe this entry (1-based, as shown by `list`)
        #[arg(short, long)]
        entry: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { port, local } => {
            let mut config = Config::load(&cli.config).await?;
            // The local terminal is the caller's screen; keep log lines off it.
            init_logging(&Some(config.clone()), cli.verbose, !local);
            info!("Starting modemgate v{}", env!("CARGO_PKG_VERSION"));
            if let Some(port) = port {
                config.modem.port = port;
            }
            if config.bbs_entries.is_empty() {
                warn!("No [[bbs]] entries configured; callers will only be able to hang up");
            }

            let shutdown = ShutdownFlag::new();
            let signal_flag = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, finishing current session...");
                    signal_flag.trigger();
                }
            });

            let mut gateway = Gateway::new(config, shutdown);
            let worker = tokio::task::spawn_blocking(move || run_gateway(&mut gateway, local));
            worker.await??;
            info!("modemgate stopped");
        }
        Commands::Init => {
            init_logging(&None, cli.verbose, true);
            if std::path::Path::new(&cli.config).exists() {
                error!("{} already exists; not overwriting", cli.config);
                std::process::exit(1);
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::List => {
            let config = Config::load(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose, true);
            if config.bbs_entries.is_empty() {
                println!("No BBS entries configured.");
            }
            for (i, entry) in config.bbs_entries.iter().enumerate() {
                let script = match &entry.auto_login {
                    Some(steps) if !steps.is_empty() => format!(" [auto-login: {} steps]", steps.len()),
                    _ => String::new(),
                };
                println!(
                    "{:>2}. {} ({} {}){}",
                    i + 1,
                    entry.name,
                    entry.protocol,
                    entry.address(),
                    script
                );
                if !entry.description.is_empty() {
                    println!("    {}", entry.description);
                }
            }
        }
        Commands::Probe { entry } => {
            let config = Config::load(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose, true);
            let timeout = Duration::from_secs(config.bridge.connect_timeout_secs);
            let selected: Vec<(usize, &modemgate::config::BbsEntry)> = match entry {
                Some(n) => match config.bbs_entries.get(n.wrapping_sub(1)) {
                    Some(e) => vec![(n, e)],
                    None => {
                        error!("No BBS entry #{} (have {})", n, config.bbs_entries.len());
                        std::process::exit(2);
                    }
                },
                None => config
                    .bbs_entries
                    .iter()
                    .enumerate()
                    .map(|(i, e)| (i + 1, e))
                    .collect(),
            };

            let mut results = Vec::with_capacity(selected.len());
            let mut all_ok = true;
            for (n, bbs) in selected {
                let started = Instant::now();
                let attempt = tokio::time::timeout(
                    timeout,
                    tokio::net::TcpStream::connect((bbs.host.as_str(), bbs.port)),
                )
                .await;
                let (ok, detail) = match attempt {
                    Ok(Ok(_)) => (true, None),
                    Ok(Err(e)) => (false, Some(e.to_string())),
                    Err(_) => (false, Some(format!("timed out after {}s", timeout.as_secs()))),
                };
                if !ok {
                    all_ok = false;
                    warn!("Probe of {} ({}) failed", bbs.name, bbs.address());
                }
                results.push(serde_json::json!({
                    "entry": n,
                    "name": bbs.name,
                    "protocol": bbs.protocol,
                    "address": bbs.address(),
                    "status": if ok { "ok" } else { "unreachable" },
                    "elapsed_ms": started.elapsed().as_millis() as u64,
                    "error": detail,
                }));
            }
            let payload = serde_json::json!({
                "status": if all_ok { "ok" } else { "failed" },
                "entries": results,
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
            if !all_ok {
                std::process::exit(3);
            }
        }
    }

    Ok(())
}

fn run_gateway(gateway: &mut Gateway, local: bool) -> modemgate::error::Result<()> {
    if local {
        let line = modemgate::modem::LocalLine::new()?;
        return gateway.run_local(line);
    }
    open_modem(gateway)
}

#[cfg(feature = "serial")]
fn open_modem(gateway: &mut Gateway) -> modemgate::error::Result<()> {
    use modemgate::modem::HardwareLine;
    let modem = gateway.config().modem.clone();
    gateway.run_modem(|| {
        HardwareLine::open(&modem.port, modem.baud_rate, modem.hardware_flow_control)
    })
}

#[cfg(not(feature = "serial"))]
fn open_modem(_gateway: &mut Gateway) -> modemgate::error::Result<()> {
    Err(modemgate::error::GatewayError::Config(
        "built without the 'serial' feature; use --local".to_string(),
    ))
}

fn init_logging(config: &Option<Config>, verbosity: u8, console: bool) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|cfg| cfg.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|cfg| cfg.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });

    if let Some(f) = log_file {
        let mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Echo to the console only when someone is watching it
        let echo = console && atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if echo {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(move |fmt, record| {
            if !console {
                return Ok(());
            }
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
