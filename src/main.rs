use anyhow::{bail, Context, Result};
use clap::{crate_version, App, AppSettings, Arg, ArgMatches, SubCommand};
use nix::sys::signal::{SigSet, Signal};
use tracing_subscriber::EnvFilter;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mwatch::control::{self, Server};
use mwatch::workload::{self, Workload};
use mwatch::{parse_address, Callchain, Config, PerfBackend, TracingSink, Watcher};

fn main() -> Result<()> {
    let socket = Arg::with_name("socket")
        .long("socket")
        .short("s")
        .takes_value(true)
        .help("Control socket path");

    let matches = App::new("mwatch")
        .version(crate_version!())
        .about("Hardware watchpoint on a runtime-configurable address")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            SubCommand::with_name("run")
                .about("Arm the watchpoint and serve the control socket")
                .arg(
                    Arg::with_name("config")
                        .long("config")
                        .short("c")
                        .takes_value(true)
                        .help("TOML configuration file"),
                )
                .arg(
                    Arg::with_name("address")
                        .long("address")
                        .short("a")
                        .takes_value(true)
                        .help("Initial address (0x-prefixed hex, 0-prefixed octal or decimal)"),
                )
                .arg(
                    Arg::with_name("pid")
                        .long("pid")
                        .short("p")
                        .takes_value(true)
                        .help("Watch a single process instead of the whole system"),
                )
                .arg(socket.clone()),
        )
        .subcommand(
            SubCommand::with_name("get")
                .about("Print the watched address")
                .arg(socket.clone()),
        )
        .subcommand(
            SubCommand::with_name("set")
                .about("Move the watchpoint to a new address")
                .arg(Arg::with_name("ADDRESS").required(true).index(1))
                .arg(socket),
        )
        .subcommand(
            SubCommand::with_name("workload")
                .about("Mutate a value at a fixed address, for exercising a watch")
                .arg(
                    Arg::with_name("interval")
                        .long("interval")
                        .short("i")
                        .takes_value(true)
                        .help("Seconds between increments"),
                ),
        )
        .get_matches();

    match matches.subcommand() {
        ("run", Some(m)) => run(m),
        ("get", Some(m)) => {
            println!("{}", control::request(socket_path(m), "get")?);
            Ok(())
        }
        ("set", Some(m)) => {
            let address = m.value_of("ADDRESS").unwrap_or_default();
            control::request(socket_path(m), &format!("set {}", address))
                .with_context(|| format!("failed to watch {}", address))?;
            Ok(())
        }
        ("workload", Some(m)) => run_workload(m),
        _ => unreachable!("subcommand required"),
    }
}

fn socket_path(m: &ArgMatches) -> PathBuf {
    m.value_of("socket")
        .map(PathBuf::from)
        .unwrap_or_else(mwatch::config::default_socket)
}

fn load_config(m: &ArgMatches) -> Result<Config> {
    let mut config = match m.value_of("config") {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(address) = m.value_of("address") {
        config.address = parse_address(address)?;
    }
    if let Some(pid) = m.value_of("pid") {
        config.watch.pid = Some(pid.parse().with_context(|| format!("invalid pid `{}`", pid))?);
    }
    if let Some(socket) = m.value_of("socket") {
        config.socket = PathBuf::from(socket);
    }

    config.validate()?;
    Ok(config)
}

fn init_observability(directive: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .with_context(|| format!("invalid log filter `{}`", directive))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {}", e))
}

/// Blocks SIGINT/SIGTERM in the calling thread (and every thread spawned
/// after) so they can be collected with `SigSet::wait`.
fn block_shutdown_signals() -> Result<SigSet> {
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.thread_block().context("failed to block signals")?;
    Ok(signals)
}

fn run(m: &ArgMatches) -> Result<()> {
    let config = load_config(m)?;
    init_observability(&config.log)?;

    let signals = block_shutdown_signals()?;

    let watcher = Watcher::init(
        PerfBackend::new(config.watch.clone()),
        config.address,
        Arc::new(Callchain::default()),
        Arc::new(TracingSink),
    )?;

    let server = Server::bind(&config.socket, watcher.param())?;
    thread::Builder::new()
        .name("mwatch-control".to_owned())
        .spawn(move || server.serve())
        .context("failed to start control socket")?;

    let signal = signals.wait().context("failed to wait for shutdown")?;
    tracing::info!("received {}, shutting down", signal);

    watcher.exit();
    fs::remove_file(&config.socket).ok();
    Ok(())
}

fn run_workload(m: &ArgMatches) -> Result<()> {
    init_observability(mwatch::config::DEFAULT_LOG)?;

    let interval = match m.value_of("interval") {
        Some(secs) => {
            let secs: u64 = secs
                .parse()
                .with_context(|| format!("invalid interval `{}`", secs))?;
            if secs == 0 {
                bail!("interval must be at least one second");
            }
            Duration::from_secs(secs)
        }
        None => workload::DEFAULT_INTERVAL,
    };

    let signals = block_shutdown_signals()?;
    let workload = Workload::start(interval).context("failed to start workload")?;
    println!("pid {} value address {:#x}", std::process::id(), workload.address());

    signals.wait().context("failed to wait for shutdown")?;
    workload.stop();
    Ok(())
}
