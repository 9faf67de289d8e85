//! flocons node binary: load config, assemble the storage engine,
//! topology client, dispatcher, and HTTP server, then block until an
//! interrupt or termination signal arrives.
//!
//! Grounded on `examples/original_source/main/main.go`: `NewConfigFromFile`
//! -> `NewStorage` -> `NewServer` (with a topology client wired in) ->
//! `waitForInterruption` -> `server.Close()`. The CLI flag and logging
//! setup follow the teacher's `clap` + `tracing-subscriber` idiom from
//! `teleport-daemon/src/bin/wormhole.rs`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use flocons_cluster::{Dispatcher, MaglevDispatcher, TopologyClient};
use flocons_core::Config;
use flocons_http::HttpServer;
use flocons_storage::StorageEngine;

#[derive(Parser)]
#[command(
    name = "flocons-node",
    version,
    about = "Distributed object store node: packs small files into append-only tar containers and serves them over HTTP"
)]
struct Cli {
    /// Path to the node's JSON configuration file.
    #[arg(short, long, env = "FLOCONS_CONFIG", default_value = "./flocons.json")]
    config: PathBuf,

    /// Raise the log level (-v info, -vv debug, -vvv trace). Overridden by RUST_LOG.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn verbosity_to_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Set once by the signal handler; `wait_for_interruption` checks this
/// on every wake before going back to sleep.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Install handlers for SIGINT and SIGTERM that flip `SHUTDOWN_REQUESTED`
/// and notify every thread parked on the returned condvar pair, mirroring
/// the original's `signal.Notify(signal_channel, os.Interrupt)`.
fn install_signal_handlers() -> Arc<(Mutex<bool>, Condvar)> {
    let pair = Arc::new((Mutex::new(false), Condvar::new()));
    SHUTDOWN_PAIR
        .set(Arc::clone(&pair))
        .expect("install_signal_handlers called more than once");

    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }

    pair
}

static SHUTDOWN_PAIR: std::sync::OnceLock<Arc<(Mutex<bool>, Condvar)>> = std::sync::OnceLock::new();

extern "C" fn handle_signal(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    if let Some(pair) = SHUTDOWN_PAIR.get() {
        let (lock, condvar) = &**pair;
        if let Ok(mut fired) = lock.lock() {
            *fired = true;
            condvar.notify_all();
        }
    }
}

fn wait_for_interruption(pair: &Arc<(Mutex<bool>, Condvar)>) {
    let (lock, condvar) = &**pair;
    let mut fired = lock.lock().expect("shutdown mutex poisoned");
    while !*fired && !SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
        fired = condvar
            .wait_timeout(fired, std::time::Duration::from_millis(500))
            .expect("shutdown condvar poisoned")
            .0;
    }
}

fn run() -> Result<(), String> {
    let cli = Cli::parse();
    init_logging(verbosity_to_filter(cli.verbose));

    let config = Config::from_file(&cli.config)
        .map_err(|e| format!("failed to load config {}: {e}", cli.config.display()))?;

    tracing::info!(
        node = %config.node.name,
        shard = %config.node.shard,
        namespace = %config.namespace,
        "starting flocons node"
    );

    let storage = Arc::new(
        StorageEngine::new(&config).map_err(|e| format!("failed to open storage engine: {e}"))?,
    );

    let dispatcher: Arc<dyn Dispatcher> = Arc::new(MaglevDispatcher::new());
    let topology = TopologyClient::start(&config, Some(Arc::clone(&dispatcher)));

    let mut server = HttpServer::start(&config, Arc::clone(&storage), Some(Arc::clone(&topology)))
        .map_err(|e| format!("failed to start http server: {e}"))?;

    let shutdown_pair = install_signal_handlers();
    wait_for_interruption(&shutdown_pair);

    tracing::info!(node = %config.node.name, "received interruption, shutting down");
    server.close();
    topology.close();

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            eprintln!("flocons-node: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_escalates_filter_level() {
        assert_eq!(verbosity_to_filter(0), "info");
        assert_eq!(verbosity_to_filter(1), "debug");
        assert_eq!(verbosity_to_filter(2), "trace");
        assert_eq!(verbosity_to_filter(9), "trace");
    }

    #[test]
    fn cli_parses_config_and_verbose_flags() {
        let cli = Cli::parse_from(["flocons-node", "--config", "/tmp/flocons.json", "-vv"]);
        assert_eq!(cli.config, PathBuf::from("/tmp/flocons.json"));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn cli_defaults_config_path() {
        let cli = Cli::parse_from(["flocons-node"]);
        assert_eq!(cli.config, PathBuf::from("./flocons.json"));
        assert_eq!(cli.verbose, 0);
    }
}
