//! cellblockd: single-host jail orchestration daemon.
//!
//! Accepts clients on a Unix socket, launches jails and multi-stage builds
//! on pseudo-terminals, keeps a scroll-back buffer for each, and lets one
//! console at a time attach to an instance.

mod backend;
mod build;
mod config;
mod console;
mod daemon;
mod dispatch;
mod error;
mod instance;
mod pty;
mod reaper;
mod registry;
mod termbuf;
mod tty;

use std::fs::{self, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use nix::unistd::{chown, User};
use signal_hook::consts::{SIGCHLD, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::backend::{ProvisioningBackend, ScriptBackend};
use crate::config::{Config, DaemonSection, UnderlyingFs};
use crate::daemon::Daemon;
use crate::tty::TtyPoller;

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "cellblockd", version)]
#[command(about = "Jail orchestration daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Unix socket to listen on
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Root of the cellblock data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Filesystem backing images and instances
    #[arg(long, value_enum)]
    underlying_fs: Option<UnderlyingFs>,

    /// Bytes of console scroll-back kept per instance
    #[arg(long)]
    tty_buffer_size: Option<usize>,

    /// Give this user's group access to the socket
    #[arg(long)]
    sock_owner: Option<String>,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Path to cellblockd.toml (or use CELLBLOCK_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Trace provisioning scripts; repeat for more
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Prepare the host for builds using the given base directory, then exit
    #[arg(long, value_name = "PATH")]
    create_forge: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a build pipeline; started by the daemon on a build instance's pty
    #[command(hide = true)]
    RunBuild {
        #[arg(long)]
        context: PathBuf,
    },
}

fn init_logging(default_directive: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(io::stderr).init(),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::RunBuild { context }) = &cli.command {
        init_logging("warn", None)?;
        let status = build::run_build_child(context)?;
        std::process::exit(status);
    }

    let (file_section, file_error) = match config::config_path(cli.config.clone()) {
        Some(path) => match config::load_file(&path) {
            Ok(section) => (section, None),
            Err(err) => (DaemonSection::default(), Some(err)),
        },
        None => (DaemonSection::default(), None),
    };
    let cli_section = DaemonSection {
        socket: cli.socket.clone(),
        data_dir: cli.data_dir.clone(),
        underlying_fs: cli.underlying_fs,
        tty_buffer_size: cli.tty_buffer_size,
        sock_owner: cli.sock_owner.clone(),
        log_file: cli.log_file.clone(),
        verbose: (cli.verbose > 0).then_some(cli.verbose),
    };
    let config = Config::resolve(cli_section, |key| std::env::var(key).ok(), file_section)?;

    let filter = if cli.debug || config.verbose > 0 {
        "debug"
    } else {
        "info"
    };
    init_logging(filter, config.log_file.as_deref())?;
    if let Some(err) = file_error {
        warn!("Ignoring config file: {:#}", err);
    }
    info!(
        "{}",
        cellblock_build_info::banner("cellblockd", DAEMON_VERSION)
    );

    config.prepare_data_dir()?;
    let backend = Arc::new(ScriptBackend::new(
        &config.data_dir,
        config.underlying_fs,
        config.verbose > 0,
    ));

    if let Some(path) = &cli.create_forge {
        let status = backend
            .create_forge(path)
            .context("failed to run create_forge.sh")?;
        info!(status, path = %path.display(), "forge preparation finished");
        std::process::exit(status);
    }

    let daemon = Arc::new(Daemon::new(config.clone(), backend));
    signal_hook::flag::register(SIGCHLD, daemon.sigchld.clone())
        .context("failed to install SIGCHLD handler")?;

    let listener = bind_socket(&config)?;
    spawn_shutdown_handler(config.socket.clone())?;
    TtyPoller::new(daemon.clone())
        .spawn()
        .context("failed to start tty poll thread")?;

    info!(
        socket = %config.socket.display(),
        data_dir = %config.data_dir.display(),
        underlying_fs = config.underlying_fs.as_str(),
        tty_buffer_size = config.tty_buffer_size,
        "cellblockd listening"
    );
    accept_loop(listener, daemon);
    Ok(())
}

fn bind_socket(config: &Config) -> Result<UnixListener> {
    match fs::remove_file(&config.socket) {
        Ok(()) => debug!(socket = %config.socket.display(), "removed stale socket"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to remove stale socket {}", config.socket.display())
            })
        }
    }
    let listener = UnixListener::bind(&config.socket)
        .with_context(|| format!("failed to bind {}", config.socket.display()))?;

    if let Some(owner) = &config.sock_owner {
        let user = User::from_name(owner)
            .with_context(|| format!("failed to look up user {}", owner))?
            .ok_or_else(|| anyhow!("socket owner {} does not exist", owner))?;
        chown(&config.socket, Some(user.uid), Some(user.gid))
            .with_context(|| format!("failed to chown {}", config.socket.display()))?;
        fs::set_permissions(&config.socket, Permissions::from_mode(0o770))
            .with_context(|| format!("failed to chmod {}", config.socket.display()))?;
    }
    Ok(listener)
}

/// Remove the socket and exit on SIGTERM or SIGINT.
fn spawn_shutdown_handler(socket: PathBuf) -> Result<()> {
    let mut signals =
        Signals::new([SIGTERM, SIGINT]).context("failed to install shutdown handlers")?;
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "shutting down");
                let _ = fs::remove_file(&socket);
                std::process::exit(0);
            }
        })
        .context("failed to start signal thread")?;
    Ok(())
}

fn accept_loop(listener: UnixListener, daemon: Arc<Daemon>) {
    for (n, stream) in listener.incoming().enumerate() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };
        let daemon = daemon.clone();
        let spawned = thread::Builder::new()
            .name(format!("conn-{}", n))
            .spawn(move || dispatch::serve_connection(daemon, stream));
        if let Err(err) = spawned {
            warn!(error = %err, "failed to start connection thread");
        }
    }
}
