//! telnetd: Telnet login server.
//!
//! Accepts TCP connections, gives each one a pseudo-terminal running the
//! configured login program, and bridges the two while speaking the telnet
//! control protocol. All sessions share one thread and one event loop.

mod config;
mod server;
mod session;

use clap::Parser;
use config::{Overrides, ServerConfig};
use server::Server;
use session::NativeSpawner;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info};

/// Telnet login server
#[derive(Parser, Debug)]
#[command(name = "telnetd", version, about = "Telnet login server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen on the IPv4 address of this network interface
    #[arg(short, long)]
    interface: Option<String>,

    /// Listen address (ignored when --interface is given)
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Program to run on each terminal
    #[arg(short, long)]
    login: Option<String>,

    /// Detach from the controlling terminal after binding
    #[arg(short, long)]
    daemonize: bool,

    /// Do not send the issue banner before login
    #[arg(short, long)]
    no_issue: bool,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Config file path
    #[arg(long, default_value = "~/.telnetd/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let overrides = Overrides {
        port: cli.port,
        bind: cli.bind,
        interface: cli.interface.clone(),
        login: cli.login.clone(),
        daemonize: cli.daemonize,
        no_issue: cli.no_issue,
        max_sessions: cli.max_sessions,
    };

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if let Err(e) = config.check_login() {
        error!(error = %e, "login program check failed");
        std::process::exit(1);
    }

    let addr = match config.listen_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "cannot determine listen address");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        interface = config.interface.as_deref().unwrap_or("any"),
        login = %config.login.display(),
        "starting telnetd"
    );

    // Bind before detaching so that failures still reach the terminal.
    let listener = match std::net::TcpListener::bind(addr) {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %addr, error = %e, "bind failed");
            std::process::exit(1);
        }
    };

    if config.daemonize {
        if let Err(e) = nix::unistd::daemon(false, true) {
            error!(error = %e, "daemonize failed");
            std::process::exit(1);
        }
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            std::process::exit(1);
        }
    };

    runtime.block_on(async move {
        let spawner = NativeSpawner::new(config.login.clone(), config.term.clone());
        let server = match Server::from_std(listener, config, spawner) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to create server");
                std::process::exit(1);
            }
        };

        // Run until shutdown signal
        tokio::select! {
            result = server.run() => {
                if let Err(e) = result {
                    error!(error = %e, "server error");
                    std::process::exit(1);
                }
            }
            _ = shutdown_signal() => {
                info!("received shutdown signal");
            }
        }
    });

    info!("telnetd stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            ctrl_c.await.ok();
        }
    }
}
