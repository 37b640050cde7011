//! Storefront real-time client
//!
//! Command-line driver around the connection manager and token
//! coordinator: keeps a session alive and logs what the server pushes.

mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use storefront_realtime::auth::token;
use storefront_realtime::config::{self, ClientConfig};
use storefront_realtime::realtime::WebSocketTransport;
use storefront_realtime::{
    logging, ApiClient, ConnectionManager, Error, FileTokenStore, MemoryTokenStore, SessionState,
    StatusBus, StatusEvent, TokenCoordinator, TokenStore,
};

use crate::cli::{Cli, Commands, ConfigSubcommand};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { subcommand } = &cli.command {
        logging::init_simple(tracing::Level::WARN)?;
        return handle_config_command(subcommand.clone(), cli.config.as_deref());
    }

    let config = load_or_exit(cli.config.as_deref());
    let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting storefront-realtime");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("storefront-rt")
        .build()
        .context("failed to create async runtime")?;

    let outcome = runtime.block_on(async {
        match cli.command {
            Commands::Run => run(config).await,
            Commands::Login { email, password } => login(config, &email, &password).await,
            Commands::Logout => logout(config).await,
            Commands::Status => status(&config),
            Commands::Config { .. } => unreachable!("handled before runtime start"),
        }
    });

    if let Err(e) = outcome {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }

    Ok(())
}

fn load_or_exit(path: Option<&str>) -> ClientConfig {
    match ClientConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprint!("{}", e.format_for_terminal());
            std::process::exit(e.exit_code());
        }
    }
}

/// The collaborators every session command needs, wired together
struct Session {
    connection: ConnectionManager,
    coordinator: TokenCoordinator,
}

impl Session {
    fn build(config: &ClientConfig) -> storefront_realtime::Result<Self> {
        let tokens = token_store(config);
        let bus = StatusBus::new();
        let api = ApiClient::new(&config.api, tokens.clone())?.with_status_bus(bus.clone());
        let transport = WebSocketTransport::new().with_cookie_jar(api.cookie_jar());
        let connection =
            ConnectionManager::new(config.realtime.clone(), Arc::new(transport), tokens, bus);
        let coordinator = TokenCoordinator::new(connection.clone(), Arc::new(api), &config.session);

        Ok(Self {
            connection,
            coordinator,
        })
    }
}

fn token_store(config: &ClientConfig) -> Arc<dyn TokenStore> {
    if config.session.persist_tokens {
        Arc::new(FileTokenStore::open(config.data_dir()))
    } else {
        Arc::new(MemoryTokenStore::new())
    }
}

/// Hold the connection open until Ctrl-C
async fn run(config: ClientConfig) -> storefront_realtime::Result<()> {
    let Session {
        connection,
        coordinator,
    } = Session::build(&config)?;

    coordinator.start();

    let mut status_rx = connection.subscribe_status();
    let status_logger = tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(event) => log_status(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Status log lagged behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    for event in &config.realtime.events {
        let name = event.clone();
        connection.on(event, move |data: &Value| {
            info!(event = %name, data = %data, "Real-time event");
        });
    }

    match connection.initialize(None).await {
        Ok(()) => {}
        Err(e @ Error::ConnectionTimeout { .. }) => {
            warn!(error = %e, "Real-time connection slow to come up, still waiting");
            if let Err(e) = connection.wait_for_connection(config.realtime.wait_timeout()).await {
                warn!(error = %e, "Continuing without a real-time connection");
            }
        }
        Err(e) => warn!(error = %e, "Real-time connection not ready"),
    }

    let mut session_rx = coordinator.subscribe_state();
    let state = coordinator.bootstrap().await;
    info!(authenticated = state.is_authenticated(), "Session restored");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            changed = session_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = session_rx.borrow_and_update().clone();
                if let SessionState::Anonymous { reason: Some(reason) } = state {
                    warn!(reason = ?reason, "{}", reason.user_message());
                }
            }
        }
    }

    coordinator.shutdown();
    connection.cleanup();
    status_logger.abort();

    info!("Stopped");
    Ok(())
}

fn log_status(event: &StatusEvent) {
    match event {
        StatusEvent::Disconnected { reason } => warn!(reason = %reason, "Disconnected"),
        StatusEvent::AuthError { code, message } => {
            warn!(code = %code, message = ?message, "Real-time authentication rejected")
        }
        StatusEvent::ConnectionFailed { attempts } => {
            warn!(attempts, "Gave up reconnecting")
        }
        other => info!(event = other.name(), "Connection status"),
    }
}

async fn login(config: ClientConfig, email: &str, password: &str) -> storefront_realtime::Result<()> {
    let session = Session::build(&config)?;
    let auth = session.coordinator.login(email, password).await?;
    session.coordinator.shutdown();

    match auth.user.as_ref().and_then(|u| u.get("email")).and_then(Value::as_str) {
        Some(address) => println!("Logged in as {}", address),
        None => println!("Logged in"),
    }
    if let Some(expires_at) = token::decode_expiry(&auth.access_token) {
        println!("Access token expires at {}", expires_at.to_rfc3339());
    }
    if !config.session.persist_tokens {
        println!("Token persistence is disabled; the session ends with this process.");
    }

    Ok(())
}

async fn logout(config: ClientConfig) -> storefront_realtime::Result<()> {
    let session = Session::build(&config)?;
    session.coordinator.logout().await;
    println!("Logged out");
    Ok(())
}

fn status(config: &ClientConfig) -> storefront_realtime::Result<()> {
    let tokens = token_store(config);

    println!("Session:");
    println!("  Previously logged in: {}", tokens.was_logged_in());

    match tokens.access_token() {
        Some(access_token) => match token::decode_expiry(&access_token) {
            Some(expires_at) => {
                let remaining = expires_at - chrono::Utc::now();
                if remaining > chrono::Duration::zero() {
                    println!(
                        "  Access token:         valid until {} ({}s left)",
                        expires_at.to_rfc3339(),
                        remaining.num_seconds()
                    );
                } else {
                    println!("  Access token:         expired at {}", expires_at.to_rfc3339());
                }
            }
            None => println!("  Access token:         present (expiry unreadable)"),
        },
        None => println!("  Access token:         none"),
    }

    println!("Endpoints:");
    println!("  API:       {}", config.api.base_url);
    println!("  Real-time: {}", config.realtime.url);

    Ok(())
}

fn handle_config_command(subcommand: ConfigSubcommand, path: Option<&str>) -> anyhow::Result<()> {
    match subcommand {
        ConfigSubcommand::Show => {
            let cfg = load_or_exit(path);
            println!("{}", toml::to_string_pretty(&cfg).map_err(Error::from)?);
        }
        ConfigSubcommand::Init { path: target, force } => {
            match config::init_config(target.as_deref(), force) {
                Ok(written) => println!("Configuration written to {}", written.display()),
                Err(e) => {
                    eprint!("{}", e.format_for_terminal());
                    std::process::exit(e.exit_code());
                }
            }
        }
        ConfigSubcommand::Validate => {
            load_or_exit(path);
            println!("Configuration is valid.");
        }
    }

    Ok(())
}
