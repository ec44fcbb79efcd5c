//! Hawser agent binary

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use hawser_agent::admin::{self, AdminState};
use hawser_agent::dispatch::{
    CommandRegistry, ContainerHandler, ContainerOp, Dispatcher, MetricsHandler, SubscriptionTable,
};
use hawser_agent::pty::{
    TerminalCloseHandler, TerminalCreateHandler, TerminalInputHandler, TerminalManager,
    TerminalResizeHandler,
};
use hawser_agent::telemetry::SysinfoSampler;
use hawser_agent::transport::{outbound_queue, Transport};
use hawser_agent::update::{
    platform_installer, UpdateApplyHandler, UpdateCheckHandler, Updater,
};
use hawser_agent::{logging, OutboundSender};
use hawser_core::auth::CredentialStore;
use hawser_core::config::{self, AgentConfig};
use hawser_core::time::current_time_secs;
use hawser_core::traits::{ContainerDriver, MetricsSampler};

/// Port used when the server address has none
const DEFAULT_SERVER_PORT: u16 = 7500;

/// Grace period for draining the transport on shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "hawser-agent")]
#[command(about = "Hawser host agent - keeps this machine connected to its control plane")]
#[command(version)]
struct Args {
    /// Control plane address (host or host:port), overriding the config file
    #[arg(short, long, env = "HAWSER_SERVER")]
    server: Option<String>,

    /// Path to the configuration file
    #[arg(short, long, env = "HAWSER_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the credentials file, overriding the config file
    #[arg(long)]
    credentials: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run in the foreground with verbose output
    #[arg(short, long)]
    foreground: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Config has to load before logging so the log file setting can
    // take effect; problems found here are reported right after init.
    let config_path = args.config.clone().unwrap_or_else(config::default_config_path);
    let (mut config, config_warning) = if config_path.exists() {
        match config::load_config(&config_path) {
            Ok(config) => (config, None),
            Err(e) => (
                AgentConfig::default(),
                Some(format!(
                    "Failed to load config from {}: {e}; using defaults",
                    config_path.display()
                )),
            ),
        }
    } else {
        (AgentConfig::default(), None)
    };

    if let Some(server) = &args.server {
        config.server_address = normalize_server_address(server);
    }
    if let Some(credentials) = &args.credentials {
        config.credentials_path = credentials.clone();
    }

    let log_level = if args.foreground {
        "debug"
    } else {
        args.log_level.as_str()
    };
    let _log_guard = logging::init(log_level, config.log_file.as_deref())?;

    if let Some(warning) = config_warning {
        tracing::warn!("{warning}");
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %config.server_address,
        "Hawser agent starting"
    );

    let config = Arc::new(config);
    let credentials = Arc::new(
        CredentialStore::load(&config.credentials_path).with_context(|| {
            format!(
                "failed to load credentials from {}",
                config.credentials_path.display()
            )
        })?,
    );

    let shutdown = CancellationToken::new();
    let (outbound, outbound_rx) = outbound_queue(config.send_queue_capacity);

    let terminals = Arc::new(TerminalManager::new(
        config.default_shell.clone(),
        config.default_env.clone(),
        config.max_sessions,
    ));
    let sampler: Option<Arc<dyn MetricsSampler>> = Some(Arc::new(SysinfoSampler::new()));
    // No container engine is bridged in the stock build; deployments
    // with one register a driver here.
    let containers: Option<Arc<dyn ContainerDriver>> = None;

    let installer = platform_installer(config.update.service_name.clone())
        .context("failed to set up the platform installer")?;
    let updater = if config.update.is_active() {
        Some(Arc::new(Updater::new(
            config.update.clone(),
            env!("CARGO_PKG_VERSION").to_string(),
            Arc::clone(&installer),
        )?))
    } else {
        None
    };

    let registry = Arc::new(build_registry(
        &terminals,
        &outbound,
        sampler.as_ref(),
        containers.as_ref(),
        updater.as_ref(),
    ));
    tracing::debug!(actions = ?registry.actions(), "Command registry ready");

    let subscriptions = Arc::new(SubscriptionTable::new());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&subscriptions),
        outbound.clone(),
        Arc::clone(&credentials),
        sampler.clone(),
        config.stream_interval,
        shutdown.clone(),
    ));

    let (transport, status_rx) = Transport::new(
        Arc::clone(&config),
        Arc::clone(&credentials),
        dispatcher,
        Arc::clone(&subscriptions),
        sampler.clone(),
        containers.clone(),
        outbound.clone(),
        outbound_rx,
    );

    if config.admin.enabled {
        let state = AdminState {
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            started_at: current_time_secs(),
            status_rx,
            terminals: Arc::clone(&terminals),
            subscriptions: Arc::clone(&subscriptions),
            sampler: sampler.clone(),
            log_file: config.log_file.clone(),
            installer: Arc::clone(&installer),
        };
        let admin_config = config.admin.clone();
        let admin_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = admin::serve(state, &admin_config, admin_shutdown).await {
                tracing::error!(error = %e, "Admin endpoint failed");
            }
        });
    }

    if let Some(updater) = &updater {
        tokio::spawn(Arc::clone(updater).run_scheduled(shutdown.clone()));
    }

    let mut transport_handle = tokio::spawn(transport.run(shutdown.clone()));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for the shutdown signal")?;
            tracing::info!("Shutdown signal received; draining");
            shutdown.cancel();
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut transport_handle)
                .await
                .is_err()
            {
                tracing::warn!("Transport did not stop in time; aborting");
                transport_handle.abort();
            }
        }
        _ = &mut transport_handle => {
            tracing::error!("Transport stopped unexpectedly; shutting down");
            shutdown.cancel();
        }
    }

    terminals.close_all().await;
    tracing::info!("Hawser agent stopped");
    Ok(())
}

/// Register every action this deployment can serve.
fn build_registry(
    terminals: &Arc<TerminalManager>,
    outbound: &OutboundSender,
    sampler: Option<&Arc<dyn MetricsSampler>>,
    containers: Option<&Arc<dyn ContainerDriver>>,
    updater: Option<&Arc<Updater>>,
) -> CommandRegistry {
    let mut builder = CommandRegistry::builder()
        .register(
            "terminal.create",
            Arc::new(TerminalCreateHandler {
                terminals: Arc::clone(terminals),
                outbound: outbound.clone(),
            }),
        )
        .register(
            "terminal.input",
            Arc::new(TerminalInputHandler {
                terminals: Arc::clone(terminals),
            }),
        )
        .register(
            "terminal.resize",
            Arc::new(TerminalResizeHandler {
                terminals: Arc::clone(terminals),
            }),
        )
        .register(
            "terminal.close",
            Arc::new(TerminalCloseHandler {
                terminals: Arc::clone(terminals),
            }),
        );

    if let Some(sampler) = sampler {
        builder = builder.register(
            "system.metrics",
            Arc::new(MetricsHandler {
                sampler: Arc::clone(sampler),
            }),
        );
    }

    if let Some(driver) = containers {
        for (action, op) in [
            ("container.list", ContainerOp::List),
            ("container.inspect", ContainerOp::Inspect),
            ("container.start", ContainerOp::Start),
            ("container.stop", ContainerOp::Stop),
            ("container.restart", ContainerOp::Restart),
        ] {
            builder = builder.register(
                action,
                Arc::new(ContainerHandler::new(Arc::clone(driver), op)),
            );
        }
    }

    if let Some(updater) = updater {
        builder = builder
            .register(
                "update.check",
                Arc::new(UpdateCheckHandler {
                    updater: Arc::clone(updater),
                }),
            )
            .register(
                "update.apply",
                Arc::new(UpdateApplyHandler {
                    updater: Arc::clone(updater),
                }),
            );
    }

    builder.build()
}

fn normalize_server_address(address: &str) -> String {
    if address.contains(':') {
        address.to_string()
    } else {
        format!("{address}:{DEFAULT_SERVER_PORT}")
    }
}
