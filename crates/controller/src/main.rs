//! Main application entry point for the cluster controller.
//!
//! Loads the configuration, sets up logging, and either prints an
//! authentication token or runs the controller until a shutdown signal.

mod cli;
mod config;
mod signals;

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::{CliArgs, CliCommand};
use config::{AppConfig, LoggingSettings};
use controller_core::{builtin, Collaborators, ControllerServer, RegistryEvent, TokenSigner};

/// How long the server task may take to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// Initialize logging system
fn setup_logging(config: &LoggingSettings) -> anyhow::Result<()> {
    let log_level = config.level.as_str();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if config.json_format {
        registry
            .with(fmt::layer()
                .json()
                .with_file(false)
                .with_line_number(false)
                .with_thread_ids(true)
                .with_thread_names(true)
            )
            .try_init()?;
    } else {
        registry
            .with(fmt::layer()
                .with_ansi(true)
                .with_file(false)
                .with_line_number(false)
                .with_thread_ids(true)
                .with_thread_names(true)
            )
            .try_init()?;
    }

    info!("🔧 Logging initialized with level: {}", log_level);
    Ok(())
}

/// The controller together with the configuration it was built from.
pub struct Application {
    config: AppConfig,
    server: Arc<ControllerServer>,
}

impl Application {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let (collaborators, memory) = Collaborators::in_memory();
        config.seed(&memory);

        let signer = TokenSigner::new(config.secret_bytes()?)?;
        let server = ControllerServer::new(
            config.to_controller_config()?,
            signer,
            collaborators,
            builtin::default_handlers()?,
        )?;

        Ok(Self {
            config,
            server: Arc::new(server),
        })
    }

    /// Runs the controller until a shutdown signal arrives.
    pub async fn run(self) -> anyhow::Result<()> {
        info!("🌟 Starting controller v{}", env!("CARGO_PKG_VERSION"));
        info!("📋 Configuration Summary:");
        info!("  🌐 Bind address: {}", self.config.controller.bind_address);
        info!("  👥 Max connections: {}", self.config.controller.max_connections);
        info!(
            "  💓 Heartbeat: {}ms | Session timeout: {}ms",
            self.config.controller.heartbeat_interval_ms,
            self.config.controller.session_timeout_ms
        );
        info!(
            "  🧑 Users: {} | Instances placed: {}",
            self.config.users.len(),
            self.config.instances.len()
        );

        let registry = self.server.registry();
        let mut server_handle = {
            let server = self.server.clone();
            tokio::spawn(async move { server.start().await })
        };

        let host_watch_handle = {
            let mut events = registry.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    match event {
                        RegistryEvent::HostUpdated { id, connected } => {
                            info!("🖥️ Host {} is now {}", id, if connected { "online" } else { "offline" });
                        }
                        RegistryEvent::ControlCountChanged { count } => {
                            info!("🎛️ {} control connection(s)", count);
                        }
                    }
                }
            })
        };

        let monitoring_handle = (self.config.controller.stats_interval_secs > 0).then(|| {
            let registry = registry.clone();
            let period = Duration::from_secs(self.config.controller.stats_interval_secs);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                let mut last_received = 0u64;

                loop {
                    interval.tick().await;
                    let stats = registry.metrics().stats();
                    let received_this_period = stats.messages_received - last_received;
                    last_received = stats.messages_received;

                    info!(
                        "📊 Link Health - {} hosts | {} controls | {} sessions | {} messages in | {} resumes | {} rejected handshakes",
                        registry.host_count(),
                        registry.control_count(),
                        registry.session_count(),
                        received_this_period,
                        stats.sessions_resumed,
                        stats.handshakes_rejected
                    );
                }
            })
        });

        info!("✅ Controller is now running!");
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        let outcome = tokio::select! {
            result = &mut server_handle => {
                Some(result.context("Server task panicked")?)
            }
            signal = signals::shutdown_signal() => {
                let signal = signal.context("Failed to listen for shutdown signals")?;
                info!("📡 Received {}", signal);
                None
            }
        };

        if let Some(handle) = monitoring_handle {
            handle.abort();
        }
        host_watch_handle.abort();

        match outcome {
            Some(result) => {
                result?;
            }
            None => {
                info!("🛑 Shutdown signal received, draining sessions...");
                registry.stop_accepting();
                self.server.shutdown();
                match tokio::time::timeout(SHUTDOWN_GRACE, server_handle).await {
                    Ok(Ok(result)) => result?,
                    Ok(Err(e)) => error!("❌ Server task failed: {}", e),
                    Err(_) => warn!("Server did not stop within {:?}", SHUTDOWN_GRACE),
                }
            }
        }

        let stats = registry.metrics().stats();
        info!("📊 Final Statistics:");
        info!("  - Connections accepted: {}", stats.connections_accepted);
        info!("  - Sessions opened: {}", stats.sessions_opened);
        info!("  - Messages sent/received: {}/{}", stats.messages_sent, stats.messages_received);
        info!("✅ Controller shutdown complete");
        Ok(())
    }
}

async fn load_config(args: &CliArgs) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::load_from_file(&args.config_path).await?;

    if let Some(bind_address) = &args.bind_address {
        config.controller.bind_address = bind_address.clone();
    }
    if let Some(log_level) = &args.log_level {
        config.logging.level = log_level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }

    config
        .validate()
        .context("Configuration validation failed")?;
    Ok(config)
}

async fn execute(args: CliArgs) -> anyhow::Result<()> {
    let config = load_config(&args).await?;

    match args.command {
        CliCommand::GenerateHostToken { id } => {
            let signer = TokenSigner::new(config.secret_bytes()?)?;
            println!("{}", signer.host_token(id)?);
            Ok(())
        }
        CliCommand::GenerateUserToken { name } => {
            if !config.users.iter().any(|user| user.name == name) {
                eprintln!("warning: user {name} is not configured");
            }
            let signer = TokenSigner::new(config.secret_bytes()?)?;
            println!("{}", signer.user_token(&name)?);
            Ok(())
        }
        CliCommand::Run => {
            setup_logging(&config.logging)?;
            info!("📂 Config: {}", args.config_path.display());
            Application::new(config)?.run().await
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = CliArgs::parse();

    if let Err(e) = execute(args).await {
        eprintln!("❌ {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn args_for(path: std::path::PathBuf, command: CliCommand) -> CliArgs {
        CliArgs {
            config_path: path,
            bind_address: Some("127.0.0.1:0".to_string()),
            log_level: Some("debug".to_string()),
            json_logs: true,
            command,
        }
    }

    #[tokio::test]
    async fn test_cli_overrides_apply() {
        let dir = tempdir().unwrap();
        let args = args_for(dir.path().join("controller.toml"), CliCommand::Run);

        let config = load_config(&args).await.unwrap();
        assert_eq!(config.controller.bind_address, "127.0.0.1:0");
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
    }

    #[tokio::test]
    async fn test_invalid_override_is_rejected() {
        let dir = tempdir().unwrap();
        let mut args = args_for(dir.path().join("controller.toml"), CliCommand::Run);
        args.log_level = Some("chatty".to_string());

        assert!(load_config(&args).await.is_err());
    }

    #[tokio::test]
    async fn test_application_builds_from_default_config() {
        let dir = tempdir().unwrap();
        let args = args_for(dir.path().join("controller.toml"), CliCommand::Run);
        let config = load_config(&args).await.unwrap();

        let app = Application::new(config).unwrap();
        assert_eq!(app.server.registry().host_count(), 0);
        assert_eq!(app.server.config().bind_address.port(), 0);
    }
}
