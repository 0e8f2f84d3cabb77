//! Battle server binary.
//!
//! Loads configuration, starts the server, serves the operator console on
//! stdin and shuts everything down on SIGINT/SIGTERM or `quit`.

mod cli;
mod config;
mod console;
mod logging;
mod signals;

use anyhow::Context;
use battle_server::{create_server_with_config, BattleServer};
use cli::CliArgs;
use config::AppConfig;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Configured and ready to start.
struct Application {
    config: AppConfig,
    server: Arc<BattleServer>,
}

impl Application {
    async fn new(args: CliArgs) -> anyhow::Result<Self> {
        let (mut config, created) = AppConfig::load_from_file(&args.config_path).await?;
        config.apply_cli(&args);
        config
            .validate()
            .context("Configuration validation failed")?;

        logging::setup_logging(&config.logging)?;
        display_banner();
        if created {
            info!(
                "Created default configuration file: {}",
                args.config_path.display()
            );
        }

        let server = create_server_with_config(config.to_server_config()?);
        info!(
            "📂 Config: {} | Plugins: {}",
            args.config_path.display(),
            config.plugins.directory
        );
        Ok(Self { config, server })
    }

    async fn run(self) -> anyhow::Result<()> {
        let server = self.server;
        info!("📋 Configuration Summary:");
        info!("  🌐 Listen: {}:{}", self.config.server.bind_address, self.config.server.port);
        info!("  🔀 Transport: {}", self.config.server.transport);
        info!("  🗄️ Backing store: {}", self.config.store.backing_store);
        info!("  👥 Max connections: {}", self.config.server.max_connections);

        server.load_configured_plugins().await;
        let addr = server
            .start(self.config.server.port, self.config.server.close_on_disconnect)
            .await
            .context("Failed to start battle server")?;

        let mut console = {
            let server = server.clone();
            let lines = console::spawn_line_reader(std::io::BufReader::new(std::io::stdin()));
            tokio::spawn(console::run(server, lines, tokio::io::stdout()))
        };

        info!("✅ Battle server is now running on {}", addr);
        info!("🛑 Press Ctrl+C or type quit to shut down");

        tokio::select! {
            signal = signals::wait_for_shutdown_signal() => {
                if let Err(e) = signal {
                    error!("Signal handling failed: {}", e);
                }
                console.abort();
            }
            finished = &mut console => match finished {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => {
                    // Stdin closed (e.g. running detached): keep serving.
                    info!("Console input closed; waiting for a shutdown signal");
                    signals::wait_for_shutdown_signal().await?;
                }
                Ok(Err(e)) => warn!("Console failed: {}", e),
                Err(e) => warn!("Console task failed: {}", e),
            },
        }

        info!("🛑 Shutdown requested, initiating graceful shutdown...");
        server.shutdown().await;

        let stats = server.stats().await;
        info!("📊 Final Statistics:");
        info!("  - Connections accepted: {}", stats.connections_accepted);
        info!("  - Connections rejected: {}", stats.connections_rejected);
        info!("  - Battles completed: {}", stats.battles_completed);
        info!("  - Battles aborted: {}", stats.battles_aborted);
        info!("👋 Battle server shutdown complete");
        Ok(())
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = CliArgs::parse();

    let app = match Application::new(args).await {
        Ok(app) => app,
        Err(e) => {
            eprintln!("❌ Failed to start application: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = app.run().await {
        error!("❌ Application error: {:#}", e);
        std::process::exit(1);
    }
}

fn display_banner() {
    let version = env!("CARGO_PKG_VERSION");
    info!("╔══════════════════════════════════════════╗");
    info!("║            ⚔️  BATTLE SERVER  ⚔️            ║");
    info!("║                 v{:<8}                ║", version);
    info!("╚══════════════════════════════════════════╝");
}
