//! pushctl - send notifications through the dispatch core.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr as _};
use push_cli::Fixture;
use push_core::Notification;
use push_dispatch::{DispatchManager, ShutdownHandler};
use push_provider::TracingMetrics;
use push_transport::{ApnsConnector, ConnectorSet, PlatformKind};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "pushctl")]
#[command(about = "Send push notifications to registered installations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send an alert to one installation
    Send {
        /// Fixture with applications, installations and dispatch settings
        #[arg(long)]
        config: PathBuf,

        /// Installation id
        #[arg(long)]
        installation: String,

        /// Alert text
        #[arg(long)]
        alert: String,

        /// Optional title
        #[arg(long)]
        title: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Send {
            config,
            installation,
            alert,
            title,
        } => {
            let notification = Notification {
                title,
                ..Notification::alert(alert)
            };
            cmd_send(config, &installation, &notification).await
        }
    }
}

async fn cmd_send(config: PathBuf, installation: &str, notification: &Notification) -> Result<()> {
    let fixture = Fixture::load(&config)?;
    let settings = fixture.dispatch.clone();
    let (apps, installations) = fixture.into_stores();

    let connectors = ConnectorSet::new().with(PlatformKind::Apns, Arc::new(ApnsConnector));
    let manager = DispatchManager::new(
        Arc::new(apps),
        Arc::new(installations),
        Arc::new(connectors),
        Arc::new(TracingMetrics),
        &settings,
    );

    let shutdown = ShutdownHandler::new();
    let mut events = manager.subscribe();
    let mut stop = shutdown.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => tracing::info!(
                        app = %event.app_id,
                        device_type = %event.device_type,
                        event = event.event.name(),
                        "provider event"
                    ),
                    Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event log lagged"),
                    Err(RecvError::Closed) => break,
                },
                _ = stop.changed() => break,
            }
        }
    });

    let outcome = tokio::select! {
        outcome = manager.notify_by_id(installation, notification) => Some(outcome),
        result = shutdown.wait_for_ctrl_c() => {
            result.wrap_err("failed to listen for ctrl+c")?;
            None
        }
    };

    if !manager.shutdown().await {
        tracing::warn!("providers did not shut down in time");
    }
    if !shutdown.is_triggered() {
        shutdown.trigger();
    }
    let _ = logger.await;

    match outcome {
        Some(outcome) => {
            let report = outcome.wrap_err("send failed")?;
            println!("transmitted: {}", report.transmitted);
            println!("failed:      {}", report.failed);
            if !report.devices_gone.is_empty() {
                println!("gone:        {}", report.devices_gone.join(", "));
            }
            Ok(())
        }
        None => {
            println!("interrupted");
            Ok(())
        }
    }
}
