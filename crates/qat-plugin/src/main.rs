use std::collections::BTreeMap;

use anyhow::Result;
use clap::Parser;
use qat_plugin::config::Cli;
use qat_plugin::config::Commands;
use qat_plugin::config::DaemonArgs;
use qat_plugin::config::ScanArgs;
use qat_plugin::deviceplugin::ChannelNotifier;
use qat_plugin::deviceplugin::DeviceTree;
use qat_plugin::deviceplugin::Scanner;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use utils::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();
    logging::init()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(daemon_args).await,
        Commands::Scan(scan_args) => run_scan(scan_args),
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    tracing::info!("Starting QAT device plugin {}", &**version::VERSION);

    let plugin = daemon_args
        .discovery
        .device_plugin(daemon_args.scan_interval());
    let (notifier, receiver) = ChannelNotifier::new();
    let cancellation_token = CancellationToken::new();

    let signal_task = {
        let token = cancellation_token.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            token.cancel();
        })
    };

    let catalog_task = {
        let token = cancellation_token.clone();
        let namespace = daemon_args.resource_namespace.clone();
        tokio::spawn(log_catalog_changes(receiver, namespace, token))
    };

    let result = plugin
        .scan(&notifier, cancellation_token.clone())
        .await
        .map_err(|e| {
            tracing::error!("device scan failed: {e:?}");
            anyhow::anyhow!("device scan failed: {e}")
        });

    cancellation_token.cancel();
    signal_task.abort();
    if let Err(e) = catalog_task.await {
        tracing::warn!("catalog task failed: {e}");
    }

    result
}

fn run_scan(scan_args: ScanArgs) -> Result<()> {
    let plugin = scan_args.discovery.device_plugin(Default::default());
    let tree = plugin
        .scan_once()
        .map_err(|e| anyhow::anyhow!("device scan failed: {e:?}"))?;

    println!("{}", serde_json::to_string_pretty(&tree)?);
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {e}");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {e}");
                return;
            }
            tracing::info!("Received Ctrl+C, shutting down...");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}

/// Logs the advertised resources every time the catalog changes.
async fn log_catalog_changes(
    mut receiver: watch::Receiver<DeviceTree>,
    namespace: String,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            changed = receiver.changed() => {
                if changed.is_err() {
                    tracing::info!("Device catalog channel closed");
                    break;
                }
                let resources = resource_summary(&receiver.borrow_and_update(), &namespace);
                tracing::info!(?resources, "Device catalog updated");
            }
            _ = token.cancelled() => {
                tracing::info!("Catalog watcher task cancelled");
                break;
            }
        }
    }
}

fn resource_summary(tree: &DeviceTree, namespace: &str) -> BTreeMap<String, usize> {
    tree.device_types()
        .map(|dev_type| {
            (
                format!("{namespace}/{dev_type}"),
                tree.device_type_count(dev_type),
            )
        })
        .collect()
}
