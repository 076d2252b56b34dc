use std::process;
use std::sync::Arc;

use glacic_core::command::ShellCommandExecutor;
use glacic_core::firewall::FirewallBackend;
use glacic_core::health::HealthSupervisor;
use glacic_core::manager::UplinkManager;
use glacic_core::netlink::NetlinkBackend;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::interval;

mod cli;
mod config_file;
mod firewall_backend;
mod logging;
mod netlink_backend;

use config_file::TomlConfigSource;
use glacic_core::clock::SystemClock;
use glacic_core::config::ConfigSource;

// Avoid musl's default allocator due to degraded performance under heavy
// connection-tracking workloads.
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

enum SignalMessage {
    Shutdown,
    Reload,
}

async fn signal_channel() -> Result<tokio::sync::mpsc::Receiver<SignalMessage>, exitcode::ExitCode> {
    let (sender, receiver) = tokio::sync::mpsc::channel(8);
    let mut sigint = signal(SignalKind::interrupt()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGINT handler");
        exitcode::IOERR
    })?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGTERM handler");
        exitcode::IOERR
    })?;
    let mut sighup = signal(SignalKind::hangup()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGHUP handler");
        exitcode::IOERR
    })?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(_) = sigint.recv() => {
                    tracing::debug!("received SIGINT");
                    if sender.send(SignalMessage::Shutdown).await.is_err() { break; }
                }
                Some(_) = sigterm.recv() => {
                    tracing::debug!("received SIGTERM");
                    if sender.send(SignalMessage::Shutdown).await.is_err() { break; }
                }
                Some(_) = sighup.recv() => {
                    tracing::debug!("received SIGHUP");
                    if sender.send(SignalMessage::Reload).await.is_err() { break; }
                }
                else => {
                    tracing::warn!("signal streams closed");
                    break;
                }
            }
        }
    });

    Ok(receiver)
}

/// Builds the netlink/firewall backend pair for this run, honoring
/// `--dry-run` and `--firewall-backend`.
#[cfg(target_os = "linux")]
async fn build_backends(args: &cli::Cli) -> Result<(Arc<dyn NetlinkBackend>, Arc<dyn FirewallBackend>), exitcode::ExitCode> {
    if args.dry_run {
        let netlink: Arc<dyn NetlinkBackend> = Arc::new(netlink_backend::DryRunNetlinkBackend::new());
        let firewall: Arc<dyn FirewallBackend> = Arc::new(firewall_backend::DryRunFirewallBackend::new());
        return Ok((netlink, firewall));
    }

    let (conn, handle, _) = rtnetlink::new_connection().map_err(|error| {
        tracing::error!(?error, "failed to open rtnetlink connection");
        exitcode::OSERR
    })?;
    tokio::spawn(conn);
    let netlink: Arc<dyn NetlinkBackend> = Arc::new(netlink_backend::RealNetlinkBackend::new(handle));

    let firewall: Arc<dyn FirewallBackend> = match args.firewall_backend {
        cli::FirewallBackendKind::Native => Arc::new(firewall_backend::NativeFirewallBackend::new()),
        cli::FirewallBackendKind::Shell => Arc::new(firewall_backend::ShellFirewallBackend),
    };
    Ok((netlink, firewall))
}

async fn daemon(args: cli::Cli, reload_handle: Option<logging::LogReloadHandle>) -> Result<(), exitcode::ExitCode> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting {}", env!("CARGO_PKG_NAME"));

    let mut signal_receiver = signal_channel().await?;

    let (netlink, firewall) = build_backends(&args).await?;
    let manager = Arc::new(UplinkManager::new(firewall, netlink));

    let config_source = TomlConfigSource::new(args.config_path.clone());
    let definitions = load_definitions(&config_source).await?;
    manager.reload(definitions).await.map_err(|error| {
        tracing::error!(?error, "initial group setup failed");
        exitcode::CONFIG
    })?;

    let command = Arc::new(ShellCommandExecutor);
    let clock = Arc::new(SystemClock);
    let supervisor = Arc::new(HealthSupervisor::new(manager.clone(), command, clock, args.health_tick_interval));

    let supervisor_loop = supervisor.clone();
    let tick_interval = args.health_tick_interval;
    let supervisor_task = tokio::spawn(async move {
        let mut ticker = interval(tick_interval);
        loop {
            ticker.tick().await;
            if let Err(error) = supervisor_loop.check_all_groups().await {
                tracing::warn!(?error, "health-supervisor tick failed");
            }
        }
    });

    tracing::info!("entering main daemon loop");
    let result = loop {
        match signal_receiver.recv().await {
            Some(SignalMessage::Shutdown) => {
                tracing::info!("shutdown requested, tearing down groups");
                supervisor_task.abort();
                for name in manager.group_names() {
                    if let Some(group) = manager.group(&name) {
                        if let Err(error) = group.teardown().await {
                            tracing::warn!(group = %name, ?error, "teardown failed during shutdown");
                        }
                    }
                }
                break Ok(());
            }
            Some(SignalMessage::Reload) => {
                tracing::info!("reload requested");
                if let (Some(handle), Some(log_path)) = (&reload_handle, &args.log_file) {
                    if let Err(error) = logging::reload_log_file(handle, log_path) {
                        tracing::warn!(?error, "failed to reopen log file after SIGHUP");
                    }
                }
                supervisor.pause();
                match load_definitions(&config_source).await {
                    Ok(definitions) => {
                        if let Err(error) = manager.reload(definitions).await {
                            tracing::error!(?error, "reload failed, previous groups were torn down");
                        } else {
                            tracing::info!("reload complete");
                        }
                    }
                    Err(code) => {
                        tracing::error!("reload aborted: configuration could not be read");
                        supervisor.resume();
                        break Err(code);
                    }
                }
                supervisor.resume();
            }
            None => {
                tracing::error!("signal channel closed unexpectedly");
                break Err(exitcode::IOERR);
            }
        }
    };
    result
}

async fn load_definitions(source: &TomlConfigSource) -> Result<Vec<glacic_core::manager::GroupDefinition>, exitcode::ExitCode> {
    let groups = source.load().await.map_err(|error| {
        tracing::error!(?error, path = ?source.path(), "failed to read configuration");
        exitcode::NOINPUT
    })?;
    let mut definitions = Vec::with_capacity(groups.len());
    for group in groups {
        let definition = group.into_definition().map_err(|error| {
            tracing::error!(?error, "invalid group configuration");
            exitcode::CONFIG
        })?;
        definitions.push(definition);
    }
    Ok(definitions)
}

fn setup_logging(args: &cli::Cli) -> Result<Option<logging::LogReloadHandle>, exitcode::ExitCode> {
    match &args.log_file {
        Some(log_path) => {
            let handle = logging::setup_log_file(log_path).map_err(|error| {
                eprintln!("failed to open log file {}: {error}", log_path.display());
                exitcode::IOERR
            })?;
            Ok(Some(handle))
        }
        None => {
            logging::setup_stdout();
            Ok(None)
        }
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() {
    let args = cli::parse();
    let reload_handle = match setup_logging(&args) {
        Ok(handle) => handle,
        Err(code) => process::exit(code),
    };

    match daemon(args, reload_handle).await {
        Ok(()) => (),
        Err(exitcode::OK) => (),
        Err(code) => {
            tracing::warn!("abnormal exit");
            process::exit(code);
        }
    }
}
