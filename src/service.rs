use anyhow::Result;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use crate::config::Config;
use crate::dispatcher::QueryDispatcher;
use crate::resolver::{PidInterfaceMap, SystemResolver};
use crate::server::CommandServer;
use crate::supervisor::{SharedSupervisor, TetherSupervisor};

/// Resolves once Ctrl-C or SIGTERM arrives.
pub async fn shutdown_signal() -> Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Interrupt received");
        }
        _ = terminate.recv() => {
            info!("SIGTERM received");
        }
    }
    Ok(())
}

/// Stops the forwarding helper if one is still running.
pub async fn shutdown(supervisor: &SharedSupervisor) {
    if let Err(e) = supervisor.lock().await.stop().await {
        error!("Failed to stop tethering on shutdown: {}", e);
    }
}

pub async fn run_daemon(config: Config) -> Result<()> {
    let socket_path = config.socket_path()?;

    let resolver = Arc::new(SystemResolver::new()?);
    let iface_lookup = Arc::new(PidInterfaceMap::new());
    let dispatcher = Arc::new(QueryDispatcher::new(resolver, iface_lookup));
    let supervisor = TetherSupervisor::from_config(&config).into_shared();

    let server = CommandServer::new(socket_path.clone(), dispatcher, Arc::clone(&supervisor));

    tokio::select! {
        res = server.run() => {
            if let Err(e) = &res {
                error!("Command server stopped: {}", e);
            }
            shutdown(&supervisor).await;
            res?;
        }
        res = shutdown_signal() => {
            info!("Service shutdown requested");
            shutdown(&supervisor).await;
            res?;
        }
    }

    if let Err(e) = std::fs::remove_file(&socket_path) {
        info!("Socket {} not removed: {}", socket_path.display(), e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::ForwardingGate;
    use crate::interface::ProcSysConfigurator;
    use crate::supervisor::HelperCommand;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_shutdown_signal_waits() {
        // Nothing sends a signal here, so the future must still be pending.
        let result = tokio::time::timeout(Duration::from_millis(100), shutdown_signal()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_when_idle() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let supervisor = TetherSupervisor::new(
            ForwardingGate::new(dir.path().join("v4"), dir.path().join("v6")),
            Box::new(ProcSysConfigurator::new(dir.path())),
            HelperCommand::default(),
        )
        .into_shared();

        shutdown(&supervisor).await;
        assert!(!supervisor.lock().await.is_started());
    }

    #[tokio::test]
    async fn test_run_daemon_rejects_relative_socket() {
        let config = Config {
            socket_path: "netd.sock".to_string(),
            ..Config::default()
        };
        assert!(run_daemon(config).await.is_err());
    }
}
