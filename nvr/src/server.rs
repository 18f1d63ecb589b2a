//! Recorder lifecycle management
//!
//! Brings up and tears down, in order:
//! - the broker (launched or adopted)
//! - the stream registry and its initial sync
//! - the health monitor
//! - one media session per enabled camera

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};

use nvr_broker::{
    BrokerClient, BrokerSupervisor, HealthMonitor, HealthOptions, StreamRegistry, SupervisorOptions,
};
use nvr_core::{Config, StreamStateTable};
use nvr_livestream::{ManagerOptions, MediaSessionManager, MemoryRecordingIndex, RtspOpener, WriterRegistry};

const SUPERVISOR_STOP_TIMEOUT: Duration = Duration::from_secs(15);

pub struct NvrServer {
    supervisor: Arc<BrokerSupervisor>,
    registry: Arc<StreamRegistry>,
    health: HealthMonitor,
    manager: MediaSessionManager,
}

impl NvrServer {
    /// Initialize every component. Any error here is fatal for the process.
    pub async fn init(config: &Config) -> anyhow::Result<Self> {
        ensure_storage(&config.recording.hls_root()).await?;
        ensure_storage(&config.recording.mp4_root()).await?;

        let client = Arc::new(BrokerClient::from_config(&config.broker).context("Invalid broker API settings")?);
        let supervisor = Arc::new(
            BrokerSupervisor::init(SupervisorOptions::from_config(config), client.clone())
                .await
                .context("Failed to initialize broker supervisor")?,
        );
        supervisor.start().await.context("Broker unavailable")?;

        let registry = Arc::new(StreamRegistry::new(client, supervisor.clone()));
        let report = registry.sync_from_source(&config.streams).await;
        if report.failed > 0 {
            warn!(failed = report.failed, "Some streams could not be registered, sessions will retry");
        }

        let writers = Arc::new(WriterRegistry::new());
        let states = StreamStateTable::new();
        let manager = MediaSessionManager::new(
            registry.clone(),
            Arc::new(RtspOpener::new()),
            Arc::new(MemoryRecordingIndex::new()),
            writers.clone(),
            states.clone(),
            ManagerOptions::from_config(&config.recording),
        );
        let health = HealthMonitor::new(HealthOptions::from(&config.health), registry.clone(), states, writers);

        Ok(Self {
            supervisor,
            registry,
            health,
            manager,
        })
    }

    /// Start sessions and monitoring, then wait for a shutdown signal.
    pub async fn start(self) -> anyhow::Result<()> {
        info!(policy = ?self.manager.options().hls_policy, "Starting NVR...");

        self.health.start();

        let streams = self.registry.enabled_streams();
        for desc in &streams {
            if let Err(e) = self.manager.start_recording(&desc.name).await {
                error!(stream = %desc.name, error = %e, "Failed to start recording");
            }
            if let Err(e) = self.manager.start_hls(&desc.name).await {
                error!(stream = %desc.name, error = %e, "Failed to start HLS");
            }
        }
        info!(streams = streams.len(), "All streams started");

        shutdown_signal().await;
        info!("Shutdown signal received, starting graceful shutdown...");

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&self) {
        info!("Shutting down NVR...");

        // 1. No restarts while sessions wind down
        self.health.stop().await;

        // 2. Close every writer (bounded per session)
        self.manager.stop_all().await;

        // 3. Broker last; an adopted broker is left running
        match tokio::time::timeout(SUPERVISOR_STOP_TIMEOUT, self.supervisor.stop()).await {
            Ok(Ok(())) => info!("Broker stopped"),
            Ok(Err(e)) => error!(error = %e, "Failed to stop broker"),
            Err(_) => warn!("Broker did not stop within {:?}", SUPERVISOR_STOP_TIMEOUT),
        }

        info!("NVR shut down");
    }
}

/// Create a storage root and prove it accepts files.
async fn ensure_storage(dir: &Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Cannot create storage directory {}", dir.display()))?;
    let probe = dir.join(".nvr_write_test");
    tokio::fs::write(&probe, b"")
        .await
        .with_context(|| format!("Storage directory {} is not writable", dir.display()))?;
    let _ = tokio::fs::remove_file(&probe).await;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
