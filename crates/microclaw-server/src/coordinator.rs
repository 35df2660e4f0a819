//! The single owner of the device link and everything attached to it.

use std::sync::Arc;
use std::time::Duration;

use microclaw_core::{ConfigStorage, DeviceConfig};
use microclaw_protocol::{FlashReport, SessionStatus};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::hub::{BroadcastHub, Subscription};
use crate::link::LinkOpener;
use crate::orchestrator::{FlashLayout, Orchestrator, OrchestratorConfig};
use crate::poller::{Poller, DEFAULT_POLL_INTERVAL};
use crate::session::SessionManager;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Time between status requests.
    pub poll_interval: Duration,
    pub orchestrator: OrchestratorConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

/// Handles to the read loop and poller.
pub struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Stop both activities and wait for them to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        debug!("Background tasks stopped");
    }
}

/// Owns the link, the subscriber set and the exclusive flag; exposes the
/// device operations to the outer surface.
pub struct Coordinator {
    session: Arc<SessionManager>,
    orchestrator: Orchestrator,
    storage: Arc<dyn ConfigStorage>,
    poll_interval: Duration,
}

impl Coordinator {
    pub fn new(
        opener: Arc<dyn LinkOpener>,
        storage: Arc<dyn ConfigStorage>,
        config: CoordinatorConfig,
    ) -> Self {
        let hub = Arc::new(BroadcastHub::new());
        let session = Arc::new(SessionManager::new(opener, hub));
        let orchestrator = Orchestrator::new(
            Arc::clone(&session),
            Arc::clone(&storage),
            config.orchestrator,
        );
        Self {
            session,
            orchestrator,
            storage,
            poll_interval: config.poll_interval,
        }
    }

    /// Spawn the read loop and the poller.
    pub fn start(&self) -> BackgroundTasks {
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(Arc::clone(&self.session).run_reader(cancel.clone()));
        let poller = Poller::new(Arc::clone(&self.session), self.poll_interval);
        let poller = tokio::spawn(poller.run(cancel.clone()));
        info!("Coordinator started (poll every {:?})", self.poll_interval);
        BackgroundTasks {
            cancel,
            handles: vec![reader, poller],
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        self.session.hub()
    }

    pub fn orchestrator_config(&self) -> &OrchestratorConfig {
        self.orchestrator.config()
    }

    pub fn list_ports(&self) -> Vec<String> {
        self.session.list_ports()
    }

    pub async fn status(&self) -> SessionStatus {
        self.session.status().await
    }

    pub async fn connect(&self, port: &str) -> Result<()> {
        self.session.connect(port).await
    }

    pub async fn disconnect(&self) -> bool {
        self.session.disconnect().await
    }

    pub async fn send(&self, command: &str) -> Result<()> {
        self.session.send(command).await
    }

    pub fn subscribe(&self) -> Subscription {
        self.hub().subscribe()
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.hub().unsubscribe(subscription)
    }

    pub async fn flash(&self, layout: FlashLayout, port: &str) -> Result<FlashReport> {
        self.orchestrator.flash(layout, port).await
    }

    pub async fn build_and_flash(&self, port: &str) -> Result<FlashReport> {
        self.orchestrator.build_and_flash(port).await
    }

    pub fn load_config(&self) -> Result<DeviceConfig> {
        Ok(self.storage.load()?)
    }

    /// Replace the stored configuration document.
    pub fn save_config(&self, config: &DeviceConfig) -> Result<()> {
        self.storage.save(config)?;
        info!("Device configuration saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MemoryOpener;
    use microclaw_core::{EventTag, MemoryConfigStorage};

    #[tokio::test]
    async fn test_background_reader_publishes_and_stops() {
        let opener = MemoryOpener::new(["/dev/ttyUSB0"]);
        let coordinator = Coordinator::new(
            Arc::new(opener.clone()),
            Arc::new(MemoryConfigStorage::default()),
            CoordinatorConfig::default(),
        );
        let tasks = coordinator.start();
        let mut sub = coordinator.subscribe();

        coordinator.connect("/dev/ttyUSB0").await.unwrap();
        opener.push_incoming(b"{\"heap_free\": 12000}\n");

        let connected = sub.recv().await.unwrap();
        assert_eq!(connected.tag, EventTag::System);
        let status = sub.recv().await.unwrap();
        assert_eq!(status.tag, EventTag::SysInfo);

        tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let coordinator = Coordinator::new(
            Arc::new(MemoryOpener::default()),
            Arc::new(MemoryConfigStorage::default()),
            CoordinatorConfig::default(),
        );
        let config = DeviceConfig {
            wifi_ssid: "home".to_string(),
            ..Default::default()
        };
        coordinator.save_config(&config).unwrap();
        assert_eq!(coordinator.load_config().unwrap(), config);
    }
}
