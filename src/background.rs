//! Boot sequence and wiring of the background core.
//!
//! `initialize` loads and migrates the stored state, builds the controller
//! with its collaborators and starts the side pipelines that react to its
//! events: persistence, the badge, failed-transaction reports, node-call
//! metrics, the client-open flag and polling. `Background::serve` then opens
//! the session listeners and the status API.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ItrustConfig;
use crate::controller::{Controller, ControllerDeps, ControllerEvent};
use crate::keyring::{DevKeyring, TxSigner};
use crate::migration::Migrator;
use crate::network::{NetworkClient, NetworkController};
use crate::notification::ApprovalCoordinator;
use crate::platform::Platform;
use crate::reporting::{report_failed_tx, ErrorReporter, MetricsEntry, MetricsSink};
use crate::router::SessionRouter;
use crate::session::SessionRegistry;
use crate::state::first_time_state;
use crate::storage::Storage;
use crate::transaction::TxStatus;
use crate::transport::{self, TransportHandle};

pub use crate::persistence::InitError;

/// External collaborators the background runs against.
pub struct BackgroundDeps {
    pub storage: Arc<dyn Storage>,
    pub platform: Arc<dyn Platform>,
    pub node: Arc<dyn NetworkClient>,
    pub reporter: Arc<dyn ErrorReporter>,
    pub metrics: Arc<dyn MetricsSink>,
}

/// A running background core.
pub struct Background {
    pub controller: Arc<Controller>,
    pub sessions: Arc<SessionRegistry>,
    pub router: Arc<SessionRouter>,
    pub coordinator: Arc<ApprovalCoordinator>,
    /// Nothing was stored before this boot.
    pub first_install: bool,
    config: ItrustConfig,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Load state, build the controller and start its side pipelines.
pub async fn initialize(config: ItrustConfig, deps: BackgroundDeps) -> Result<Background, InitError> {
    let keyring = Arc::new(DevKeyring::from_seed(&config.keyring.seed, config.keyring.accounts));
    let seed = first_time_state(
        &config.network,
        &keyring.accounts(),
        &config.first_time_overrides(),
    );
    let loaded = crate::persistence::load_state(
        deps.storage.as_ref(),
        &Migrator::with_registered(),
        deps.reporter.as_ref(),
        seed,
    )?;
    tracing::info!(
        "Loaded wallet state at version {} (first install: {})",
        loaded.meta.version,
        loaded.first_install
    );

    let network = Arc::new(NetworkController::new(
        deps.node,
        loaded.state.provider.clone(),
        &loaded.state.network,
    ));
    let sessions = Arc::new(SessionRegistry::new());
    let coordinator = Arc::new(ApprovalCoordinator::new(
        deps.platform.clone(),
        sessions.clone(),
    ));
    let controller = Controller::new(
        loaded.state,
        ControllerDeps {
            network: network.clone(),
            signer: keyring,
            confirmation: coordinator.clone(),
            polling_interval: Duration::from_millis(config.background.polling_interval_ms),
        },
    );
    let router = Arc::new(SessionRouter::new(
        controller.clone(),
        sessions.clone(),
        &config.transport,
        Some(config.background.extension_id.clone()),
    ));

    let cancel = CancellationToken::new();
    let tasks = vec![
        crate::persistence::spawn_persistence(
            controller.clone(),
            deps.storage,
            loaded.meta,
            Duration::from_millis(config.background.persist_debounce_ms),
            cancel.clone(),
        ),
        crate::badge::spawn_badge_updater(
            controller.clone(),
            deps.platform.clone(),
            config.platform.badge_color.clone(),
            cancel.clone(),
        ),
        spawn_failed_tx_reporter(controller.clone(), deps.reporter.clone(), cancel.clone()),
        spawn_metrics_forwarder(&network, deps.metrics, cancel.clone()),
        spawn_client_open_forwarder(controller.clone(), &sessions, cancel.clone()),
        controller.spawn_polling(cancel.clone()),
    ];

    for id in controller.interrupted_at_boot() {
        if let Some(tx) = controller.transaction(*id).await {
            report_failed_tx(deps.reporter.as_ref(), &tx);
        }
    }

    if loaded.first_install && !config.background.debug {
        if let Err(e) = deps.platform.open_extension_in_browser().await {
            tracing::warn!("Could not open onboarding page: {}", e);
        }
    }

    tracing::debug!("iTrust initialization complete");
    Ok(Background {
        controller,
        sessions,
        router,
        coordinator,
        first_install: loaded.first_install,
        config,
        cancel,
        tasks,
    })
}

impl Background {
    /// Open the session listeners and the status API.
    pub async fn serve(&mut self) -> Result<TransportHandle, InitError> {
        let internal = self
            .config
            .internal_addr()
            .map_err(|e| InitError::Config(format!("transport.internal: {}", e)))?;
        let external = self
            .config
            .external_addr()
            .map_err(|e| InitError::Config(format!("transport.external: {}", e)))?;
        let rpc_addr = self
            .config
            .rpc_addr()
            .map_err(|e| InitError::Config(format!("rpc: {}", e)))?;

        let handle = transport::start(
            self.router.clone(),
            internal,
            external,
            self.config.transport.ui_token.clone(),
            self.cancel.clone(),
        )
        .await
        .map_err(|e| InitError::Service {
            service: "session transport",
            reason: e.to_string(),
        })?;

        let rpc_state = crate::rpc::RpcState {
            controller: self.controller.clone(),
            sessions: self.sessions.clone(),
        };
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = crate::rpc::serve(rpc_addr, rpc_state, cancel).await {
                tracing::error!("Status API failed: {}", e);
            }
        }));
        Ok(handle)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop every pipeline, writing the state one last time.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
        tracing::info!("iTrust background stopped");
    }
}

fn spawn_failed_tx_reporter(
    controller: Arc<Controller>,
    reporter: Arc<dyn ErrorReporter>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut events = controller.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = cancel.cancelled() => return,
            };
            match event {
                Ok(ControllerEvent::TxStatusUpdate {
                    id,
                    status: TxStatus::Failed,
                }) => {
                    if let Some(tx) = controller.transaction(id).await {
                        report_failed_tx(reporter.as_ref(), &tx);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => tracing::warn!("Failed-transaction reporter missed {} events", n),
                Err(RecvError::Closed) => return,
            }
        }
    })
}

fn spawn_metrics_forwarder(
    network: &NetworkController,
    metrics: Arc<dyn MetricsSink>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut requests = network.subscribe_requests();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Ok(data) => metrics.submit(MetricsEntry::rpc(data)),
                    Err(RecvError::Lagged(n)) => tracing::debug!("Metrics dropped {} node calls", n),
                    Err(RecvError::Closed) => return,
                },
                _ = cancel.cancelled() => return,
            }
        }
    })
}

fn spawn_client_open_forwarder(
    controller: Arc<Controller>,
    sessions: &SessionRegistry,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut open = sessions.subscribe_client_open();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = open.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let now_open = *open.borrow_and_update();
                    controller.set_client_open(now_open).await;
                }
                _ = cancel.cancelled() => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::PlatformConfig;
    use crate::network::testing::{happy_node, MockNetwork};
    use crate::network::NetworkError;
    use crate::platform::HeadlessPlatform;
    use crate::reporting::testing::{RecordingMetrics, RecordingReporter};
    use crate::session::{Port, PortSender};
    use crate::storage::SledStorage;
    use crate::transaction::TxParams;

    struct Fixture {
        storage: Arc<SledStorage>,
        platform: Arc<HeadlessPlatform>,
        reporter: Arc<RecordingReporter>,
        metrics: Arc<RecordingMetrics>,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                storage: Arc::new(SledStorage::open_temporary().unwrap()),
                platform: Arc::new(HeadlessPlatform::new(PlatformConfig::default())),
                reporter: Arc::new(RecordingReporter::default()),
                metrics: Arc::new(RecordingMetrics::default()),
            }
        }

        async fn boot(&self, node: MockNetwork, debug: bool) -> Background {
            let mut config = ItrustConfig::default();
            config.background.debug = debug;
            config.background.persist_debounce_ms = 10;
            config.background.polling_interval_ms = 20;
            initialize(
                config,
                BackgroundDeps {
                    storage: self.storage.clone(),
                    platform: self.platform.clone(),
                    node: Arc::new(node),
                    reporter: self.reporter.clone(),
                    metrics: self.metrics.clone(),
                },
            )
            .await
            .unwrap()
        }
    }

    #[tokio::test]
    async fn onboarding_opens_on_first_install_only() {
        let fixture = Fixture::new();
        let background = fixture.boot(happy_node(), false).await;
        assert!(background.first_install);
        background.shutdown().await;
        assert_eq!(fixture.platform.snapshot().extension_opened, 1);

        let background = fixture.boot(happy_node(), false).await;
        assert!(!background.first_install);
        background.shutdown().await;
        assert_eq!(fixture.platform.snapshot().extension_opened, 1);
    }

    #[tokio::test]
    async fn debug_mode_skips_onboarding() {
        let fixture = Fixture::new();
        let background = fixture.boot(happy_node(), true).await;
        background.shutdown().await;
        assert_eq!(fixture.platform.snapshot().extension_opened, 0);
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let fixture = Fixture::new();
        let background = fixture.boot(happy_node(), true).await;
        let account = background
            .controller
            .persisted_state()
            .await
            .selected_address
            .unwrap();
        background
            .controller
            .set_account_label(&account, "Cold")
            .await
            .unwrap();
        background.shutdown().await;

        let background = fixture.boot(happy_node(), true).await;
        let state = background.controller.persisted_state().await;
        assert_eq!(state.identities[&account].name, "Cold");
        background.shutdown().await;
    }

    #[tokio::test]
    async fn failed_broadcast_is_reported_and_metered() {
        let fixture = Fixture::new();
        let node = happy_node();
        node.set(
            "eth_sendRawTransaction",
            Err(NetworkError::Rpc {
                code: -32000,
                message: "nonce too low".into(),
            }),
        );
        let background = fixture.boot(node, true).await;
        let controller = background.controller.clone();
        let account = controller.persisted_state().await.selected_address.unwrap();
        let id = controller
            .submit_transaction_request(
                TxParams {
                    from: account,
                    to: Some("0x6b175474e89094c44da98b954eedeac495271d0f".into()),
                    ..Default::default()
                },
                "https://dapp.example",
            )
            .await
            .unwrap();
        assert!(controller.approve_transaction(id).await.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let messages = fixture.reporter.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].0.starts_with("Transaction Failed"));
        let entries = fixture.metrics.entries.lock().unwrap().clone();
        assert!(entries.iter().all(|e| e.kind == "rpc"));
        assert!(entries
            .iter()
            .any(|e| e.data["method"] == json!("eth_sendRawTransaction")));
        background.shutdown().await;
    }

    #[tokio::test]
    async fn transactions_interrupted_by_restart_are_reported() {
        let fixture = Fixture::new();
        let background = fixture.boot(happy_node(), true).await;
        let controller = background.controller.clone();
        let account = controller.persisted_state().await.selected_address.unwrap();
        let id = controller
            .submit_transaction_request(
                TxParams {
                    from: account,
                    to: Some("0x6b175474e89094c44da98b954eedeac495271d0f".into()),
                    ..Default::default()
                },
                "https://dapp.example",
            )
            .await
            .unwrap();
        controller
            .update_transaction_status(id, TxStatus::Approved, "approved before crash")
            .await
            .unwrap();
        background.shutdown().await;
        assert!(fixture.reporter.messages.lock().unwrap().is_empty());

        let background = fixture.boot(happy_node(), true).await;
        assert_eq!(background.controller.interrupted_at_boot(), &[id]);
        assert_eq!(
            background.controller.transaction(id).await.unwrap().status,
            TxStatus::Failed
        );
        let messages = fixture.reporter.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].0.contains("interrupted by restart"));
        assert_eq!(messages[0].1["txMeta"]["id"], json!(id));
        background.shutdown().await;
    }

    #[tokio::test]
    async fn client_open_follows_sessions() {
        let fixture = Fixture::new();
        let background = fixture.boot(happy_node(), true).await;
        let (port, remote) = Port::pair("popup", PortSender::default());
        let session = background.router.on_connect(port).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(background.controller.is_client_open().await);

        drop(remote);
        session.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!background.controller.is_client_open().await);
        background.shutdown().await;
    }
}
