//! Runtime assembly
//!
//! [`Wallbox`] wires the connection manager, REST session, coordinator,
//! write gateway and keep-alive supervisor together and owns the background
//! tasks and their shutdown signal.

use crate::catalog::RegisterCatalog;
use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::coordinator::{CoordinatorEvent, PollingCoordinator};
use crate::error::Result;
use crate::gateway::WriteGateway;
use crate::keepalive::KeepAliveSupervisor;
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::modbus::{Connector, Endpoint, TcpConnector};
use crate::rest::RestSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Upper bound for each background task to stop after cancellation
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Wallbox {
    connection: Arc<ConnectionManager>,
    rest: Option<Arc<RestSession>>,
    coordinator: Arc<PollingCoordinator>,
    gateway: Arc<WriteGateway>,
    keepalive: Option<Arc<KeepAliveSupervisor>>,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    logger: StructuredLogger,
}

impl Wallbox {
    /// Connect to the configured wallbox over Modbus TCP
    pub async fn start(config: &Config) -> Result<Self> {
        Self::start_with_connector(
            config,
            RegisterCatalog::webasto_next(),
            Arc::new(TcpConnector),
        )
        .await
    }

    /// Start with a custom catalog and transport
    ///
    /// Connects, performs the first refresh and only then spawns the polling
    /// loop and the keep-alive supervisor. Fails when the first refresh
    /// cannot produce a snapshot.
    pub async fn start_with_connector(
        config: &Config,
        catalog: RegisterCatalog,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;

        let endpoint = Endpoint::from_config(&config.modbus);
        let logger =
            get_logger_with_context(LogContext::new("wallbox").with_endpoint(endpoint.to_string()));
        logger.info(&format!("Starting wallbox sync v{}", env!("CARGO_PKG_VERSION")));

        let connection = Arc::new(ConnectionManager::new(endpoint, &config.modbus, connector));
        let rest = config
            .rest
            .enabled
            .then(|| Arc::new(RestSession::new(&config.rest, &config.modbus.host)));
        let coordinator = Arc::new(PollingCoordinator::new(
            Arc::clone(&connection),
            rest.clone(),
            Arc::new(catalog),
            &config.modbus,
            &config.polling,
        )?);
        let gateway = Arc::new(WriteGateway::new(
            Arc::clone(&connection),
            rest.clone(),
            Arc::clone(&coordinator),
            config.hardware.max_current_a,
        ));

        let initial = async {
            connection.connect().await?;
            coordinator.refresh().await
        };
        if let Err(e) = initial.await {
            logger.error(&format!("Initial update failed: {e}"));
            connection.close().await;
            if let Some(rest) = &rest {
                rest.close().await;
            }
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let mut tasks = vec![(
            "polling",
            Arc::clone(&coordinator).spawn(cancel.child_token()),
        )];

        let keepalive = if config.keepalive.enabled {
            let supervisor = Arc::new(KeepAliveSupervisor::new(
                Arc::clone(&connection),
                &config.keepalive,
            ));
            tasks.push((
                "keepalive",
                Arc::clone(&supervisor).spawn(coordinator.watch_latest(), cancel.child_token()),
            ));
            Some(supervisor)
        } else {
            logger.info("Keep-alive disabled");
            None
        };

        logger.info("Wallbox sync running");

        Ok(Self {
            connection,
            rest,
            coordinator,
            gateway,
            keepalive,
            cancel,
            tasks,
            logger,
        })
    }

    pub const fn gateway(&self) -> &Arc<WriteGateway> {
        &self.gateway
    }

    pub const fn coordinator(&self) -> &Arc<PollingCoordinator> {
        &self.coordinator
    }

    pub const fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn keepalive(&self) -> Option<&Arc<KeepAliveSupervisor>> {
        self.keepalive.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.coordinator.subscribe()
    }

    /// Stop background tasks and release both sessions
    ///
    /// Each task gets a bounded time to observe cancellation and is aborted
    /// after that.
    pub async fn shutdown(self) {
        self.logger.info("Shutting down");
        self.cancel.cancel();

        for (name, task) in self.tasks {
            let abort = task.abort_handle();
            match timeout(TASK_STOP_TIMEOUT, task).await {
                Ok(Ok(())) => self.logger.debug(&format!("{name} task stopped")),
                Ok(Err(e)) => self.logger.warn(&format!("{name} task ended abnormally: {e}")),
                Err(_) => {
                    self.logger
                        .warn(&format!("{name} task did not stop in time; aborting"));
                    abort.abort();
                }
            }
        }

        self.connection.close().await;
        if let Some(rest) = &self.rest {
            rest.close().await;
        }
        self.logger.info("Shutdown complete");
    }
}
