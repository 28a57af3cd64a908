//! Medisense bridge daemon
//!
//! Reads the serial sensors into the shared registry and serves the latest
//! measurements to kiosk clients over TCP.
//!
//! # Tasks
//! - one acquisition task per serial channel, or a single simulator
//! - the TCP listener, one task per client session
//! - the liveness monitor, which restarts the others and logs status
//!
//! Every task observes one [`CancellationToken`]; cancelling it closes the
//! transports and sessions, and [`Bridge::wait`] returns once all have exited.

pub mod acquisition;
pub mod channel;
pub mod monitor;
pub mod server;
pub mod simulator;
pub mod state;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ms_core::{BridgeConfig, SensorCatalog, SensorRegistry};
use ms_error::Result;

use crate::monitor::SupervisedTask;
use crate::server::ServerLimits;
use crate::state::BridgeState;
use crate::transport::Connector;

pub use crate::state::AcquisitionMode;
pub use crate::transport::SerialConnector;

/// A running bridge
pub struct Bridge {
    state: Arc<BridgeState>,
    local_addr: SocketAddr,
    monitor: JoinHandle<()>,
}

impl Bridge {
    /// Start acquisition, the server and the liveness monitor.
    ///
    /// `config` must already be validated; `catalog` is the result of that
    /// validation.
    pub async fn launch(
        config: &BridgeConfig,
        catalog: SensorCatalog,
        connector: Arc<dyn Connector>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let registry = Arc::new(SensorRegistry::new(Arc::new(catalog)));
        let ports = config.enabled_channels().map(|c| c.port.clone()).collect();
        let state = Arc::new(BridgeState::new(registry, ports));

        // Bind first so an unusable address fails start-up before any port is opened
        let listener = Arc::new(server::bind(&config.server.bind).await?);
        let local_addr = listener.local_addr()?;

        let mut tasks =
            acquisition::start_acquisition(config, &state, connector, cancel.clone()).await;
        info!("STARTUP: acquisition mode {}", state.mode());

        let limits = ServerLimits::from(&config.server);
        let server_state = state.clone();
        let server_cancel = cancel.clone();
        tasks.push(SupervisedTask::spawn("server", move || {
            tokio::spawn(server::run_server(
                listener.clone(),
                server_state.clone(),
                limits,
                server_cancel.clone(),
            ))
        }));

        let monitor = tokio::spawn(monitor::run_monitor(
            tasks,
            state.clone(),
            config.timing.heartbeat(),
            config.timing.status_every_heartbeats,
            cancel,
        ));

        Ok(Self {
            state,
            local_addr,
            monitor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &Arc<BridgeState> {
        &self.state
    }

    /// Wait until every task has stopped after cancellation
    pub async fn wait(self) {
        if let Err(e) = self.monitor.await {
            warn!("SHUTDOWN: monitor ended abnormally: {}", e);
        }
    }
}
