//! Link session module
//!
//! A `LinkSession` is one connection to one vehicle: it opens the transport,
//! spawns the pump task that owns it, and hands operations to the pump over a
//! channel. A reconnect creates a new session.

mod observers;
mod pump;

pub use self::observers::{
    ConnectionCallback, Observers, OperationCallback, ParameterCallback, ALL_PARAMETERS,
};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use self::pump::{transition, Command, Pump, PumpExit};
use crate::core::{ConnectionConfig, Error, ManagerConfig, Result};
use crate::engine::operation::PendingOperation;
use crate::params::SharedStore;
use crate::protocol::{Endpoint, LinkState, LinkStateMachine};
use crate::transport::TransportOpener;

const COMMAND_QUEUE_DEPTH: usize = 64;

/// Settings a session runs with; fixed for the session's lifetime
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub connection: ConnectionConfig,
    pub message_processing_interval: Duration,
    pub gcs_heartbeat_interval: Option<Duration>,
    /// Our own system and component id
    pub source: Endpoint,
}

impl SessionConfig {
    /// Takes the session settings from a manager config, with a specific link
    pub fn from_manager(config: &ManagerConfig, connection: ConnectionConfig) -> Self {
        SessionConfig {
            connection,
            message_processing_interval: config.message_processing_interval,
            gcs_heartbeat_interval: config.gcs_heartbeat_interval,
            source: Endpoint::new(config.system_id, config.component_id),
        }
    }
}

/// Handle to a running session
pub struct LinkSession {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<LinkState>,
    task: Mutex<Option<JoinHandle<PumpExit>>>,
    config: SessionConfig,
}

impl LinkSession {
    /// Opens the transport and waits for the vehicle's first heartbeat.
    ///
    /// Reports Connecting to observers first, then Connected on success or
    /// Disconnected when the port cannot be opened or stays silent for the
    /// heartbeat timeout.
    pub async fn connect(
        config: SessionConfig,
        opener: Arc<dyn TransportOpener>,
        store: SharedStore,
        observers: Arc<Observers>,
    ) -> Result<LinkSession> {
        let mut machine = LinkStateMachine::new();
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        transition(&mut machine, &state_tx, &observers, LinkState::Connecting);

        info!(port = %config.connection.port, baud_rate = config.connection.baud_rate, "Connecting");
        let transport = match opener.open(&config.connection) {
            Ok(transport) => transport,
            Err(e) => {
                warn!(port = %config.connection.port, error = %e, "Failed to open port");
                transition(&mut machine, &state_tx, &observers, LinkState::Disconnected);
                return Err(e.into());
            }
        };

        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let pump = Pump::new(&config, transport, machine, state_tx, command_rx, store, observers);
        let task = tokio::spawn(pump.run());

        let session = LinkSession {
            commands,
            state: state_rx,
            task: Mutex::new(Some(task)),
            config,
        };

        let settled = {
            let mut state = session.state.clone();
            let result = state.wait_for(|s| *s != LinkState::Connecting).await;
            result.map(|s| *s).unwrap_or(LinkState::Disconnected)
        };
        if settled == LinkState::Connected {
            return Ok(session);
        }

        let exit = match session.take_task() {
            Some(task) => task.await.unwrap_or(PumpExit::TransportFault("session task failed".into())),
            None => PumpExit::Closed,
        };
        Err(match exit {
            PumpExit::NoHeartbeat => Error::ConnectTimeout(session.config.connection.heartbeat_timeout),
            PumpExit::Closed => Error::Cancelled,
            PumpExit::LinkLost => Error::link_lost("heartbeat lost while connecting"),
            PumpExit::TransportFault(reason) => Error::link_lost(reason),
        })
    }

    /// Current link state
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Receiver that follows the link state
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Settings this session was opened with
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Hands an operation to the pump.
    ///
    /// Fails when the pump has already stopped; the operation's receiver then
    /// reports a closed channel.
    pub async fn submit(&self, op: PendingOperation) -> Result<()> {
        self.commands
            .send(Command::Submit(op))
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Stops the pump, cancelling pending operations, and waits for it to exit
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(task) = self.take_task() {
            if let Err(e) = task.await {
                warn!(error = %e, "Session task failed");
            }
        }
    }

    fn take_task(&self) -> Option<JoinHandle<PumpExit>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}
