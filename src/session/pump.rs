use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use mavlink::common::{MavAutopilot, MavType};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, trace, warn};

use super::observers::Observers;
use super::SessionConfig;
use crate::core::{ConnectionConfig, ErrorKind};
use crate::engine::operation::{OperationTable, PendingOperation, RefreshProgress, Step};
use crate::params::{self, SharedStore};
use crate::protocol::{DecodedPacket, Endpoint, LinkState, LinkStateMachine, MavlinkCodec, Outbound, MAX_FRAME_SIZE};
use crate::transport::{Transport, TransportError};

/// Requests from the session handle to the pump
#[derive(Debug)]
pub(crate) enum Command {
    Submit(PendingOperation),
    Shutdown,
}

/// Why the pump stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PumpExit {
    /// Shut down by the caller
    Closed,
    /// No heartbeat arrived while connecting
    NoHeartbeat,
    /// Heartbeat stayed away past the grace window
    LinkLost,
    /// The transport failed
    TransportFault(String),
}

/// Applies a transition and reports it exactly once
pub(crate) fn transition(
    machine: &mut LinkStateMachine,
    state_tx: &watch::Sender<LinkState>,
    observers: &Observers,
    next: LinkState,
) {
    let from = machine.state();
    if let Some(event) = machine.transition(next) {
        info!(%from, to = %next, "Link state changed");
        state_tx.send_replace(next);
        observers.notify_connection(&event);
    }
}

/// The message pump: sole owner of the transport, the link state and the
/// operation table, and sole writer of the parameter store
pub(crate) struct Pump {
    transport: Box<dyn Transport>,
    codec: MavlinkCodec,
    rx_buffer: BytesMut,
    tx_buffer: BytesMut,
    machine: LinkStateMachine,
    state_tx: watch::Sender<LinkState>,
    commands: mpsc::Receiver<Command>,
    operations: OperationTable,
    store: SharedStore,
    observers: Arc<Observers>,
    connection: ConnectionConfig,
    interval: Duration,
    gcs_heartbeat_interval: Option<Duration>,
    target: Endpoint,
    target_locked: bool,
    opened_at: Instant,
    last_heartbeat: Option<Instant>,
    degraded_at: Option<Instant>,
    next_gcs_heartbeat: Option<Instant>,
}

impl Pump {
    pub(crate) fn new(
        config: &SessionConfig,
        transport: Box<dyn Transport>,
        machine: LinkStateMachine,
        state_tx: watch::Sender<LinkState>,
        commands: mpsc::Receiver<Command>,
        store: SharedStore,
        observers: Arc<Observers>,
    ) -> Self {
        let now = Instant::now();
        Pump {
            transport,
            codec: MavlinkCodec::new(config.source),
            rx_buffer: BytesMut::with_capacity(4096),
            tx_buffer: BytesMut::with_capacity(MAX_FRAME_SIZE),
            machine,
            state_tx,
            commands,
            operations: OperationTable::new(),
            store,
            observers,
            connection: config.connection.clone(),
            interval: config.message_processing_interval,
            gcs_heartbeat_interval: config.gcs_heartbeat_interval,
            target: Endpoint::default(),
            target_locked: false,
            opened_at: now,
            last_heartbeat: None,
            degraded_at: None,
            next_gcs_heartbeat: config.gcs_heartbeat_interval.map(|_| now),
        }
    }

    /// Runs until shutdown, link loss or a transport fault
    pub(crate) async fn run(mut self) -> PumpExit {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(exit) = self.tick(Instant::now()) {
                        return self.finish(exit);
                    }
                }

                command = self.commands.recv() => match command {
                    Some(Command::Submit(op)) => {
                        debug!(request = ?op.request(), "Operation submitted");
                        let now = Instant::now();
                        let step = self.operations.submit(op, now, self.target);
                        if let Err(exit) = self.apply(step) {
                            return self.finish(exit);
                        }
                    }
                    Some(Command::Shutdown) | None => return self.finish(PumpExit::Closed),
                },
            }
        }
    }

    /// One poll of the transport plus liveness and deadline checks
    fn tick(&mut self, now: Instant) -> Result<(), PumpExit> {
        match self.transport.read_available() {
            Ok(bytes) if !bytes.is_empty() => {
                trace!(len = bytes.len(), "Read bytes");
                self.rx_buffer.extend_from_slice(&bytes);
            }
            Ok(_) => {}
            Err(e) => return Err(fault(e)),
        }

        loop {
            match self.codec.decode(&mut self.rx_buffer) {
                Ok(Some(packet)) => self.handle_packet(packet, now)?,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable input");
                    self.rx_buffer.clear();
                    break;
                }
            }
        }

        self.check_liveness(now)?;
        self.send_gcs_heartbeat(now)?;

        let step = self.operations.poll(now, self.target, self.refresh_progress());
        self.apply(step)
    }

    fn handle_packet(&mut self, packet: DecodedPacket, now: Instant) -> Result<(), PumpExit> {
        match packet {
            DecodedPacket::Heartbeat { source, mav_type, autopilot } => {
                if mav_type == MavType::MAV_TYPE_GCS {
                    return Ok(());
                }
                if !self.target_locked {
                    info!(system_id = source.system_id, component_id = source.component_id, ?autopilot, "Vehicle found");
                    self.target = source;
                    self.target_locked = true;
                } else if source != self.target {
                    trace!(?source, "Ignoring heartbeat from another vehicle");
                    return Ok(());
                }

                self.last_heartbeat = Some(now);
                match self.machine.state() {
                    LinkState::Connecting => self.set_state(LinkState::Connected),
                    LinkState::Degraded => {
                        info!("Heartbeat restored");
                        self.degraded_at = None;
                        self.set_state(LinkState::Connected);
                    }
                    _ => {}
                }
                Ok(())
            }
            DecodedPacket::ParamValue { name, value, param_type, index, count } => {
                debug!(param = %name, %value, index, count, "Parameter value");
                let info = {
                    let mut store = params::write(&self.store);
                    store.upsert(&name, value, param_type, index, count);
                    store.get(&name)
                };
                if let Some(info) = info {
                    self.observers.notify_parameter(&info);
                }

                let step = self.operations.on_param_value(&name, value, index, now, self.target);
                self.apply(step)?;
                let step = self.operations.on_refresh_progress(self.refresh_progress(), now, self.target);
                self.apply(step)
            }
            other => {
                trace!(packet = ?other, "Ignoring packet");
                Ok(())
            }
        }
    }

    fn check_liveness(&mut self, now: Instant) -> Result<(), PumpExit> {
        let heartbeat_timeout = self.connection.heartbeat_timeout;
        match self.machine.state() {
            LinkState::Connecting => {
                if now.duration_since(self.opened_at) >= heartbeat_timeout {
                    warn!(timeout = ?heartbeat_timeout, "No heartbeat from vehicle");
                    return Err(PumpExit::NoHeartbeat);
                }
            }
            LinkState::Connected => {
                let last = self.last_heartbeat.unwrap_or(self.opened_at);
                if now.duration_since(last) >= heartbeat_timeout {
                    warn!(silence = ?now.duration_since(last), "Heartbeat lost, link degraded");
                    self.degraded_at = Some(now);
                    self.set_state(LinkState::Degraded);
                }
            }
            LinkState::Degraded => {
                let since = self.degraded_at.unwrap_or(now);
                if now.duration_since(since) >= self.connection.link_loss_grace {
                    return Err(PumpExit::LinkLost);
                }
            }
            LinkState::Disconnected | LinkState::Closed => {}
        }
        Ok(())
    }

    fn send_gcs_heartbeat(&mut self, now: Instant) -> Result<(), PumpExit> {
        let (Some(period), Some(due)) = (self.gcs_heartbeat_interval, self.next_gcs_heartbeat) else {
            return Ok(());
        };
        if now < due {
            return Ok(());
        }
        self.next_gcs_heartbeat = Some(now + period);
        self.send(Outbound::Heartbeat {
            mav_type: MavType::MAV_TYPE_GCS,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        })
    }

    fn refresh_progress(&self) -> RefreshProgress {
        let store = params::read(&self.store);
        RefreshProgress {
            received: store.received_count(),
            total: store.total_count(),
            complete: store.is_refresh_complete(),
        }
    }

    /// Writes the step's messages and broadcasts its results
    fn apply(&mut self, step: Step) -> Result<(), PumpExit> {
        for result in &step.completed {
            debug!(kind = %result.kind, param = ?result.name, success = result.success, "Operation finished");
            self.observers.notify_operation(result);
        }
        for message in step.sends {
            if matches!(message, Outbound::ParamRequestList { .. }) {
                params::write(&self.store).begin_refresh();
            }
            self.send(message)?;
        }
        Ok(())
    }

    fn send(&mut self, message: Outbound) -> Result<(), PumpExit> {
        self.tx_buffer.clear();
        if let Err(e) = self.codec.encode(message, &mut self.tx_buffer) {
            // Requests are validated before they reach the pump
            warn!(error = %e, "Failed to encode message");
            return Ok(());
        }
        self.transport.write(&self.tx_buffer).map_err(fault)
    }

    fn set_state(&mut self, next: LinkState) {
        transition(&mut self.machine, &self.state_tx, &self.observers, next);
    }

    /// Resolves everything still pending and moves to the final state
    fn finish(mut self, exit: PumpExit) -> PumpExit {
        let (final_state, error, message) = match &exit {
            PumpExit::Closed => (LinkState::Closed, ErrorKind::Cancelled, "session closed".to_string()),
            PumpExit::NoHeartbeat => (
                LinkState::Disconnected,
                ErrorKind::ConnectTimeout,
                "no heartbeat from vehicle".to_string(),
            ),
            PumpExit::LinkLost => (LinkState::Disconnected, ErrorKind::LinkLost, "heartbeat lost".to_string()),
            PumpExit::TransportFault(reason) => (LinkState::Disconnected, ErrorKind::LinkLost, reason.clone()),
        };

        let now = Instant::now();
        let step = self.operations.fail_all(error, &message, now);
        for result in &step.completed {
            self.observers.notify_operation(result);
        }

        // Nothing submitted after this point reaches the wire
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Submit(op) = command {
                if let Some(result) = op.abandon(error, &message, now) {
                    self.observers.notify_operation(&result);
                }
            }
        }

        self.transport.close();
        self.set_state(final_state);
        match &exit {
            PumpExit::Closed => info!("Session closed"),
            other => warn!(reason = ?other, "Session ended"),
        }
        exit
    }
}

fn fault(err: TransportError) -> PumpExit {
    warn!(error = %err, "Transport fault");
    PumpExit::TransportFault(err.to_string())
}
