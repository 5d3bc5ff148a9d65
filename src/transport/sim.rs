//! In-memory flight controller
//!
//! `SimulatedVehicle` plays the vehicle side of the parameter protocol over a
//! `SimTransport`. It reads the frames we write, answers them after a
//! configurable latency, and sends heartbeats on a timer. Time comes from
//! `tokio::time`, so tests running on a paused clock are deterministic.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use mavlink::common::{MavAutopilot, MavType};
use tokio::time::Instant;
use tracing::trace;

use super::{Transport, TransportError, TransportOpener, TransportResult};
use crate::core::{ConnectionConfig, ParamType, ParamValue};
use crate::protocol::codec::{decode, encode_frame, FrameHeader};
use crate::protocol::message::{DecodedPacket, Endpoint, Outbound};

#[derive(Debug, Clone)]
struct SimParam {
    name: String,
    value: ParamValue,
    param_type: ParamType,
}

#[derive(Debug)]
struct VehicleState {
    endpoint: Endpoint,
    params: Vec<SimParam>,
    heartbeat: bool,
    heartbeat_interval: Duration,
    reply_latency: Duration,
    echo_overrides: HashMap<String, ParamValue>,
    silent: HashSet<String>,
    drop_requests: u32,
    list_limit: Option<usize>,
    io_fault: bool,
    available: bool,
    opens: usize,
    received: Vec<DecodedPacket>,
    sequence: u8,
}

impl VehicleState {
    fn index_of(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }

    fn header(&mut self) -> FrameHeader {
        let header = FrameHeader { sequence: self.sequence, source: self.endpoint };
        self.sequence = self.sequence.wrapping_add(1);
        header
    }

    fn value_frame(&mut self, index: usize) -> Option<Vec<u8>> {
        let param = self.params.get(index)?.clone();
        let count = self.params.len() as u16;
        let message = Outbound::ParamValue {
            name: param.name,
            value: param.value,
            param_type: param.param_type,
            index: index as u16,
            count,
        };
        encode_frame(self.header(), &message).ok()
    }

    fn heartbeat_frame(&mut self) -> Option<Vec<u8>> {
        let message = Outbound::Heartbeat {
            mav_type: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_PX4,
        };
        encode_frame(self.header(), &message).ok()
    }

    /// Consumes one dropped-request token, if any remain
    fn should_drop(&mut self) -> bool {
        if self.drop_requests > 0 {
            self.drop_requests -= 1;
            true
        } else {
            false
        }
    }

    /// Builds the replies to one packet we received
    fn respond(&mut self, packet: &DecodedPacket) -> Vec<Vec<u8>> {
        self.received.push(packet.clone());

        match packet {
            DecodedPacket::ParamRequestList { .. } => {
                if self.should_drop() {
                    return Vec::new();
                }
                let limit = self.list_limit.unwrap_or(self.params.len()).min(self.params.len());
                (0..limit).filter_map(|i| self.value_frame(i)).collect()
            }
            DecodedPacket::ParamRequestRead { name, .. } => {
                if self.should_drop() || self.silent.contains(name) {
                    return Vec::new();
                }
                self.index_of(name)
                    .and_then(|i| self.value_frame(i))
                    .into_iter()
                    .collect()
            }
            DecodedPacket::ParamSet { name, value, .. } => {
                if self.should_drop() || self.silent.contains(name) {
                    return Vec::new();
                }
                let Some(index) = self.index_of(name) else {
                    return Vec::new();
                };
                let stored = self.echo_overrides.get(name).copied().unwrap_or(*value);
                self.params[index].value = stored;
                self.value_frame(index).into_iter().collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Shared handle to a simulated flight controller
#[derive(Debug, Clone)]
pub struct SimulatedVehicle {
    state: Arc<Mutex<VehicleState>>,
}

impl SimulatedVehicle {
    /// A vehicle with no parameters that heartbeats at 1 Hz and answers after 20 ms
    pub fn new() -> Self {
        SimulatedVehicle {
            state: Arc::new(Mutex::new(VehicleState {
                endpoint: Endpoint::new(1, 1),
                params: Vec::new(),
                heartbeat: true,
                heartbeat_interval: Duration::from_secs(1),
                reply_latency: Duration::from_millis(20),
                echo_overrides: HashMap::new(),
                silent: HashSet::new(),
                drop_requests: 0,
                list_limit: None,
                io_fault: false,
                available: true,
                opens: 0,
                received: Vec::new(),
                sequence: 0,
            })),
        }
    }

    /// A vehicle with a small PX4-like parameter table
    pub fn px4() -> Self {
        let vehicle = Self::new();
        vehicle.set_param("SYS_AUTOSTART", ParamValue::Int(4001), ParamType::Int32);
        vehicle.set_param("BAT1_N_CELLS", ParamValue::Int(4), ParamType::Int32);
        vehicle.set_param("MPC_XY_VEL_MAX", ParamValue::Float(12.0), ParamType::Real32);
        vehicle.set_param("MPC_Z_VEL_MAX_UP", ParamValue::Float(3.0), ParamType::Real32);
        vehicle.set_param("COM_RC_LOSS_T", ParamValue::Float(0.5), ParamType::Real32);
        vehicle.set_param("NAV_DLL_ACT", ParamValue::Int(0), ParamType::Int32);
        vehicle.set_param("MAV_SYS_ID", ParamValue::Int(1), ParamType::Uint8);
        vehicle
    }

    fn lock(&self) -> MutexGuard<'_, VehicleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds or replaces a parameter
    pub fn set_param(&self, name: &str, value: ParamValue, param_type: ParamType) {
        let mut state = self.lock();
        let param = SimParam { name: name.to_string(), value, param_type };
        match state.index_of(name) {
            Some(i) => state.params[i] = param,
            None => state.params.push(param),
        }
    }

    /// Current value of a parameter on the vehicle
    pub fn param(&self, name: &str) -> Option<ParamValue> {
        let state = self.lock();
        state.index_of(name).map(|i| state.params[i].value)
    }

    pub fn param_count(&self) -> usize {
        self.lock().params.len()
    }

    /// Sets the system and component id the vehicle sends as
    pub fn set_endpoint(&self, endpoint: Endpoint) {
        self.lock().endpoint = endpoint;
    }

    /// Turns the heartbeat on or off
    pub fn set_heartbeat(&self, enabled: bool) {
        self.lock().heartbeat = enabled;
    }

    pub fn set_heartbeat_interval(&self, interval: Duration) {
        self.lock().heartbeat_interval = interval;
    }

    /// Delay between receiving a request and the reply becoming readable
    pub fn set_reply_latency(&self, latency: Duration) {
        self.lock().reply_latency = latency;
    }

    /// Makes sets of `name` store and echo `value` instead of the requested value
    pub fn set_echo_override(&self, name: &str, value: ParamValue) {
        self.lock().echo_overrides.insert(name.to_string(), value);
    }

    /// Never answer requests for `name`
    pub fn set_silent(&self, name: &str) {
        self.lock().silent.insert(name.to_string());
    }

    /// Ignore the next `count` requests
    pub fn drop_next_requests(&self, count: u32) {
        self.lock().drop_requests = count;
    }

    /// Only send the first `limit` parameters in reply to a list request
    pub fn set_list_limit(&self, limit: Option<usize>) {
        self.lock().list_limit = limit;
    }

    /// Makes reads and writes on open transports fail, like an unplugged cable
    pub fn set_io_fault(&self, fault: bool) {
        self.lock().io_fault = fault;
    }

    /// Makes new opens fail with PortNotFound
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Number of transports opened on this vehicle
    pub fn opens(&self) -> usize {
        self.lock().opens
    }

    /// Every packet the vehicle has received
    pub fn received(&self) -> Vec<DecodedPacket> {
        self.lock().received.clone()
    }

    /// Number of read or set requests received for `name`
    pub fn requests_for(&self, name: &str) -> usize {
        self.lock()
            .received
            .iter()
            .filter(|p| match p {
                DecodedPacket::ParamRequestRead { name: n, .. } | DecodedPacket::ParamSet { name: n, .. } => n == name,
                _ => false,
            })
            .count()
    }

    /// Opener that connects to this vehicle
    pub fn opener(&self) -> SimOpener {
        SimOpener { vehicle: self.clone() }
    }
}

impl Default for SimulatedVehicle {
    fn default() -> Self {
        Self::new()
    }
}

/// Client end of a simulated serial link
pub struct SimTransport {
    vehicle: SimulatedVehicle,
    inbound: Vec<u8>,
    outbox: VecDeque<(Instant, Vec<u8>)>,
    next_heartbeat: Instant,
    closed: bool,
}

impl SimTransport {
    fn new(vehicle: SimulatedVehicle) -> Self {
        SimTransport {
            vehicle,
            inbound: Vec::new(),
            outbox: VecDeque::new(),
            next_heartbeat: Instant::now(),
            closed: false,
        }
    }

    fn check(&self) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.vehicle.lock().io_fault {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged").into());
        }
        Ok(())
    }
}

impl Transport for SimTransport {
    fn read_available(&mut self) -> TransportResult<Vec<u8>> {
        self.check()?;
        let now = Instant::now();
        let mut bytes = Vec::new();

        {
            let mut state = self.vehicle.lock();
            if now >= self.next_heartbeat {
                if state.heartbeat {
                    if let Some(frame) = state.heartbeat_frame() {
                        bytes.extend_from_slice(&frame);
                    }
                }
                self.next_heartbeat = now + state.heartbeat_interval;
            }
        }

        while let Some((due, _)) = self.outbox.front() {
            if *due > now {
                break;
            }
            if let Some((_, frame)) = self.outbox.pop_front() {
                bytes.extend_from_slice(&frame);
            }
        }
        Ok(bytes)
    }

    fn write(&mut self, data: &[u8]) -> TransportResult<()> {
        self.check()?;
        self.inbound.extend_from_slice(data);

        let mut state = self.vehicle.lock();
        let due = Instant::now() + state.reply_latency;
        loop {
            let (consumed, packet) = decode(&self.inbound);
            if consumed == 0 {
                break;
            }
            self.inbound.drain(..consumed);
            if let Some(packet) = packet {
                trace!(?packet, "Vehicle received packet");
                for frame in state.respond(&packet) {
                    self.outbox.push_back((due, frame));
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
        self.outbox.clear();
    }
}

/// Opens `SimTransport`s onto one simulated vehicle
#[derive(Debug, Clone)]
pub struct SimOpener {
    vehicle: SimulatedVehicle,
}

impl TransportOpener for SimOpener {
    fn open(&self, config: &ConnectionConfig) -> TransportResult<Box<dyn Transport>> {
        {
            let mut state = self.vehicle.lock();
            if !state.available {
                return Err(TransportError::PortNotFound(config.port.clone()));
            }
            state.opens += 1;
            state.io_fault = false;
        }
        Ok(Box::new(SimTransport::new(self.vehicle.clone())))
    }
}
