use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::operation::{OpRequest, PendingOperation};
use super::reconnect;
use crate::core::{
    validate_param_name, ConnectionConfig, Error, ErrorKind, ManagerConfig, OperationKind,
    OperationResult, ParamValue, ParameterInfo, Result,
};
use crate::params::{self, SharedStore};
use crate::protocol::{ConnectionEvent, LinkState};
use crate::session::{LinkSession, Observers, SessionConfig};
use crate::transport::{SerialOpener, TransportOpener};
use crate::util::{backoff_delay, duration_to_secs, BACKOFF_BASE, BACKOFF_MAX};

/// State shared by every clone of a manager and by its reconnect supervisor
pub(crate) struct Inner {
    pub(crate) config: ManagerConfig,
    opener: Arc<dyn TransportOpener>,
    store: SharedStore,
    pub(crate) observers: Arc<Observers>,
    session: RwLock<Option<Arc<LinkSession>>>,
    /// Serialises connect() and reconnect attempts
    pub(crate) connect_lock: tokio::sync::Mutex<()>,
    /// Whether the caller wants the link up
    pub(crate) wanted: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    pub(crate) fn current_session(&self) -> Option<Arc<LinkSession>> {
        self.session.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn install(&self, session: LinkSession) {
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(session));
    }

    /// Forgets a session that has been shut down
    fn clear_session(&self) {
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub(crate) fn wanted(&self) -> bool {
        self.wanted.load(Ordering::SeqCst)
    }

    /// One session attempt with the shared store and observers
    pub(crate) async fn open_session(&self, config: SessionConfig) -> Result<LinkSession> {
        LinkSession::connect(
            config,
            Arc::clone(&self.opener),
            Arc::clone(&self.store),
            Arc::clone(&self.observers),
        )
        .await
    }
}

/// Caller-facing parameter client for one vehicle
///
/// Cheap to clone; clones share the connection, the parameter cache and the
/// observers. Independent managers talk to independent vehicles.
#[derive(Clone)]
pub struct ParameterManager {
    inner: Arc<Inner>,
}

impl ParameterManager {
    /// Creates a manager that talks to real serial ports
    pub fn new(config: ManagerConfig) -> Result<Self> {
        Self::with_opener(config, Arc::new(SerialOpener::new()))
    }

    /// Creates a manager that opens links through `opener`
    pub fn with_opener(config: ManagerConfig, opener: Arc<dyn TransportOpener>) -> Result<Self> {
        config.validate()?;
        Ok(ParameterManager {
            inner: Arc::new(Inner {
                config,
                opener,
                store: params::shared_store(),
                observers: Arc::new(Observers::new()),
                session: RwLock::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
                wanted: AtomicBool::new(false),
                supervisor: Mutex::new(None),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        ParameterManager { inner }
    }

    /// The manager's configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Connects, optionally overriding the configured port and baud rate.
    ///
    /// Returns false on failure; the reason is logged. Use [`try_connect`]
    /// for the error itself.
    ///
    /// [`try_connect`]: ParameterManager::try_connect
    pub async fn connect(&self, port: Option<&str>, baud_rate: Option<u32>) -> bool {
        match self.try_connect(port, baud_rate).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Connection failed");
                false
            }
        }
    }

    /// Connects and, when configured, loads the parameter table.
    ///
    /// Connect attempts back off exponentially. A failed initial refresh does
    /// not fail the connect.
    pub async fn try_connect(&self, port: Option<&str>, baud_rate: Option<u32>) -> Result<()> {
        let mut connection = self.inner.config.connection.clone();
        if let Some(port) = port {
            connection.port = port.to_string();
        }
        if let Some(baud_rate) = baud_rate {
            connection.baud_rate = baud_rate;
        }
        connection.validate()?;

        {
            let _guard = self.inner.connect_lock.lock().await;
            self.inner.wanted.store(true, Ordering::SeqCst);

            if let Some(previous) = self.inner.current_session() {
                previous.shutdown().await;
            }

            let session = match self.connect_with_retries(connection).await {
                Ok(session) => session,
                Err(e) => {
                    self.inner.clear_session();
                    return Err(e);
                }
            };
            if !self.inner.wanted() {
                // disconnect() ran while we were connecting
                session.shutdown().await;
                return Err(Error::Cancelled);
            }
            self.inner.install(session);
            if self.inner.config.auto_reconnect {
                self.restart_supervisor();
            }
        }

        if self.inner.config.refresh_on_connect {
            self.load_parameters().await;
        }
        Ok(())
    }

    async fn connect_with_retries(&self, connection: ConnectionConfig) -> Result<LinkSession> {
        let retries = connection.retries;
        let mut attempt = 1;
        loop {
            let config = SessionConfig::from_manager(&self.inner.config, connection.clone());
            match self.inner.open_session(config).await {
                Ok(session) => {
                    info!(port = %connection.port, attempt, "Connected to vehicle");
                    return Ok(session);
                }
                Err(e) if attempt < retries && is_retryable(&e) && self.inner.wanted() => {
                    let delay = backoff_delay(attempt, BACKOFF_BASE, BACKOFF_MAX);
                    warn!(attempt, retries, error = %e, delay_s = duration_to_secs(delay), "Connect attempt failed, retrying");
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Refresh issued after a connect or reconnect
    pub(crate) async fn load_parameters(&self) {
        let loaded = self.refresh_parameters(Some(self.inner.config.connect_refresh_timeout)).await;
        let count = params::read(&self.inner.store).len();
        if loaded {
            info!(count, "Loaded parameters");
        } else {
            warn!(count, "Connected but failed to load all parameters");
        }
    }

    /// Replaces the supervisor with one following the newly installed session.
    /// Called with the connect lock held, so the old one is never mid-attempt.
    fn restart_supervisor(&self) {
        let mut slot = self.inner.supervisor.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = Some(reconnect::spawn_supervisor(Arc::downgrade(&self.inner)));
    }

    /// Closes the link and cancels every pending operation.
    ///
    /// Also stops automatic reconnection until the next connect().
    pub async fn disconnect(&self) {
        self.inner.wanted.store(false, Ordering::SeqCst);
        if let Some(session) = self.inner.current_session() {
            info!("Disconnecting");
            session.shutdown().await;
        }
    }

    /// Whether the link is up and heartbeats are arriving
    pub fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    /// Current link state
    pub fn link_state(&self) -> LinkState {
        self.inner
            .current_session()
            .map_or(LinkState::Disconnected, |session| session.state())
    }

    /// Reads one parameter from the vehicle
    pub async fn get_parameter(&self, name: &str, timeout: Option<Duration>) -> OperationResult {
        let kind = OperationKind::Get;
        if let Err(e) = validate_param_name(name) {
            return self.local_failure(kind, Some(name), &e);
        }

        if self.inner.config.serve_cached_reads {
            if let Some(info) = self.get_cached_parameter(name) {
                let result = OperationResult::succeeded(kind, Some(name.to_string()), Some(info.value), Duration::ZERO);
                self.inner.observers.notify_operation(&result);
                return result;
            }
        }

        let Some(session) = self.connected_session() else {
            return self.local_failure(kind, Some(name), &Error::NotConnected);
        };

        let (op, rx) = PendingOperation::new(
            OpRequest::Get { name: name.to_string() },
            timeout.unwrap_or(self.inner.config.operation_timeout),
            self.inner.config.retry_attempts,
            self.inner.config.retry_delay,
        );
        self.run(&session, op, rx, kind, Some(name)).await
    }

    /// Reads several parameters concurrently; results are in `names` order
    pub async fn get_parameters(&self, names: &[&str], timeout: Option<Duration>) -> Vec<OperationResult> {
        join_all(names.iter().map(|name| self.get_parameter(name, timeout))).await
    }

    /// Writes one parameter.
    ///
    /// The value is converted to the parameter's cached type, or to its natural
    /// type when the parameter has not been seen yet. With `verify` the
    /// vehicle's echo must carry the requested value.
    pub async fn set_parameter(
        &self,
        name: &str,
        value: impl Into<ParamValue>,
        verify: bool,
        timeout: Option<Duration>,
    ) -> OperationResult {
        let kind = OperationKind::Set;
        let value = value.into();
        if let Err(e) = validate_param_name(name) {
            return self.local_failure(kind, Some(name), &e);
        }

        let Some(session) = self.connected_session() else {
            return self.local_failure(kind, Some(name), &Error::NotConnected);
        };

        let (param_type, increment) = {
            let store = params::read(&self.inner.store);
            (store.param_type(name).unwrap_or_else(|| value.natural_type()), store.increment(name))
        };
        let Some(coerced) = value.coerce(param_type) else {
            let e = Error::invalid_request(format!("value {} does not fit {:?}", value, param_type));
            return self.local_failure(kind, Some(name), &e);
        };

        info!(param = %name, value = %coerced, ?param_type, verify, "Setting parameter");
        let (op, rx) = PendingOperation::new(
            OpRequest::Set { name: name.to_string(), value: coerced, param_type, verify, increment },
            timeout.unwrap_or(self.inner.config.operation_timeout),
            self.inner.config.retry_attempts,
            self.inner.config.retry_delay,
        );
        self.run(&session, op, rx, kind, Some(name)).await
    }

    /// Requests the whole parameter table and waits until it is complete.
    ///
    /// Returns false on timeout; whatever arrived stays cached.
    pub async fn refresh_parameters(&self, timeout: Option<Duration>) -> bool {
        let kind = OperationKind::RefreshAll;
        let Some(session) = self.connected_session() else {
            self.local_failure(kind, None, &Error::NotConnected);
            return false;
        };

        let (op, rx) = PendingOperation::new(
            OpRequest::RefreshAll,
            timeout.unwrap_or(self.inner.config.operation_timeout),
            1,
            Duration::ZERO,
        );
        self.run(&session, op, rx, kind, None).await.success
    }

    /// Copy of every cached parameter
    pub fn get_all_parameters(&self) -> HashMap<String, ParameterInfo> {
        params::read(&self.inner.store).all()
    }

    /// Copy of one cached parameter, without asking the vehicle
    pub fn get_cached_parameter(&self, name: &str) -> Option<ParameterInfo> {
        params::read(&self.inner.store).get(name)
    }

    /// Declares the rounding step of a float parameter, used when verifying sets
    pub fn set_increment(&self, name: &str, increment: f32) {
        params::write(&self.inner.store).set_increment(name, increment);
    }

    /// Observes every operation result. Runs on the pump task; must not block.
    pub fn add_operation_callback<F>(&self, callback: F)
    where
        F: Fn(&OperationResult) + Send + Sync + 'static,
    {
        self.inner.observers.add_operation(Arc::new(callback));
    }

    /// Observes link state changes and reconnect progress
    pub fn add_connection_callback<F>(&self, callback: F)
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.observers.add_connection(Arc::new(callback));
    }

    /// Observes value updates of one parameter, or of all with `"*"`
    pub fn add_parameter_callback<F>(&self, name: &str, callback: F)
    where
        F: Fn(&ParameterInfo) + Send + Sync + 'static,
    {
        self.inner.observers.add_parameter(name, Arc::new(callback));
    }

    fn connected_session(&self) -> Option<Arc<LinkSession>> {
        self.inner
            .current_session()
            .filter(|session| session.state().is_connected())
    }

    async fn run(
        &self,
        session: &LinkSession,
        op: PendingOperation,
        rx: oneshot::Receiver<OperationResult>,
        kind: OperationKind,
        name: Option<&str>,
    ) -> OperationResult {
        if let Err(e) = session.submit(op).await {
            return self.local_failure(kind, name, &e);
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => self.local_failure(kind, name, &Error::link_lost("session ended")),
        }
    }

    /// Builds, reports and returns a failure that never reached the pump
    fn local_failure(&self, kind: OperationKind, name: Option<&str>, err: &Error) -> OperationResult {
        let error_kind = err.kind();
        if error_kind == ErrorKind::InvalidRequest {
            warn!(%kind, param = ?name, error = %err, "Rejected request");
        }
        let result = OperationResult::failed(kind, name.map(str::to_string), error_kind, err.to_string(), Duration::ZERO);
        self.inner.observers.notify_operation(&result);
        result
    }
}

fn is_retryable(err: &Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectTimeout | ErrorKind::PortNotFound | ErrorKind::LinkLost
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio_test::assert_ok;
    use crate::core::ParamType;
    use crate::protocol::{DecodedPacket, Endpoint};
    use crate::transport::SimulatedVehicle;

    fn config() -> ManagerConfig {
        let mut config = ManagerConfig::default();
        config.connection = ConnectionConfig::for_port("sim0", 115_200);
        config.refresh_on_connect = false;
        config.auto_reconnect = false;
        config.retry_delay = Duration::from_millis(200);
        config
    }

    async fn connected(vehicle: &SimulatedVehicle, config: ManagerConfig) -> ParameterManager {
        let manager = ParameterManager::with_opener(config, Arc::new(vehicle.opener())).unwrap();
        assert_ok!(manager.try_connect(None, None).await);
        manager
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_sys_autostart() {
        let vehicle = SimulatedVehicle::px4();
        vehicle.set_param("SYS_AUTOSTART", ParamValue::Int(1001), ParamType::Int32);
        vehicle.set_reply_latency(Duration::from_millis(30));
        let manager = connected(&vehicle, config()).await;

        let result = manager.get_parameter("SYS_AUTOSTART", None).await;
        assert!(result.success);
        assert_eq!(result.value, Some(ParamValue::Int(1001)));
        assert_eq!(result.kind, OperationKind::Get);
        assert_eq!(manager.get_cached_parameter("SYS_AUTOSTART").unwrap().value, ParamValue::Int(1001));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_without_heartbeat() {
        let vehicle = SimulatedVehicle::px4();
        vehicle.set_heartbeat(false);
        let manager = ParameterManager::with_opener(config(), Arc::new(vehicle.opener())).unwrap();

        let started = tokio::time::Instant::now();
        let result = manager.try_connect(None, None).await;
        assert!(matches!(result, Err(Error::ConnectTimeout(d)) if d == Duration::from_secs(10)));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(manager.link_state(), LinkState::Disconnected);
        assert_eq!(vehicle.opens(), 3);

        assert!(!manager.connect(None, None).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reconnect_reports_disconnected() {
        let vehicle = SimulatedVehicle::px4();
        let manager = connected(&vehicle, config()).await;
        manager.disconnect().await;
        assert_eq!(manager.link_state(), LinkState::Closed);

        vehicle.set_heartbeat(false);
        assert!(!manager.connect(None, None).await);
        assert_eq!(manager.link_state(), LinkState::Disconnected);
        assert!(!manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_gets_resolve_independently() {
        let vehicle = SimulatedVehicle::px4();
        let manager = connected(&vehicle, config()).await;

        let (a, b) = tokio::join!(
            manager.get_parameter("SYS_AUTOSTART", None),
            manager.get_parameter("MPC_XY_VEL_MAX", None),
        );
        assert_eq!(a.value, Some(ParamValue::Int(4001)));
        assert_eq!(a.name.as_deref(), Some("SYS_AUTOSTART"));
        assert_eq!(b.value, Some(ParamValue::Float(12.0)));
        assert_eq!(b.name.as_deref(), Some("MPC_XY_VEL_MAX"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_follow_vehicle_address() {
        let vehicle = SimulatedVehicle::px4();
        vehicle.set_endpoint(Endpoint::new(42, 1));
        vehicle.set_heartbeat_interval(Duration::from_millis(500));
        let manager = connected(&vehicle, config()).await;

        assert!(manager.get_parameter("SYS_AUTOSTART", None).await.success);
        let targets: Vec<Endpoint> = vehicle
            .received()
            .iter()
            .filter_map(|packet| match packet {
                DecodedPacket::ParamRequestRead { target, .. } => Some(*target),
                _ => None,
            })
            .collect();
        assert_eq!(targets, [Endpoint::new(42, 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_get_keeps_order() {
        let vehicle = SimulatedVehicle::px4();
        vehicle.set_silent("NAV_DLL_ACT");
        let manager = connected(&vehicle, config()).await;

        let results = manager
            .get_parameters(&["BAT1_N_CELLS", "NAV_DLL_ACT", "MPC_Z_VEL_MAX_UP"], Some(Duration::from_secs(1)))
            .await;
        let names: Vec<_> = results.iter().map(|r| r.name.clone().unwrap()).collect();
        assert_eq!(names, ["BAT1_N_CELLS", "NAV_DLL_ACT", "MPC_Z_VEL_MAX_UP"]);
        assert!(results[0].success);
        assert_eq!(results[1].error, Some(ErrorKind::OperationTimeout));
        assert_eq!(results[2].value, Some(ParamValue::Float(3.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_verification_mismatch() {
        let vehicle = SimulatedVehicle::px4();
        vehicle.set_echo_override("MPC_XY_VEL_MAX", ParamValue::Float(10.0));
        let manager = connected(&vehicle, config()).await;

        let result = manager.set_parameter("MPC_XY_VEL_MAX", 15.0, true, None).await;
        assert!(!result.success);
        assert_eq!(result.error, Some(ErrorKind::VerificationFailed));
        assert_eq!(result.value, Some(ParamValue::Float(10.0)));

        // Not retried, even after the retry window
        sleep(Duration::from_secs(30)).await;
        assert_eq!(vehicle.requests_for("MPC_XY_VEL_MAX"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_without_verify() {
        let vehicle = SimulatedVehicle::px4();
        vehicle.set_echo_override("MPC_XY_VEL_MAX", ParamValue::Float(10.0));
        let manager = connected(&vehicle, config()).await;

        let result = manager.set_parameter("MPC_XY_VEL_MAX", 15.0, false, None).await;
        assert!(result.success);
        assert_eq!(result.value, Some(ParamValue::Float(10.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_uses_cached_type() {
        let vehicle = SimulatedVehicle::px4();
        let manager = connected(&vehicle, config()).await;
        assert!(manager.refresh_parameters(None).await);

        // Cached as UINT8, so 300 cannot be sent
        let result = manager.set_parameter("MAV_SYS_ID", 300, true, None).await;
        assert_eq!(result.error, Some(ErrorKind::InvalidRequest));
        assert_eq!(vehicle.requests_for("MAV_SYS_ID"), 0);

        let result = manager.set_parameter("MAV_SYS_ID", 2, true, None).await;
        assert!(result.success);
        assert_eq!(vehicle.param("MAV_SYS_ID"), Some(ParamValue::Int(2)));

        // Float given for an integer parameter is converted when whole
        let result = manager.set_parameter("BAT1_N_CELLS", 6.0, true, None).await;
        assert!(result.success);
        assert_eq!(vehicle.param("BAT1_N_CELLS"), Some(ParamValue::Int(6)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_within_increment() {
        let vehicle = SimulatedVehicle::px4();
        vehicle.set_echo_override("COM_RC_LOSS_T", ParamValue::Float(0.5));
        let manager = connected(&vehicle, config()).await;
        manager.set_increment("COM_RC_LOSS_T", 0.1);

        let result = manager.set_parameter("COM_RC_LOSS_T", 0.55, true, None).await;
        assert!(result.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_retries_then_times_out() {
        let vehicle = SimulatedVehicle::px4();
        vehicle.set_silent("NAV_DLL_ACT");
        let manager = connected(&vehicle, config()).await;

        let result = manager.get_parameter("NAV_DLL_ACT", Some(Duration::from_secs(1))).await;
        assert_eq!(result.error, Some(ErrorKind::OperationTimeout));
        assert_eq!(vehicle.requests_for("NAV_DLL_ACT"), 3);
        assert!(result.elapsed >= Duration::from_millis(3400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_recovers_from_dropped_request() {
        let vehicle = SimulatedVehicle::px4();
        let manager = connected(&vehicle, config()).await;
        vehicle.drop_next_requests(1);

        let result = manager.get_parameter("BAT1_N_CELLS", Some(Duration::from_secs(1))).await;
        assert!(result.success);
        assert_eq!(vehicle.requests_for("BAT1_N_CELLS"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_refresh_keeps_entries() {
        let vehicle = SimulatedVehicle::px4();
        vehicle.set_list_limit(Some(4));
        let manager = connected(&vehicle, config()).await;

        assert!(!manager.refresh_parameters(Some(Duration::from_secs(2))).await);
        let all = manager.get_all_parameters();
        assert_eq!(all.len(), 4);
        assert!(all.values().all(|p| p.count as usize == vehicle.param_count()));

        vehicle.set_list_limit(None);
        assert!(manager.refresh_parameters(Some(Duration::from_secs(2))).await);
        assert_eq!(manager.get_all_parameters().len(), vehicle.param_count());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_during_refresh_sees_echo() {
        let vehicle = SimulatedVehicle::px4();
        let manager = connected(&vehicle, config()).await;

        let (refreshed, set) = tokio::join!(
            manager.refresh_parameters(None),
            manager.set_parameter("MPC_XY_VEL_MAX", 15.0, true, None),
        );
        assert!(refreshed);
        assert!(set.success, "{:?}", set);
        assert_eq!(set.value, Some(ParamValue::Float(15.0)));
        assert_eq!(vehicle.param("MPC_XY_VEL_MAX"), Some(ParamValue::Float(15.0)));
        assert_eq!(manager.get_cached_parameter("MPC_XY_VEL_MAX").unwrap().value, ParamValue::Float(15.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_on_connect() {
        let vehicle = SimulatedVehicle::px4();
        let mut config = config();
        config.refresh_on_connect = true;
        let manager = connected(&vehicle, config).await;
        assert_eq!(manager.get_all_parameters().len(), vehicle.param_count());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending() {
        let vehicle = SimulatedVehicle::px4();
        vehicle.set_silent("SYS_AUTOSTART");
        vehicle.set_silent("BAT1_N_CELLS");
        let manager = connected(&vehicle, config()).await;

        let cancelled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cancelled);
        manager.add_operation_callback(move |result| {
            if result.error == Some(ErrorKind::Cancelled) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.get_parameter("SYS_AUTOSTART", None).await }
        });
        let second = tokio::spawn({
            let manager = manager.clone();
            async move { manager.set_parameter("BAT1_N_CELLS", 3, true, None).await }
        });
        sleep(Duration::from_millis(500)).await;

        manager.disconnect().await;
        assert_eq!(first.await.unwrap().error, Some(ErrorKind::Cancelled));
        assert_eq!(second.await.unwrap().error, Some(ErrorKind::Cancelled));
        assert_eq!(cancelled.load(Ordering::SeqCst), 2);
        assert_eq!(manager.link_state(), LinkState::Closed);

        let result = manager.get_parameter("SYS_AUTOSTART", None).await;
        assert_eq!(result.error, Some(ErrorKind::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_need_connection() {
        let vehicle = SimulatedVehicle::px4();
        let manager = ParameterManager::with_opener(config(), Arc::new(vehicle.opener())).unwrap();

        let result = manager.get_parameter("SYS_AUTOSTART", None).await;
        assert_eq!(result.error, Some(ErrorKind::NotConnected));
        assert!(!manager.refresh_parameters(None).await);
        assert!(!manager.is_connected());

        let result = manager.set_parameter("A_NAME_THAT_IS_TOO_LONG", 1, true, None).await;
        assert_eq!(result.error, Some(ErrorKind::InvalidRequest));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_reads() {
        let vehicle = SimulatedVehicle::px4();
        let mut config = config();
        config.serve_cached_reads = true;
        let manager = connected(&vehicle, config).await;

        assert!(manager.get_parameter("SYS_AUTOSTART", None).await.success);
        assert!(manager.get_parameter("SYS_AUTOSTART", None).await.success);
        assert_eq!(vehicle.requests_for("SYS_AUTOSTART"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parameter_callback() {
        let vehicle = SimulatedVehicle::px4();
        let manager = connected(&vehicle, config()).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager.add_parameter_callback("BAT1_N_CELLS", move |info| {
            sink.lock().unwrap().push(info.value);
        });

        manager.set_parameter("BAT1_N_CELLS", 6, true, None).await;
        manager.get_parameter("SYS_AUTOSTART", None).await;
        assert_eq!(*seen.lock().unwrap(), vec![ParamValue::Int(6)]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = ManagerConfig::default();
        config.operation_timeout = Duration::ZERO;
        let vehicle = SimulatedVehicle::new();
        let result = ParameterManager::with_opener(config, Arc::new(vehicle.opener()));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
