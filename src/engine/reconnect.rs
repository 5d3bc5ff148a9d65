//! Automatic reconnection
//!
//! The supervisor follows the current session's state. When the link is lost it
//! opens a new session with the same settings, backing off exponentially, and
//! gives up after `max_reconnect_attempts`. It holds only a weak reference so a
//! dropped manager stops it.

use std::sync::Weak;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::manager::{Inner, ParameterManager};
use crate::protocol::{ConnectionEvent, LinkState};
use crate::util::{backoff_delay, duration_to_secs, BACKOFF_BASE, BACKOFF_MAX};

pub(crate) fn spawn_supervisor(inner: Weak<Inner>) -> JoinHandle<()> {
    tokio::spawn(supervise(inner))
}

async fn supervise(inner: Weak<Inner>) {
    loop {
        let mut state = match inner.upgrade().and_then(|strong| strong.current_session()) {
            Some(session) => session.subscribe(),
            None => return,
        };

        let ended = match state.wait_for(|s| s.is_terminal()).await {
            Ok(s) => *s,
            // Pump gone without reporting a final state
            Err(_) => LinkState::Disconnected,
        };

        let wanted = inner.upgrade().map_or(false, |strong| strong.wanted());
        if ended == LinkState::Closed || !wanted {
            debug!(state = %ended, "Reconnect supervisor stopping");
            return;
        }

        if !reconnect(&inner).await {
            return;
        }
    }
}

/// Tries to bring the link back; true once a new session is installed
async fn reconnect(inner: &Weak<Inner>) -> bool {
    let Some((max, observers)) = inner
        .upgrade()
        .map(|strong| (strong.config.max_reconnect_attempts, strong.observers.clone()))
    else {
        return false;
    };

    for attempt in 1..=max {
        observers.notify_connection(&ConnectionEvent::ReconnectAttempt { attempt, max });
        let delay = backoff_delay(attempt, BACKOFF_BASE, BACKOFF_MAX);
        info!(attempt, max, delay_s = duration_to_secs(delay), "Reconnecting");
        sleep(delay).await;

        let Some(strong) = inner.upgrade() else {
            return false;
        };
        let outcome = {
            let _guard = strong.connect_lock.lock().await;
            if !strong.wanted() {
                return false;
            }
            let Some(config) = strong.current_session().map(|s| s.config().clone()) else {
                return false;
            };
            strong.open_session(config).await.map(|session| strong.install(session))
        };

        match outcome {
            Ok(()) => {
                info!(attempt, "Reconnected");
                if strong.config.refresh_on_connect {
                    ParameterManager::from_inner(strong).load_parameters().await;
                }
                return true;
            }
            Err(e) => warn!(attempt, max, error = %e, "Reconnect attempt failed"),
        }
    }

    warn!(attempts = max, "Giving up on reconnecting");
    observers.notify_connection(&ConnectionEvent::ReconnectExhausted { attempts: max });
    false
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::time::sleep;

    use crate::core::{ConnectionConfig, ErrorKind, ManagerConfig};
    use crate::engine::ParameterManager;
    use crate::protocol::{ConnectionEvent, LinkState};
    use crate::transport::SimulatedVehicle;

    fn config() -> ManagerConfig {
        let mut config = ManagerConfig::default();
        config.connection = ConnectionConfig::for_port("sim0", 115_200);
        config.connection.heartbeat_timeout = Duration::from_secs(3);
        config.connection.link_loss_grace = Duration::from_secs(2);
        config.connection.retries = 1;
        config.refresh_on_connect = false;
        config.max_reconnect_attempts = 3;
        config
    }

    fn record(manager: &ParameterManager) -> Arc<Mutex<Vec<ConnectionEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        manager.add_connection_callback(move |event| sink.lock().unwrap().push(*event));
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_fault() {
        let vehicle = SimulatedVehicle::px4();
        let manager = ParameterManager::with_opener(config(), Arc::new(vehicle.opener())).unwrap();
        let events = record(&manager);
        assert!(manager.connect(None, None).await);

        vehicle.set_io_fault(true);
        sleep(Duration::from_secs(10)).await;

        assert!(manager.is_connected());
        assert_eq!(vehicle.opens(), 2);
        let events = events.lock().unwrap();
        assert!(events.contains(&ConnectionEvent::ReconnectAttempt { attempt: 1, max: 3 }));
        assert!(!events.iter().any(|e| matches!(e, ConnectionEvent::ReconnectExhausted { .. })));

        drop(events);
        assert!(manager.get_parameter("SYS_AUTOSTART", None).await.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhausted() {
        let vehicle = SimulatedVehicle::px4();
        let manager = ParameterManager::with_opener(config(), Arc::new(vehicle.opener())).unwrap();
        let events = record(&manager);
        assert!(manager.connect(None, None).await);

        vehicle.set_available(false);
        vehicle.set_io_fault(true);
        sleep(Duration::from_secs(60)).await;

        assert_eq!(manager.link_state(), LinkState::Disconnected);
        let events = events.lock().unwrap();
        let attempts = events
            .iter()
            .filter(|e| matches!(e, ConnectionEvent::ReconnectAttempt { .. }))
            .count();
        assert_eq!(attempts, 3);
        assert_eq!(events.last(), Some(&ConnectionEvent::ReconnectExhausted { attempts: 3 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reconnect_after_disconnect() {
        let vehicle = SimulatedVehicle::px4();
        let manager = ParameterManager::with_opener(config(), Arc::new(vehicle.opener())).unwrap();
        let events = record(&manager);
        assert!(manager.connect(None, None).await);

        manager.disconnect().await;
        sleep(Duration::from_secs(30)).await;

        assert_eq!(manager.link_state(), LinkState::Closed);
        assert_eq!(vehicle.opens(), 1);
        assert!(!events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, ConnectionEvent::ReconnectAttempt { .. })));
        let result = manager.get_parameter("SYS_AUTOSTART", None).await;
        assert_eq!(result.error, Some(ErrorKind::NotConnected));
    }
}
