//! Connection manager: owns the broker session and its connected flag
//!
//! All session state sits behind one mutex. Network callbacks only hold a
//! `Weak` reference plus the shared `shutting_down` flag, which they check
//! before and after taking the lock so teardown never waits on them.

use crate::config::NvrConfig;
use crate::error::{MqttError, MqttResult};
use crate::observability::metrics::metrics;
use crate::topics::TopicBuilder;
use crate::transport::{
    qos_from_level, BrokerBackend, BrokerSession, ConnectOutcome, DisconnectReason, LastWillSpec,
    SessionEvents, SessionOptions,
};
use std::sync::atomic::{self, AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, TryLockError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn, Level};

pub const AVAILABILITY_ONLINE: &str = "online";
pub const AVAILABILITY_OFFLINE: &str = "offline";

#[derive(Default)]
pub(super) struct ConnectionState {
    session: Option<Arc<dyn BrokerSession>>,
    config: Option<Arc<NvrConfig>>,
    connected: bool,
}

/// Owns the broker session for the lifetime of the integration
pub struct ConnectionManager {
    backend: Arc<dyn BrokerBackend>,
    state: Mutex<ConnectionState>,
    shutting_down: Arc<AtomicBool>,
    /// Session recorded at init so teardown can proceed without the state lock
    teardown: OnceLock<Arc<dyn BrokerSession>>,
    this: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(backend: Arc<dyn BrokerBackend>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            backend,
            state: Mutex::new(ConnectionState::default()),
            shutting_down: Arc::new(AtomicBool::new(false)),
            teardown: OnceLock::new(),
            this: this.clone(),
        })
    }

    pub(super) fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the broker session from `config`
    ///
    /// Returns `Ok(())` without touching the broker when MQTT is disabled.
    pub fn init(&self, config: Arc<NvrConfig>) -> MqttResult<()> {
        if self.is_shutting_down() {
            return Err(MqttError::ShuttingDown);
        }
        if !config.mqtt.enabled {
            info!("MQTT disabled in configuration");
            return Ok(());
        }
        config.validate_for_connection()?;

        let mut state = self.lock_state();
        if state.session.is_some() {
            return Err(MqttError::AlreadyInitialized);
        }

        let last_will = config
            .home_assistant
            .discovery_enabled
            .then(|| LastWillSpec {
                topic: TopicBuilder::from_config(&config).availability(),
                payload: AVAILABILITY_OFFLINE.as_bytes().to_vec(),
                qos: qos_from_level(config.mqtt.qos),
                retain: true,
            });

        let session = self
            .backend
            .create_session(SessionOptions::from_config(&config, last_will))
            .map_err(|e| {
                error!(error = %e, "Failed to create MQTT session");
                e
            })?;

        // Only the first session is ever recorded; cleanup is terminal
        let _ = self.teardown.set(session.clone());
        state.session = Some(session);
        state.config = Some(config.clone());
        state.connected = false;

        info!(
            broker = %config.mqtt.broker_host,
            port = config.mqtt.broker_port,
            "MQTT client initialized"
        );
        Ok(())
    }

    /// Start connecting; the result is reported asynchronously
    pub fn connect(&self) -> MqttResult<()> {
        if self.is_shutting_down() {
            return Err(MqttError::ShuttingDown);
        }

        let state = self.lock_state();
        let (session, config) = match (&state.session, &state.config) {
            (Some(session), Some(config)) if config.mqtt.enabled => (session.clone(), config.clone()),
            _ => return Ok(()),
        };

        let _span = crate::mqtt_span!(
            operation = "connect",
            broker = %config.mqtt.broker_host,
            port = config.mqtt.broker_port
        )
        .entered();
        metrics().mqtt_connection_attempt();
        let events: Arc<dyn SessionEvents> = Arc::new(CallbackHandler {
            shutting_down: self.shutting_down.clone(),
            manager: self.this.clone(),
        });

        if let Err(e) = session.connect(events) {
            error!(error = %e, "Failed to connect to MQTT broker");
            metrics().mqtt_connection_failed();
            return Err(e);
        }

        if let Err(e) = session.loop_start() {
            error!(error = %e, "Failed to start MQTT network loop");
            metrics().mqtt_connection_failed();
            if let Err(disconnect_err) = session.disconnect() {
                debug!(error = %disconnect_err, "Disconnect after failed loop start also failed");
            }
            return Err(e);
        }

        info!("Connecting to MQTT broker");
        drop(state);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        self.lock_state().connected
    }

    /// Current configuration, if initialized and not yet cleaned up
    pub fn config(&self) -> Option<Arc<NvrConfig>> {
        self.lock_state().config.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Hand a message to the session using the configured QoS
    ///
    /// The state lock is only held to copy the session handle.
    pub fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> MqttResult<()> {
        if self.is_shutting_down() {
            return Err(MqttError::ShuttingDown);
        }

        let (session, qos) = {
            let state = self.lock_state();
            match (&state.session, &state.config, state.connected) {
                (Some(session), Some(config), true) => {
                    (session.clone(), qos_from_level(config.mqtt.qos))
                }
                _ => return Err(MqttError::NotConnected),
            }
        };

        match session.publish(topic, payload, qos, retain) {
            Ok(()) => {
                metrics().mqtt_message_published();
                debug!(topic = %topic, bytes = payload.len(), retain, "Published MQTT message");
                Ok(())
            }
            Err(e) => {
                metrics().mqtt_publish_failed();
                warn!(topic = %topic, error = %e, "Failed to publish MQTT message");
                Err(e)
            }
        }
    }

    /// Raise the shutdown flag; callbacks observing it return immediately
    pub(crate) fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        atomic::fence(Ordering::SeqCst);
    }

    /// Poll `try_lock` until `timeout`; `None` if the lock stayed busy
    fn try_lock_state_for(
        &self,
        timeout: Duration,
        poll: Duration,
    ) -> Option<MutexGuard<'_, ConnectionState>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.state.try_lock() {
                Ok(guard) => return Some(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    std::thread::sleep(poll.min(deadline - now));
                }
            }
        }
    }

    /// Take the session out of the shared state for final teardown
    ///
    /// Returns `Err` with the recorded teardown handle when the lock could
    /// not be acquired within `timeout`.
    pub(crate) fn detach_session(
        &self,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Option<Arc<dyn BrokerSession>>, Option<Arc<dyn BrokerSession>>> {
        match self.try_lock_state_for(timeout, poll) {
            Some(mut state) => {
                state.connected = false;
                state.config = None;
                Ok(state.session.take())
            }
            None => Err(self.teardown.get().cloned()),
        }
    }

    /// Clear the connected flag and return the session for a graceful disconnect
    pub(crate) fn mark_disconnected(
        &self,
        timeout: Duration,
        poll: Duration,
    ) -> Option<Arc<dyn BrokerSession>> {
        match self.try_lock_state_for(timeout, poll) {
            Some(mut state) => {
                state.connected = false;
                state.session.clone()
            }
            None => {
                warn!("Connection lock busy during disconnect, proceeding without it");
                self.teardown.get().cloned()
            }
        }
    }

    /// True once a session has ever been created
    pub(crate) fn was_initialized(&self) -> bool {
        self.teardown.get().is_some()
    }

    pub(crate) fn backend(&self) -> Arc<dyn BrokerBackend> {
        self.backend.clone()
    }

    fn handle_connect(&self, outcome: ConnectOutcome) {
        let announce = {
            let mut state = self.lock_state();
            if self.is_shutting_down() {
                debug!("Ignoring connect result received during shutdown");
                return;
            }
            match outcome {
                ConnectOutcome::Accepted => {
                    if state.session.is_none() {
                        return;
                    }
                    state.connected = true;
                    metrics().mqtt_connection_established();
                    info!("Connected to MQTT broker");
                    state
                        .config
                        .as_ref()
                        .filter(|c| c.home_assistant.discovery_enabled)
                        .map(|c| TopicBuilder::from_config(c).availability())
                }
                ConnectOutcome::Failed(reason) => {
                    state.connected = false;
                    metrics().mqtt_connection_failed();
                    warn!(reason = %reason, "MQTT connection failed");
                    None
                }
            }
        };

        if let Some(topic) = announce {
            if let Err(e) = self.publish(&topic, AVAILABILITY_ONLINE.as_bytes(), true) {
                warn!(topic = %topic, error = %e, "Failed to publish availability");
            }
        }
    }

    fn handle_disconnect(&self, reason: DisconnectReason) {
        let mut state = self.lock_state();
        if self.is_shutting_down() {
            return;
        }
        state.connected = false;
        metrics().mqtt_connection_lost();
        match reason {
            DisconnectReason::Requested => info!("Disconnected from MQTT broker"),
            DisconnectReason::Unexpected(reason) => {
                warn!(reason = %reason, "Unexpectedly disconnected from MQTT broker")
            }
        }
    }
}

/// Session callbacks; never keeps the manager alive
struct CallbackHandler {
    shutting_down: Arc<AtomicBool>,
    manager: Weak<ConnectionManager>,
}

impl SessionEvents for CallbackHandler {
    fn on_connect(&self, outcome: ConnectOutcome) {
        if self.shutting_down.load(Ordering::SeqCst) {
            debug!("Ignoring connect callback during shutdown");
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.handle_connect(outcome);
        }
    }

    fn on_disconnect(&self, reason: DisconnectReason) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.handle_disconnect(reason);
        }
    }

    fn on_log(&self, level: Level, message: &str) {
        match level {
            Level::ERROR => error!(target: "nvr_mqtt::broker", "{message}"),
            Level::WARN => warn!(target: "nvr_mqtt::broker", "{message}"),
            Level::INFO => info!(target: "nvr_mqtt::broker", "{message}"),
            _ => debug!(target: "nvr_mqtt::broker", "{message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockBroker;

    fn manager_with(broker: &MockBroker) -> Arc<ConnectionManager> {
        ConnectionManager::new(Arc::new(broker.clone()))
    }

    #[test]
    fn test_init_disabled_is_inert() {
        let broker = MockBroker::new();
        let manager = manager_with(&broker);
        let mut config = NvrConfig::test_config();
        config.mqtt.enabled = false;

        assert!(manager.init(Arc::new(config)).is_ok());
        assert!(manager.connect().is_ok());

        assert_eq!(broker.sessions_created(), 0);
        assert!(!manager.is_connected());
    }

    #[test]
    fn test_init_without_host_fails() {
        let broker = MockBroker::new();
        let manager = manager_with(&broker);
        let mut config = NvrConfig::test_config();
        config.mqtt.broker_host.clear();

        let result = manager.init(Arc::new(config));

        assert!(matches!(
            result,
            Err(MqttError::Config(crate::config::ConfigError::MissingBrokerHost))
        ));
    }

    #[test]
    fn test_init_twice_rejected() {
        let broker = MockBroker::new();
        let manager = manager_with(&broker);
        let config = Arc::new(NvrConfig::test_config());

        manager.init(config.clone()).unwrap();

        assert!(matches!(
            manager.init(config),
            Err(MqttError::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_last_will_registered_when_discovery_enabled() {
        let broker = MockBroker::new();
        let manager = manager_with(&broker);

        manager.init(Arc::new(NvrConfig::test_config())).unwrap();

        let will = broker.last_session_options().unwrap().last_will.unwrap();
        assert_eq!(will.topic, "lightnvr/availability");
        assert_eq!(will.payload, b"offline");
        assert!(will.retain);
    }

    #[test]
    fn test_connect_before_init_is_noop() {
        let broker = MockBroker::new();
        let manager = manager_with(&broker);
        assert!(manager.connect().is_ok());
        assert!(!manager.is_connected());
    }

    #[test]
    fn test_connect_publishes_online_when_accepted() {
        let broker = MockBroker::new();
        let manager = manager_with(&broker);
        manager.init(Arc::new(NvrConfig::test_config())).unwrap();

        manager.connect().unwrap();
        broker.fire_connect(ConnectOutcome::Accepted);

        assert!(manager.is_connected());
        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "lightnvr/availability");
        assert_eq!(published[0].payload, b"online");
        assert!(published[0].retain);
    }

    #[test]
    fn test_failed_connect_leaves_disconnected() {
        let broker = MockBroker::new();
        let manager = manager_with(&broker);
        manager.init(Arc::new(NvrConfig::test_config())).unwrap();

        manager.connect().unwrap();
        broker.fire_connect(ConnectOutcome::Failed("refused".to_string()));

        assert!(!manager.is_connected());
        assert!(broker.published().is_empty());
    }

    #[test]
    fn test_loop_start_failure_disconnects() {
        let broker = MockBroker::new();
        broker.fail_loop_start(true);
        let manager = manager_with(&broker);
        manager.init(Arc::new(NvrConfig::test_config())).unwrap();

        assert!(manager.connect().is_err());
        assert_eq!(broker.calls("disconnect"), 1);
    }

    #[test]
    fn test_publish_requires_connection() {
        let broker = MockBroker::new();
        let manager = manager_with(&broker);
        manager.init(Arc::new(NvrConfig::test_config())).unwrap();

        let result = manager.publish("lightnvr/test", b"x", false);

        assert!(matches!(result, Err(MqttError::NotConnected)));
    }

    #[test]
    fn test_unexpected_disconnect_clears_connected() {
        let broker = MockBroker::new();
        let manager = manager_with(&broker);
        manager.init(Arc::new(NvrConfig::test_config())).unwrap();
        manager.connect().unwrap();
        broker.fire_connect(ConnectOutcome::Accepted);

        broker.fire_disconnect(DisconnectReason::Unexpected("io".to_string()));

        assert!(!manager.is_connected());
    }

    #[test]
    fn test_callbacks_ignored_after_shutdown_begins() {
        let broker = MockBroker::new();
        let manager = manager_with(&broker);
        manager.init(Arc::new(NvrConfig::test_config())).unwrap();
        manager.connect().unwrap();

        manager.begin_shutdown();
        broker.fire_connect(ConnectOutcome::Accepted);

        assert!(!manager.is_connected());
        assert!(broker.published().is_empty());
        assert!(matches!(
            manager.publish("lightnvr/test", b"x", false),
            Err(MqttError::ShuttingDown)
        ));
    }

    #[test]
    fn test_detach_session_clears_state() {
        let broker = MockBroker::new();
        let manager = manager_with(&broker);
        manager.init(Arc::new(NvrConfig::test_config())).unwrap();

        let detached = manager.detach_session(Duration::from_millis(100), Duration::from_millis(10));

        assert!(matches!(detached, Ok(Some(_))));
        assert!(manager.config().is_none());
    }

    #[test]
    fn test_detach_session_falls_back_when_lock_busy() {
        let broker = MockBroker::new();
        let manager = manager_with(&broker);
        manager.init(Arc::new(NvrConfig::test_config())).unwrap();

        let _held = manager.lock_state();
        let detached = manager.detach_session(Duration::from_millis(50), Duration::from_millis(10));

        assert!(matches!(detached, Err(Some(_))));
    }
}
