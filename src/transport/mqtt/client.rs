//! rumqttc-backed broker session
//!
//! Uses the synchronous `Client`/`Connection` pair: publishes go into the
//! client's bounded request queue and a dedicated `mqtt-network` thread drives
//! the connection iterator, translating events into [`SessionEvents`] calls.

use super::connection::{configure_mqtt_options, ReconnectConfig};
use super::message_handler::{describe_connection_error, route_mqtt_event, EventRoute};
use crate::error::{MqttError, MqttResult};
use crate::transport::{
    BrokerBackend, BrokerSession, ConnectOutcome, DisconnectReason, QoS, SessionEvents,
    SessionOptions,
};
use rumqttc::v5::{Client, Connection, MqttOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, Level};

/// Capacity of the client's outgoing request queue
const REQUEST_CAPACITY: usize = 64;

/// Granularity of interruptible sleeps in the network thread
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Creates [`RumqttSession`]s
#[derive(Debug, Clone, Default)]
pub struct RumqttBackend {
    reconnect: ReconnectConfig,
}

impl RumqttBackend {
    pub fn new(reconnect: ReconnectConfig) -> Self {
        Self { reconnect }
    }
}

impl BrokerBackend for RumqttBackend {
    fn create_session(&self, options: SessionOptions) -> MqttResult<Arc<dyn BrokerSession>> {
        info!(
            host = %options.host,
            port = options.port,
            client_id = %options.client_id,
            tls = options.tls,
            "Creating MQTT session"
        );
        Ok(Arc::new(RumqttSession::new(&options, self.reconnect.clone())))
    }

    fn cleanup(&self) {
        // rumqttc keeps no process-wide state
        debug!("MQTT library cleanup complete");
    }
}

type PendingConnection = (Connection, Arc<dyn SessionEvents>);

/// One broker session driven by a dedicated network thread
pub struct RumqttSession {
    options: MqttOptions,
    reconnect: ReconnectConfig,
    client: Mutex<Option<Client>>,
    pending: Mutex<Option<PendingConnection>>,
    network: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    disconnect_requested: Arc<AtomicBool>,
}

impl RumqttSession {
    pub fn new(options: &SessionOptions, reconnect: ReconnectConfig) -> Self {
        Self {
            options: configure_mqtt_options(options),
            reconnect,
            client: Mutex::new(None),
            pending: Mutex::new(None),
            network: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
            disconnect_requested: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl BrokerSession for RumqttSession {
    fn connect(&self, events: Arc<dyn SessionEvents>) -> MqttResult<()> {
        {
            let mut network = self.network.lock().unwrap_or_else(PoisonError::into_inner);
            match network.as_ref() {
                Some(handle) if !handle.is_finished() => {
                    return Err(MqttError::ConnectionFailed(
                        "network loop still running; stop it before reconnecting".to_string(),
                    ));
                }
                Some(_) => {
                    network.take();
                }
                None => {}
            }
        }

        let (client, connection) = Client::new(self.options.clone(), REQUEST_CAPACITY);
        self.disconnect_requested.store(false, Ordering::SeqCst);
        *self.client.lock().unwrap_or_else(PoisonError::into_inner) = Some(client);
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some((connection, events));
        Ok(())
    }

    fn loop_start(&self) -> MqttResult<()> {
        let (connection, events) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| {
                MqttError::ConnectionFailed("connect must be called before loop_start".to_string())
            })?;

        self.stop.store(false, Ordering::SeqCst);
        let network = NetworkLoop {
            events,
            stop: self.stop.clone(),
            disconnect_requested: self.disconnect_requested.clone(),
            reconnect: self.reconnect.clone(),
        };

        let handle = std::thread::Builder::new()
            .name("mqtt-network".to_string())
            .spawn(move || network.run(connection))
            .map_err(MqttError::client)?;

        *self.network.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> MqttResult<()> {
        let mut guard = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        let client = guard.as_mut().ok_or(MqttError::NotConnected)?;
        client
            .try_publish(topic, qos, retain, payload.to_vec())
            .map_err(|e| MqttError::publish_failed(topic, e))
    }

    fn disconnect(&self) -> MqttResult<()> {
        self.disconnect_requested.store(true, Ordering::SeqCst);
        let mut guard = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(client) => client.disconnect().map_err(MqttError::client),
            None => Ok(()),
        }
    }

    fn loop_stop(&self) -> MqttResult<()> {
        self.stop.store(true, Ordering::SeqCst);
        // Dropping the client closes the request queue and ends the iterator
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let handle = self
            .network
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| MqttError::client("network thread panicked")),
            None => Ok(()),
        }
    }

    fn destroy(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // A still-running network thread exits on its own once the queue is closed
        self.network
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// State owned by the network thread
struct NetworkLoop {
    events: Arc<dyn SessionEvents>,
    stop: Arc<AtomicBool>,
    disconnect_requested: Arc<AtomicBool>,
    reconnect: ReconnectConfig,
}

impl NetworkLoop {
    fn run(self, mut connection: Connection) {
        self.events.on_log(Level::DEBUG, "network loop started");
        let mut connected = false;
        let mut failures = 0u32;

        for notification in connection.iter() {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            match notification {
                Ok(event) => match route_mqtt_event(&event) {
                    EventRoute::ConnectionAcknowledged => {
                        connected = true;
                        failures = 0;
                        self.events.on_connect(ConnectOutcome::Accepted);
                    }
                    EventRoute::ConnectionRejected(reason) => {
                        connected = false;
                        self.events.on_connect(ConnectOutcome::Failed(reason));
                    }
                    EventRoute::DisconnectedByBroker(reason) => {
                        if connected {
                            connected = false;
                            self.events
                                .on_disconnect(DisconnectReason::Unexpected(reason));
                        }
                    }
                    EventRoute::Infrastructure => {}
                },
                Err(error) => {
                    if self.disconnect_requested.load(Ordering::SeqCst) {
                        if connected {
                            self.events.on_disconnect(DisconnectReason::Requested);
                        }
                        break;
                    }

                    let reason = describe_connection_error(&error);
                    if connected {
                        connected = false;
                        self.events
                            .on_disconnect(DisconnectReason::Unexpected(reason));
                    } else {
                        self.events.on_connect(ConnectOutcome::Failed(reason));
                    }

                    failures = failures.saturating_add(1);
                    let delay = self.reconnect.calculate_backoff_delay(failures);
                    self.events.on_log(
                        Level::DEBUG,
                        &format!("reconnect attempt {failures} in {delay}ms"),
                    );
                    if !interruptible_sleep(&self.stop, Duration::from_millis(delay)) {
                        break;
                    }
                }
            }
        }

        self.events.on_log(Level::DEBUG, "network loop stopped");
    }
}

/// Sleep in short slices; returns false if `stop` was raised
fn interruptible_sleep(stop: &AtomicBool, total: Duration) -> bool {
    let mut remaining = total;
    while !remaining.is_zero() {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let slice = remaining.min(SLEEP_SLICE);
        std::thread::sleep(slice);
        remaining -= slice;
    }
    !stop.load(Ordering::SeqCst)
}
