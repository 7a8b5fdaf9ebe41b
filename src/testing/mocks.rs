//! Mock broker for testing
//!
//! `MockBroker` implements both the backend and the session side of the broker
//! boundary. It records every publish and lifecycle call, can deliver connect
//! and disconnect callbacks on demand, and can simulate broker operations that
//! never return.

use crate::collaborators::{SnapshotSource, StreamInfo, StreamStore};
use crate::error::{MqttError, MqttResult};
use crate::transport::{
    BrokerBackend, BrokerSession, ConnectOutcome, DisconnectReason, QoS, SessionEvents,
    SessionOptions,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// One message handed to the mock session
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or("")
    }
}

/// Operations that can be made to hang forever
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HangPoint {
    Disconnect,
    LoopStop,
    Destroy,
    LibraryCleanup,
}

#[derive(Default)]
struct Recorded {
    sessions_created: usize,
    last_options: Option<SessionOptions>,
    events: Option<Arc<dyn SessionEvents>>,
    published: Vec<PublishedMessage>,
    calls: HashMap<&'static str, usize>,
}

#[derive(Default)]
struct Knobs {
    hangs: Vec<HangPoint>,
    fail_loop_start: bool,
    fail_publish: bool,
    auto_connect: bool,
}

#[derive(Default)]
struct Inner {
    recorded: Mutex<Recorded>,
    knobs: Mutex<Knobs>,
    released: Mutex<bool>,
    release: Condvar,
}

/// Scripted in-memory broker
#[derive(Clone, Default)]
pub struct MockBroker {
    inner: Arc<Inner>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker that accepts every connection shortly after `connect`
    pub fn with_auto_connect() -> Self {
        let broker = Self::new();
        broker.knobs().auto_connect = true;
        broker
    }

    fn recorded(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.inner
            .recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn knobs(&self) -> std::sync::MutexGuard<'_, Knobs> {
        self.inner.knobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn hang_on(&self, point: HangPoint) {
        self.knobs().hangs.push(point);
    }

    pub fn fail_loop_start(&self, fail: bool) {
        self.knobs().fail_loop_start = fail;
    }

    pub fn fail_publish(&self, fail: bool) {
        self.knobs().fail_publish = fail;
    }

    /// Let every hung operation return
    pub fn release_hangs(&self) {
        *self
            .inner
            .released
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
        self.inner.release.notify_all();
    }

    fn record_call(&self, name: &'static str) {
        *self.recorded().calls.entry(name).or_insert(0) += 1;
    }

    fn maybe_hang(&self, point: HangPoint) {
        if !self.knobs().hangs.contains(&point) {
            return;
        }
        let mut released = self
            .inner
            .released
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*released {
            released = self
                .inner
                .release
                .wait(released)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn events(&self) -> Option<Arc<dyn SessionEvents>> {
        self.recorded().events.clone()
    }

    /// Deliver a connect result as the network thread would
    pub fn fire_connect(&self, outcome: ConnectOutcome) {
        if let Some(events) = self.events() {
            events.on_connect(outcome);
        }
    }

    /// Deliver a disconnect notification as the network thread would
    pub fn fire_disconnect(&self, reason: DisconnectReason) {
        if let Some(events) = self.events() {
            events.on_disconnect(reason);
        }
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.recorded().published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.recorded()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn clear_published(&self) {
        self.recorded().published.clear();
    }

    pub fn calls(&self, name: &str) -> usize {
        self.recorded().calls.get(name).copied().unwrap_or(0)
    }

    pub fn sessions_created(&self) -> usize {
        self.recorded().sessions_created
    }

    pub fn last_session_options(&self) -> Option<SessionOptions> {
        self.recorded().last_options.clone()
    }

    pub fn library_cleaned(&self) -> bool {
        self.calls("library_cleanup") > 0
    }
}

impl BrokerBackend for MockBroker {
    fn create_session(&self, options: SessionOptions) -> MqttResult<Arc<dyn BrokerSession>> {
        {
            let mut recorded = self.recorded();
            recorded.sessions_created += 1;
            recorded.last_options = Some(options);
        }
        Ok(Arc::new(MockSession {
            broker: self.clone(),
        }))
    }

    fn cleanup(&self) {
        self.record_call("library_cleanup");
        self.maybe_hang(HangPoint::LibraryCleanup);
    }
}

/// Session handed out by [`MockBroker`]
pub struct MockSession {
    broker: MockBroker,
}

impl BrokerSession for MockSession {
    fn connect(&self, events: Arc<dyn SessionEvents>) -> MqttResult<()> {
        self.broker.record_call("connect");
        self.broker.recorded().events = Some(events.clone());

        if self.broker.knobs().auto_connect {
            // Deliver from another thread, like a real network loop
            std::thread::spawn(move || events.on_connect(ConnectOutcome::Accepted));
        }
        Ok(())
    }

    fn loop_start(&self) -> MqttResult<()> {
        self.broker.record_call("loop_start");
        if self.broker.knobs().fail_loop_start {
            return Err(MqttError::client("mock loop start failure"));
        }
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> MqttResult<()> {
        self.broker.record_call("publish");
        if self.broker.knobs().fail_publish {
            return Err(MqttError::publish_failed(topic, "mock publish failure"));
        }
        self.broker.recorded().published.push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        });
        Ok(())
    }

    fn disconnect(&self) -> MqttResult<()> {
        self.broker.record_call("disconnect");
        self.broker.maybe_hang(HangPoint::Disconnect);
        Ok(())
    }

    fn loop_stop(&self) -> MqttResult<()> {
        self.broker.record_call("loop_stop");
        self.broker.maybe_hang(HangPoint::LoopStop);
        Ok(())
    }

    fn destroy(&self) {
        self.broker.record_call("destroy");
        self.broker.maybe_hang(HangPoint::Destroy);
    }
}

/// Stream store with a fixed list
#[derive(Debug, Clone, Default)]
pub struct MockStreamStore {
    pub streams: Vec<StreamInfo>,
}

impl MockStreamStore {
    pub fn with_streams(streams: &[(&str, bool)]) -> Self {
        Self {
            streams: streams
                .iter()
                .map(|(name, enabled)| StreamInfo {
                    name: name.to_string(),
                    enabled: *enabled,
                })
                .collect(),
        }
    }
}

impl StreamStore for MockStreamStore {
    fn list_streams(&self) -> Vec<StreamInfo> {
        self.streams.clone()
    }
}

/// Snapshot source returning the same bytes for every stream
#[derive(Debug, Clone, Default)]
pub struct MockSnapshotSource {
    pub image: Option<Bytes>,
}

impl MockSnapshotSource {
    pub fn with_image(image: &'static [u8]) -> Self {
        Self {
            image: Some(Bytes::from_static(image)),
        }
    }
}

impl SnapshotSource for MockSnapshotSource {
    fn get_snapshot(&self, _stream: &str) -> Option<Bytes> {
        self.image.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options() -> SessionOptions {
        SessionOptions {
            client_id: "mock".to_string(),
            host: "localhost".to_string(),
            port: 1883,
            keep_alive: Duration::from_secs(60),
            credentials: None,
            tls: false,
            last_will: None,
        }
    }

    #[test]
    fn test_mock_records_publishes() {
        let broker = MockBroker::new();
        let session = broker.create_session(options()).unwrap();

        session
            .publish("a/b", b"hello", QoS::AtLeastOnce, true)
            .unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload_str(), "hello");
        assert!(published[0].retain);
        assert_eq!(broker.calls("publish"), 1);
    }

    #[test]
    fn test_mock_publish_failure() {
        let broker = MockBroker::new();
        broker.fail_publish(true);
        let session = broker.create_session(options()).unwrap();

        assert!(session.publish("a/b", b"x", QoS::AtMostOnce, false).is_err());
        assert!(broker.published().is_empty());
    }

    #[test]
    fn test_hang_released() {
        let broker = MockBroker::new();
        broker.hang_on(HangPoint::Destroy);
        let session = broker.create_session(options()).unwrap();

        let handle = std::thread::spawn(move || session.destroy());
        std::thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        broker.release_hangs();
        handle.join().unwrap();
        assert_eq!(broker.calls("destroy"), 1);
    }
}
