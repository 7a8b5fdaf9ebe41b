//! Home Assistant end-to-end tests
//!
//! Discovery documents, motion ON/OFF through the timeout service and the
//! periodic snapshot publisher, all observed at the mock broker.

use nvr_mqtt::detection::{Detection, DetectionResult};
use serde_json::Value;
use std::time::Duration;

use test_helpers::*;

fn detections(labels: &[&str]) -> DetectionResult {
    DetectionResult::new(labels.iter().map(|l| Detection::new(*l, 0.9)).collect())
}

fn last_payload(broker: &nvr_mqtt::testing::MockBroker, topic: &str) -> Option<String> {
    broker
        .published_to(topic)
        .last()
        .map(|m| m.payload_str().to_string())
}

#[test]
fn test_discovery_for_enabled_streams() {
    let (broker, integration) = connected_integration(test_config());

    let published = integration.publish_discovery();

    // Two enabled streams, three entities each
    assert_eq!(published, 6);
    let camera = broker.published_to("homeassistant/camera/lightnvr/front_door/config");
    assert_eq!(camera.len(), 1);
    assert!(camera[0].retain);
    assert!(broker
        .published_to("homeassistant/camera/lightnvr/attic/config")
        .is_empty());

    let topics = [
        "homeassistant/camera/lightnvr/front_door/config",
        "homeassistant/binary_sensor/lightnvr/front_door_motion/config",
        "homeassistant/sensor/lightnvr/front_door_detection_count/config",
    ];
    for topic in topics {
        let message = &broker.published_to(topic)[0];
        let json: Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(json["availability"][0]["topic"], "lightnvr/availability");
        assert_eq!(json["device"]["identifiers"][0], "lightnvr");
        assert_eq!(json["device"]["manufacturer"], "LightNVR");
    }

    integration.cleanup();
}

#[test]
fn test_remove_discovery_publishes_empty_retained_configs() {
    let (broker, integration) = connected_integration(test_config());

    assert_eq!(integration.remove_discovery("garage"), 3);

    let removed = broker.published_to("homeassistant/binary_sensor/lightnvr/garage_motion/config");
    assert_eq!(removed.len(), 1);
    assert!(removed[0].payload.is_empty());
    assert!(removed[0].retain);
    integration.cleanup();
}

#[test]
fn test_discovery_disabled_publishes_nothing() {
    let mut config = test_config();
    config.home_assistant.discovery_enabled = false;
    let (broker, integration) = connected_integration(config);

    assert_eq!(integration.publish_discovery(), 0);
    assert_eq!(integration.start_services(), 0);
    integration.set_motion_state("garage", &detections(&["car"]));

    assert!(broker.published_to("lightnvr/cameras/garage/motion").is_empty());
    assert!(broker.published_to("lightnvr/availability").is_empty());
    assert!(broker.last_session_options().unwrap().last_will.is_none());
    integration.cleanup();
}

#[test]
fn test_motion_turns_on_and_expires() {
    let (broker, integration) = connected_integration(test_config());
    assert_eq!(integration.start_services(), 2);

    integration.set_motion_state("Front Door", &detections(&["person", "person", "dog"]));

    assert_eq!(
        last_payload(&broker, "lightnvr/cameras/Front Door/motion").as_deref(),
        Some("ON")
    );
    assert_eq!(
        last_payload(&broker, "lightnvr/cameras/Front Door/detection_count").as_deref(),
        Some("3")
    );
    assert_eq!(
        last_payload(&broker, "lightnvr/cameras/Front Door/person").as_deref(),
        Some("2")
    );
    assert!(integration.motion_state("Front Door").unwrap().active);

    // motion_timeout_secs = 1 in the test config
    assert!(wait_until(Duration::from_secs(3), || {
        last_payload(&broker, "lightnvr/cameras/Front Door/motion").as_deref() == Some("OFF")
    }));
    assert_eq!(
        last_payload(&broker, "lightnvr/cameras/Front Door/detection_count").as_deref(),
        Some("0")
    );
    assert_eq!(
        last_payload(&broker, "lightnvr/cameras/Front Door/dog").as_deref(),
        Some("0")
    );
    assert!(!integration.motion_state("Front Door").unwrap().active);

    integration.cleanup();
}

#[test]
fn test_motion_on_published_once_per_activation() {
    let (broker, integration) = connected_integration(test_config());

    integration.set_motion_state("garage", &detections(&["car"]));
    integration.set_motion_state("garage", &detections(&["car", "car"]));

    assert_eq!(broker.published_to("lightnvr/cameras/garage/motion").len(), 1);
    assert_eq!(
        last_payload(&broker, "lightnvr/cameras/garage/car").as_deref(),
        Some("2")
    );

    integration.clear_motion_state("garage");
    assert_eq!(
        last_payload(&broker, "lightnvr/cameras/garage/motion").as_deref(),
        Some("OFF")
    );

    integration.set_motion_state("garage", &detections(&["car"]));
    assert_eq!(broker.published_to("lightnvr/cameras/garage/motion").len(), 3);
    integration.cleanup();
}

#[test]
fn test_snapshot_service_publishes_enabled_streams() {
    let (broker, integration) = connected_integration(test_config());

    integration.start_services();

    assert!(wait_until(Duration::from_secs(2), || {
        !broker
            .published_to("lightnvr/cameras/Front Door/snapshot")
            .is_empty()
            && !broker.published_to("lightnvr/cameras/garage/snapshot").is_empty()
    }));
    let snapshot = &broker.published_to("lightnvr/cameras/garage/snapshot")[0];
    assert_eq!(snapshot.payload, b"\xFF\xD8jpeg".to_vec());
    assert!(!snapshot.retain);
    assert!(broker
        .published_to("lightnvr/cameras/attic/snapshot")
        .is_empty());

    integration.cleanup();
}

#[test]
fn test_start_services_is_idempotent() {
    let (_broker, integration) = connected_integration(test_config());

    assert_eq!(integration.start_services(), 2);
    assert_eq!(integration.start_services(), 0);

    integration.stop_services();
    assert_eq!(integration.start_services(), 2);
    integration.cleanup();
}
