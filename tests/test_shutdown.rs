//! Bounded teardown tests
//!
//! A wedged broker must never hold up process exit: every blocking step gets
//! a fixed budget, late callbacks are ignored and cleanup runs only once.

use nvr_mqtt::detection::{Detection, DetectionResult};
use nvr_mqtt::integration::ShutdownOutcome;
use nvr_mqtt::testing::{HangPoint, MockBroker};
use nvr_mqtt::transport::{ConnectOutcome, DisconnectReason};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use test_helpers::*;

#[test]
fn test_clean_shutdown_runs_every_step_in_order() {
    let (broker, integration) = connected_integration(test_config());
    assert_eq!(integration.start_services(), 2);

    let outcome = integration.cleanup();

    assert_eq!(outcome, ShutdownOutcome::Clean);
    assert_eq!(broker.calls("disconnect"), 1);
    assert_eq!(broker.calls("loop_stop"), 1);
    assert_eq!(broker.calls("destroy"), 1);
    assert!(broker.library_cleaned());
    assert!(!integration.is_connected());
}

#[test]
fn test_hung_broker_degrades_within_bound() {
    let (broker, integration) = connected_integration(test_config());
    broker.hang_on(HangPoint::Disconnect);
    broker.hang_on(HangPoint::Destroy);

    let start = Instant::now();
    let outcome = integration.cleanup();
    let elapsed = start.elapsed();

    match &outcome {
        ShutdownOutcome::Degraded { timed_out } => {
            assert!(timed_out.contains(&"disconnect"));
            assert!(timed_out.contains(&"destroy"));
            assert!(!timed_out.contains(&"loop_stop"));
        }
        ShutdownOutcome::Clean => panic!("hung steps should degrade the outcome"),
    }
    // Three guarded steps at 200ms each plus scheduling slack
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    assert!(!broker.library_cleaned());

    broker.release_hangs();
}

#[test]
fn test_hung_loop_stop_is_abandoned() {
    let (broker, integration) = connected_integration(test_config());
    broker.hang_on(HangPoint::LoopStop);

    let outcome = integration.cleanup();

    assert_eq!(
        outcome,
        ShutdownOutcome::Degraded {
            timed_out: vec!["loop_stop"]
        }
    );
    assert_eq!(broker.calls("destroy"), 1);
    assert!(!broker.library_cleaned());
    broker.release_hangs();
}

#[test]
fn test_hung_library_cleanup_is_bounded() {
    let (broker, integration) = connected_integration(test_config());
    broker.hang_on(HangPoint::LibraryCleanup);

    let start = Instant::now();
    let outcome = integration.cleanup();

    assert_eq!(
        outcome,
        ShutdownOutcome::Degraded {
            timed_out: vec!["library_cleanup"]
        }
    );
    assert!(start.elapsed() < Duration::from_secs(2));
    broker.release_hangs();
}

#[test]
fn test_cleanup_is_terminal() {
    let (broker, integration) = connected_integration(test_config());

    assert!(integration.cleanup().is_clean());
    assert!(integration.cleanup().is_clean());

    assert_eq!(broker.calls("destroy"), 1);
    assert_eq!(broker.calls("library_cleanup"), 1);
    assert!(integration.connect().is_err());
}

#[test]
fn test_cleanup_without_init_touches_nothing() {
    let broker = MockBroker::new();
    let integration = integration(&broker);

    assert!(integration.cleanup().is_clean());

    assert_eq!(broker.calls("disconnect"), 0);
    assert!(!broker.library_cleaned());
}

#[test]
fn test_late_callbacks_are_ignored_after_cleanup() {
    let (broker, integration) = connected_integration(test_config());
    integration.cleanup();
    broker.clear_published();

    broker.fire_connect(ConnectOutcome::Accepted);
    broker.fire_disconnect(DisconnectReason::Unexpected("socket closed".to_string()));

    assert!(!integration.is_connected());
    assert!(broker.published().is_empty());
}

#[test]
fn test_callback_storm_does_not_block_cleanup() {
    let (broker, integration) = connected_integration(test_config());
    let integration = Arc::new(integration);

    let storm = {
        let broker = broker.clone();
        thread::spawn(move || {
            for i in 0..500 {
                if i % 2 == 0 {
                    broker.fire_connect(ConnectOutcome::Accepted);
                } else {
                    broker.fire_disconnect(DisconnectReason::Unexpected("flap".to_string()));
                }
            }
        })
    };
    let publisher = {
        let integration = integration.clone();
        thread::spawn(move || {
            let result = DetectionResult::new(vec![Detection::new("person", 0.7)]);
            for _ in 0..200 {
                let _ = integration.publish_detection("garage", &result, chrono::Utc::now());
            }
        })
    };

    thread::sleep(Duration::from_millis(5));
    let start = Instant::now();
    let outcome = integration.cleanup();

    assert!(start.elapsed() < Duration::from_secs(3));
    storm.join().unwrap();
    publisher.join().unwrap();

    assert!(!integration.is_connected());
    assert!(!matches!(outcome, ShutdownOutcome::Degraded { ref timed_out } if timed_out.contains(&"destroy")));
    assert_eq!(broker.calls("destroy"), 1);
}

#[test]
fn test_services_stop_before_session_teardown() {
    let (broker, integration) = connected_integration(test_config());
    integration.start_services();
    assert!(wait_until(Duration::from_secs(2), || {
        !broker.published_to("lightnvr/cameras/garage/snapshot").is_empty()
    }));

    integration.cleanup();
    let after_cleanup = broker.published().len();
    thread::sleep(Duration::from_millis(100));

    assert_eq!(broker.published().len(), after_cleanup);
}
