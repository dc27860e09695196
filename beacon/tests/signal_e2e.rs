//! End-to-end tests: output signals talking to input signals over loopback.
//!
//! # Running with tracing
//!
//! ```bash
//! cargo test --features tracing --test signal_e2e -- --nocapture
//! RUST_LOG=beacon=trace cargo test --features tracing --test signal_e2e -- --nocapture
//! ```

use std::sync::mpsc::{self, Receiver};
use std::sync::{Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use beacon::control::{AnonymousServer, NamedClient};
use beacon::{
    AcceptorConfig, ConnectionError, Delivery, EmitterConfig, Endpoint, InputSignal,
    OutputSignal, SignalReceiver, SignalRegistry, SignalServer, delivery,
};

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        beacon::init_tracing();
    });
}

/// Delivery callback forwarding into a channel the test can wait on.
fn channel<T: Send + 'static>() -> (Delivery<T>, Receiver<(bool, Option<T>)>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let cb = delivery(move |active, value| {
        let _ = tx.lock().unwrap().send((active, value));
    });
    (cb, rx)
}

fn named_server<T: beacon::Payload>(
    names: &[&str],
) -> (SignalServer<T>, Vec<Receiver<(bool, Option<T>)>>) {
    let registry = SignalRegistry::new();
    let receivers = names
        .iter()
        .map(|name| {
            let (cb, rx) = channel();
            registry.register_qualified(*name, cb);
            rx
        })
        .collect();
    let server = SignalServer::bind(Endpoint::localhost(0), registry).expect("bind server");
    (server, receivers)
}

const WAIT: Duration = Duration::from_secs(3);

#[test]
fn emit_delivers_value_then_decays() {
    init_test_tracing();
    let (server, rx) = named_server::<String>(&["CD1.X"]);

    let output = OutputSignal::<String>::connect(server.local_endpoint(), "CD1", "X")
        .expect("named connect");
    let start = Instant::now();
    output.emit_ms("hello".into(), 200).unwrap();

    assert_eq!(rx[0].recv_timeout(WAIT).unwrap(), (true, Some("hello".into())));
    assert_eq!(rx[0].recv_timeout(WAIT).unwrap(), (false, None));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(190), "decayed early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "decayed late: {elapsed:?}");

    output.close().unwrap();
    server.close().unwrap();
}

#[test]
fn sustain_after_emit_cancels_decay() {
    init_test_tracing();
    let (server, rx) = named_server::<String>(&["CD1.X"]);
    let output = OutputSignal::<String>::connect(server.local_endpoint(), "CD1", "X").unwrap();

    output.emit_ms("a".into(), 1000).unwrap();
    thread::sleep(Duration::from_millis(100));
    output.sustain_with("b".into()).unwrap();

    assert_eq!(rx[0].recv_timeout(WAIT).unwrap(), (true, Some("a".into())));
    assert_eq!(rx[0].recv_timeout(WAIT).unwrap(), (true, Some("b".into())));
    // Well past the first emit's one-second deadline.
    assert!(rx[0].recv_timeout(Duration::from_millis(1300)).is_err());

    output.close().unwrap();
    server.close().unwrap();
}

#[test]
fn repeated_emits_yield_a_single_decay() {
    init_test_tracing();
    let (server, rx) = named_server::<u32>(&["CD.Tick"]);
    let output = OutputSignal::<u32>::connect(server.local_endpoint(), "CD", "Tick").unwrap();

    for i in 0..5 {
        output.emit_ms(i, 150).unwrap();
        thread::sleep(Duration::from_millis(30));
    }

    for i in 0..5 {
        assert_eq!(rx[0].recv_timeout(WAIT).unwrap(), (true, Some(i)));
    }
    assert_eq!(rx[0].recv_timeout(WAIT).unwrap(), (false, None));
    assert!(rx[0].recv_timeout(Duration::from_millis(300)).is_err());

    output.close().unwrap();
    server.close().unwrap();
}

#[test]
fn two_named_clients_do_not_cross_talk() {
    init_test_tracing();
    let (server, rx) = named_server::<String>(&["CD1.X", "CD2.Y"]);
    let endpoint = server.local_endpoint();

    let x = OutputSignal::<String>::connect(endpoint, "CD1", "X").unwrap();
    let y = OutputSignal::<String>::connect(endpoint, "CD2", "Y").unwrap();

    x.sustain_with("from-x".into()).unwrap();
    y.deactivate().unwrap();
    x.deactivate().unwrap();
    y.sustain().unwrap();

    assert_eq!(rx[0].recv_timeout(WAIT).unwrap(), (true, Some("from-x".into())));
    assert_eq!(rx[0].recv_timeout(WAIT).unwrap(), (false, None));
    assert_eq!(rx[1].recv_timeout(WAIT).unwrap(), (false, None));
    assert_eq!(rx[1].recv_timeout(WAIT).unwrap(), (true, None));
    assert!(rx[0].recv_timeout(Duration::from_millis(100)).is_err());
    assert!(rx[1].recv_timeout(Duration::from_millis(100)).is_err());

    x.close().unwrap();
    y.close().unwrap();
    server.close().unwrap();
}

#[test]
fn unregistered_name_fails_to_open() {
    init_test_tracing();
    let (server, _rx) = named_server::<String>(&["CD1.X"]);

    let err = OutputSignal::<String>::connect(server.local_endpoint(), "CD1", "Nope")
        .err()
        .expect("unknown signal must not open");
    assert!(matches!(err, ConnectionError::Rejected(_)), "got {err:?}");
    assert!(server.is_alive());

    server.close().unwrap();
}

#[test]
fn late_registration_is_visible_to_new_connections() {
    init_test_tracing();
    let (server, _rx) = named_server::<String>(&[]);
    let endpoint = server.local_endpoint();

    assert!(OutputSignal::<String>::connect(endpoint, "CD3", "Z").is_err());

    let (cb, rx) = channel();
    server.registry().register("CD3", "Z", cb);
    let output = OutputSignal::<String>::connect(endpoint, "CD3", "Z").unwrap();
    output.sustain().unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), (true, None));

    output.close().unwrap();
    server.close().unwrap();
}

#[test]
fn named_client_times_out_against_silent_server() {
    init_test_tracing();
    // Bound but never accepted: the connect succeeds, the ack never comes.
    let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = Endpoint::from(silent.local_addr().unwrap());

    let config = EmitterConfig {
        ack_timeout: Duration::from_millis(100),
        ..EmitterConfig::default()
    };
    let err = OutputSignal::<String>::connect_with(endpoint, "CD1", "X", config)
        .err()
        .unwrap();
    assert!(matches!(err, ConnectionError::Timeout), "got {err:?}");
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Reading {
    sensor: String,
    celsius: f32,
}

#[test]
fn anonymous_pair_carries_structured_payloads() {
    init_test_tracing();
    let receiver = SignalReceiver::<Reading>::bind(Endpoint::localhost(0)).unwrap();
    let (cb, rx) = channel();
    receiver.set_delivery(cb);

    let sender = OutputSignal::<Reading>::connect_anonymous(receiver.local_endpoint()).unwrap();
    let reading = Reading {
        sensor: "t0".into(),
        celsius: 21.5,
    };
    sender.sustain_with(reading.clone()).unwrap();
    sender.deactivate().unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), (true, Some(reading)));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), (false, None));

    sender.close().unwrap();
    receiver.close().unwrap();
}

#[test]
fn close_with_active_workers_terminates_everything() {
    init_test_tracing();
    let (cb, rx) = channel::<u8>();
    let handshake = AnonymousServer::with_delivery(cb);
    let input = InputSignal::open(Endpoint::localhost(0), handshake, AcceptorConfig::default())
        .unwrap();
    let endpoint = input.local_endpoint();

    let outputs: Vec<_> = (0..5u8)
        .map(|i| {
            let output = OutputSignal::<u8>::connect_anonymous(endpoint).unwrap();
            output.sustain_with(i).unwrap();
            output
        })
        .collect();
    for _ in 0..5 {
        rx.recv_timeout(WAIT).unwrap();
    }
    assert_eq!(input.active_workers(), 5);
    assert!(input.is_alive());

    input.close().unwrap();
    assert!(!input.is_alive());
    assert_eq!(input.active_workers(), 0);

    // Workers closed their connections; writes eventually fail.
    let deadline = Instant::now() + WAIT;
    let mut broken = 0;
    for output in &outputs {
        while Instant::now() < deadline {
            if output.sustain().is_err() {
                broken += 1;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
    assert_eq!(broken, outputs.len());

    // The listener is gone too.
    assert!(OutputSignal::<u8>::connect_anonymous(endpoint).is_err());
}

#[test]
fn shutdown_timeout_bounds_close_behind_a_stuck_callback() {
    init_test_tracing();
    let (release, blocked) = mpsc::channel::<()>();
    let blocked = Mutex::new(blocked);
    let (entered_tx, entered) = mpsc::channel();
    let entered_tx = Mutex::new(entered_tx);

    let handshake = AnonymousServer::<u8>::with_delivery(delivery(move |_, _| {
        let _ = entered_tx.lock().unwrap().send(());
        let _ = blocked.lock().unwrap().recv();
    }));
    let config = AcceptorConfig {
        shutdown_timeout: Some(Duration::from_millis(200)),
        ..AcceptorConfig::default()
    };
    let input = InputSignal::open(Endpoint::localhost(0), handshake, config).unwrap();

    let output = OutputSignal::<u8>::connect_anonymous(input.local_endpoint()).unwrap();
    output.sustain().unwrap();
    entered.recv_timeout(WAIT).unwrap();

    assert!(input.close().is_err());
    assert!(!input.is_alive());

    drop(release);
    let _ = output.close();
}

#[test]
fn named_client_with_custom_handshake_config() {
    init_test_tracing();
    let (server, rx) = named_server::<String>(&["Plant.Valve"]);

    let handshake = NamedClient::new("Plant.Valve").with_ack_timeout(Duration::from_secs(1));
    let output =
        OutputSignal::<String>::open(server.local_endpoint(), &handshake, EmitterConfig::default())
            .unwrap();
    output.sustain_with("open".into()).unwrap();
    assert_eq!(rx[0].recv_timeout(WAIT).unwrap(), (true, Some("open".into())));

    drop(output);
    // Dropping the output closes the connection; the server stays up.
    thread::sleep(Duration::from_millis(50));
    assert!(server.is_alive());
    server.close().unwrap();
}
