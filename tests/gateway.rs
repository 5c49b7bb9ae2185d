use pico_gate::button::Timing;
use pico_gate::config::{BridgeConfig, ButtonConfig, DeviceConfig, ReconnectConfig};
use pico_gate::dispatcher::Dispatcher;
use pico_gate::gesture::{Gesture, GestureEvent};
use pico_gate::registry::DeviceRegistry;
use pico_gate::transport::TransportConnection;
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

async fn login(stream: &mut TcpStream) {
    let (read, mut write) = stream.split();
    let mut read = BufReader::new(read);
    let mut line = String::new();
    write.write_all(b"login: ").await.unwrap();
    read.read_line(&mut line).await.unwrap();
    write.write_all(b"password: ").await.unwrap();
    read.read_line(&mut line).await.unwrap();
    write.write_all(b"\r\nGNET> ").await.unwrap();
}

fn devices() -> Vec<DeviceConfig> {
    let button = |id: u32, name: &str| ButtonConfig {
        id: Some(id),
        name: Some(name.to_string()),
        ..Default::default()
    };
    vec![DeviceConfig {
        id: Some(2),
        name: Some("Kitchen Pico".to_string()),
        buttons: Some(vec![button(2, "On"), button(4, "Off")]),
        ..Default::default()
    }]
}

async fn next_gesture(rx: &mut mpsc::Receiver<GestureEvent>) -> GestureEvent {
    timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn gestures_complete_across_a_bridge_outage() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (outage_over_tx, outage_over_rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let (mut first, _) = listener.accept().await.unwrap();
        login(&mut first).await;
        first
            .write_all(b"~DEVICE,2,2,3\r\n~DEVICE,2,2,4\r\n")
            .await
            .unwrap();
        drop(first);

        // Bridge stays unavailable until the test has seen the gesture.
        outage_over_rx.await.unwrap();
        let (mut second, _) = listener.accept().await.unwrap();
        login(&mut second).await;
        second.write_all(b"~DEVICE,2,4,3\r\n").await.unwrap();
        second
    });

    let timing = Timing {
        single_press: Duration::from_millis(100),
        long_press: Duration::from_millis(300),
    };
    let (gesture_tx, mut gestures) = mpsc::channel(16);
    let (registry, errors) = DeviceRegistry::build(&devices(), timing, gesture_tx);
    assert!(errors.is_empty());

    let shutdown = CancellationToken::new();
    let (line_tx, line_rx) = mpsc::channel(16);
    let bridge = BridgeConfig::new("127.0.0.1", port, "lutron", "integration");
    let reconnect = ReconnectConfig {
        initial_delay_ms: 10,
        max_delay_ms: 50,
    };
    let (transport, _state) =
        TransportConnection::new(bridge, &reconnect, line_tx, shutdown.clone());
    let transport = transport.spawn();
    let dispatcher = tokio::spawn(Dispatcher::new(registry).run(line_rx));

    // The press cycle finishes while the transport is reconnecting.
    assert_eq!(
        next_gesture(&mut gestures).await,
        GestureEvent {
            device: 2,
            button: 2,
            gesture: Gesture::SinglePress
        }
    );
    outage_over_tx.send(()).unwrap();

    // A held press on the new session.
    assert_eq!(
        next_gesture(&mut gestures).await,
        GestureEvent {
            device: 2,
            button: 4,
            gesture: Gesture::LongPress
        }
    );
    let _held = server.await.unwrap();

    shutdown.cancel();
    timeout(Duration::from_secs(5), transport).await.unwrap().unwrap();
    timeout(Duration::from_secs(5), dispatcher).await.unwrap().unwrap();

    // Button tasks are gone with the registry, nothing else arrives.
    let closed = timeout(Duration::from_secs(5), gestures.recv()).await.unwrap();
    assert!(closed.is_none());
}
