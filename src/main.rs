use clap::Parser;
use pico_gate::button::Timing;
use pico_gate::config::Config;
use pico_gate::dispatcher::Dispatcher;
use pico_gate::gesture::GestureEvent;
use pico_gate::homeassistant::{self, HomeAssistant};
use pico_gate::registry::DeviceRegistry;
use pico_gate::transport::TransportConnection;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "config.yaml")]
    config_path: String,
}

fn init_log() {
    let timer = fmt::time::ChronoLocal::new("%H:%M:%S%.3f".to_string());

    // Configure a custom event formatter
    let format = fmt::format()
        .with_level(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_source_location(true)
        .with_timer(timer)
        .compact();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::DEBUG.into())
        .from_env_lossy()
        .add_directive("rumqttc=info".parse().expect("static directive is valid"));

    fmt().event_format(format).with_env_filter(filter).init();
}

/// Connect the optional MQTT sink. Gestures are only logged without it.
async fn init_sink(config: &Config) -> Option<HomeAssistant> {
    let mqtt = config.mqtt.as_ref()?;
    match homeassistant::Initiator::new(mqtt).await {
        Ok(initiator) => {
            let ha = initiator.start().await;
            if let Err(err) = ha.send(homeassistant::Outgoing::Initial).await {
                warn!("Unable to announce start: {}", err);
            }
            Some(ha)
        }
        Err(err) => {
            error!("MQTT disabled: {}", err);
            None
        }
    }
}

async fn forward_gestures(mut gestures: mpsc::Receiver<GestureEvent>, ha: Option<HomeAssistant>) {
    while let Some(event) = gestures.recv().await {
        info!("Gesture {:?}", event);
        if let Some(ha) = &ha {
            if ha.send(homeassistant::Outgoing::Gesture(event)).await.is_err() {
                // The other end died.
                error!("MQTT sender is gone, gestures will only be logged");
                break;
            }
        }
    }
    while let Some(event) = gestures.recv().await {
        info!("Gesture {:?}", event);
    }
    info!("Gesture forwarding finishing");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_log();
    let args = Args::parse();

    let config = Config::from_file(&args.config_path)?;
    info!(
        "Starting {} {}. Bridge: {}:{}, {} device(s)",
        pico_gate::consts::GATE_NAME,
        pico_gate::consts::GATE_VERSION,
        config.bridge.host,
        config.bridge.port,
        config.devices.len()
    );

    let (timing, timing_errors) = Timing::from_config(&config.timing);
    for err in &timing_errors {
        warn!("Configuration error: {}", err);
    }

    let (gesture_tx, gesture_rx) = mpsc::channel(32);
    let (registry, errors) = DeviceRegistry::build(&config.devices, timing, gesture_tx);
    if !errors.is_empty() {
        warn!("{} configuration error(s), affected entities are excluded", errors.len());
    }
    info!("{} button(s) active", registry.active_buttons());

    let ha = init_sink(&config).await;
    let gestures = tokio::spawn(forward_gestures(gesture_rx, ha));

    let shutdown = CancellationToken::new();
    let (line_tx, line_rx) = mpsc::channel(64);
    let (transport, _state) = TransportConnection::new(
        config.bridge.clone(),
        &config.reconnect,
        line_tx,
        shutdown.clone(),
    );
    let transport = transport.spawn();

    let dispatcher = tokio::spawn(Dispatcher::new(registry).run(line_rx));

    info!("pico-gate initialized.");

    let stop = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, shutting down");
                stop.cancel();
            }
            Err(err) => error!("Unable to listen for Ctrl+C: {}", err),
        }
    });

    // Transport ends on shutdown, which closes the line channel, the
    // dispatcher and with it every button task and the gesture channel.
    let _ = transport.await;
    let _ = dispatcher.await;
    let _ = gestures.await;
    Ok(())
}
