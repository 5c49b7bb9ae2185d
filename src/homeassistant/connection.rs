use super::Outgoing;
use crate::config::MqttConfig;
use crate::consts;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use rumqttc::{Event, Packet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task;

use tracing::{debug, error, info, warn};

pub struct Initiator {
    client: AsyncClient,
    event_loop: EventLoop,
    base: String,
}

/// HA interfacing via MQTT
pub struct HomeAssistant {
    /// Outgoing event queue: things we sent to HA.
    outgoing: mpsc::Sender<Outgoing>,
}

impl Initiator {
    pub async fn new(config: &MqttConfig) -> anyhow::Result<Self> {
        let mut mqttoptions = MqttOptions::new(consts::GATE_NAME, &config.host, config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if !config.username.is_empty() {
            mqttoptions.set_credentials(&config.username, &config.password);
        }

        let (client, mut event_loop) = AsyncClient::new(mqttoptions, 10);

        // Fail early if parameters are invalid.
        if let Err(err) = event_loop.poll().await {
            warn!("Initial connection to MQTT failed. Check connection parameters");
            anyhow::bail!("Unable to contact MQTT at {}:{}: {}", config.host, config.port, err);
        }

        Ok(Initiator {
            client,
            event_loop,
            base: config.topic.clone(),
        })
    }

    /// Drive the MQTT event loop; rumqttc reconnects on the next poll after
    /// an error.
    async fn receiver(mut event_loop: EventLoop) {
        loop {
            let notification = event_loop.poll().await;
            match notification {
                Ok(Event::Outgoing(_))
                | Ok(Event::Incoming(Packet::PingResp))
                | Ok(Event::Incoming(Packet::PubAck(_))) => {
                    // Silence common messages
                    continue;
                }
                Ok(event) => {
                    info!("Received other message = {:?}", event);
                }
                Err(err) => {
                    error!("MQTT connection error: {}. Retrying", err);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn sender(client: AsyncClient, base: String, mut queue: mpsc::Receiver<Outgoing>) {
        while let Some(message) = queue.recv().await {
            let topic = message.topic(&base);
            let payload = message.payload();
            debug!("Publishing to {}: {}", topic, payload);
            let retain = matches!(message, Outgoing::Initial);
            let result = client
                .publish(topic, QoS::AtLeastOnce, retain, payload)
                .await;
            if let Err(err) = result {
                error!("Unable to publish {:?}: {}", message, err);
            }
        }
        // Channel end closed - quit.
    }

    pub async fn start(self) -> HomeAssistant {
        let (out_sender, out_receiver) = mpsc::channel::<Outgoing>(10);
        task::spawn(Self::receiver(self.event_loop));
        task::spawn(Self::sender(self.client, self.base, out_receiver));

        HomeAssistant {
            outgoing: out_sender,
        }
    }
}

impl HomeAssistant {
    pub async fn send(&self, msg: Outgoing) -> anyhow::Result<()> {
        self.outgoing.send(msg).await?;
        Ok(())
    }
}
