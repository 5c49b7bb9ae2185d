use crate::button::Press;
use crate::protocol::{self, Action};
use crate::registry::{DeviceRegistry, Lookup};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// What happened to one received line.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Routed {
    Delivered(Press),
    NotAnEvent,
    Malformed,
    UnknownAction,
    Ignored,
    NotFound,
    /// The button task is gone.
    Undeliverable,
}

/// Routes bridge lines to button tasks.
pub struct Dispatcher {
    registry: DeviceRegistry,
}

impl Dispatcher {
    pub fn new(registry: DeviceRegistry) -> Self {
        Self { registry }
    }

    /// Handle one line. Signals for a button are queued in the order lines
    /// are dispatched.
    pub async fn dispatch(&self, line: &str) -> Routed {
        let event = match protocol::parse_line(line) {
            Ok(Some(event)) => event,
            Ok(None) => return Routed::NotAnEvent,
            Err(err) => {
                warn!("Dropping malformed line {:?}: {}", line.trim(), err);
                return Routed::Malformed;
            }
        };
        let (device, button, code) = (event.device, event.button, event.action_code);

        let target = match self.registry.lookup(device, button) {
            Lookup::Active(target) => target,
            Lookup::Ignored => {
                if self.registry.logging(device) {
                    info!(
                        "RCV IGNORED: deviceId={}, buttonId={}, actionNumber={}",
                        device, button, code
                    );
                } else {
                    debug!(
                        "RCV IGNORED: deviceId={}, buttonId={}, actionNumber={}",
                        device, button, code
                    );
                }
                return Routed::Ignored;
            }
            Lookup::NotFound => {
                info!("RCV UNK: deviceId={}, buttonId={}, actionNumber={}", device, button, code);
                return Routed::NotFound;
            }
        };
        let device_name = self.registry.device_name(device).unwrap_or("?");

        let press = match event.action() {
            Action::Press => {
                info!("RCV PRESS: [{}:{}] - {} ({})", device, button, device_name, target.name);
                Press::Down
            }
            Action::Release => {
                info!("RCV RELEASE: [{}:{}] - {} ({})", device, button, device_name, target.name);
                Press::Up
            }
            Action::Unknown(code) => {
                info!(
                    "RCV UNKNOWN: [{}:{}] - {} ({}) - |{}|",
                    device, button, device_name, target.name, code
                );
                return Routed::UnknownAction;
            }
        };

        if target.handle().signal(press).await {
            Routed::Delivered(press)
        } else {
            error!("Button task for [{}:{}] is gone", device, button);
            Routed::Undeliverable
        }
    }

    /// Consume lines until the transport side closes.
    pub async fn run(self, mut lines: mpsc::Receiver<String>) {
        while let Some(line) = lines.recv().await {
            self.dispatch(&line).await;
        }
        info!("Dispatcher finishing");
    }
}
