use crate::classifier::{Outcome, PressClassifier, Signal, TimerCommand, TimerKind, TimerToken};
use crate::config::TimingConfig;
use crate::consts::{self, ButtonId, DeviceId};
use crate::error::ConfigError;
use crate::gesture::GestureEvent;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use tracing::{debug, info, warn};

/// Raw signal forwarded by the dispatcher.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Press {
    Down,
    Up,
}

/// Gesture windows shared by all buttons.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Timing {
    pub single_press: Duration,
    pub long_press: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            single_press: Duration::from_millis(consts::DEFAULT_SINGLE_PRESS_MS),
            long_press: Duration::from_millis(consts::DEFAULT_LONG_PRESS_MS),
        }
    }
}

impl Timing {
    /// Applies configured overrides. A zero window is reported and the
    /// default kept.
    pub fn from_config(config: &TimingConfig) -> (Self, Vec<ConfigError>) {
        let mut timing = Self::default();
        let mut errors = Vec::new();

        match config.single_press_ms {
            Some(0) => errors.push(ConfigError::InvalidTiming {
                field: "single_press_ms",
            }),
            Some(ms) => timing.single_press = Duration::from_millis(ms),
            None => {}
        }
        match config.long_press_ms {
            Some(0) => errors.push(ConfigError::InvalidTiming {
                field: "long_press_ms",
            }),
            Some(ms) => timing.long_press = Duration::from_millis(ms),
            None => {}
        }

        (timing, errors)
    }

    fn window(&self, kind: TimerKind) -> Duration {
        match kind {
            TimerKind::SingleWindow => self.single_press,
            TimerKind::LongWindow => self.long_press,
        }
    }
}

/// Sending side of a running button task.
#[derive(Debug, Clone)]
pub struct ButtonHandle {
    tx: mpsc::Sender<Press>,
}

impl ButtonHandle {
    /// Queue a signal. Returns false if the button task is gone.
    pub async fn signal(&self, press: Press) -> bool {
        self.tx.send(press).await.is_ok()
    }
}

struct ArmedTimer {
    kind: TimerKind,
    token: TimerToken,
    sleep: Pin<Box<Sleep>>,
}

/// Owns one classifier and its timer. Inputs and expiries are handled in
/// turn on this task only.
struct ButtonTask {
    device: DeviceId,
    button: ButtonId,
    name: String,
    timing: Timing,
    classifier: PressClassifier,
    timer: Option<ArmedTimer>,
    gestures: mpsc::Sender<GestureEvent>,
}

async fn expiry(timer: &mut Option<ArmedTimer>) -> (TimerKind, TimerToken) {
    match timer {
        Some(armed) => {
            armed.sleep.as_mut().await;
            (armed.kind, armed.token)
        }
        None => std::future::pending().await,
    }
}

impl ButtonTask {
    async fn run(mut self, mut rx: mpsc::Receiver<Press>) {
        loop {
            tokio::select! {
                biased;

                fired = expiry(&mut self.timer) => {
                    let (kind, token) = fired;
                    self.timer = None;
                    self.apply(Signal::expired(kind, token)).await;
                }
                press = rx.recv() => {
                    let signal = match press {
                        Some(Press::Down) => Signal::Press,
                        Some(Press::Up) => Signal::Release,
                        None => break,
                    };
                    self.apply(signal).await;
                }
            }
        }
        debug!(device = self.device, button = self.button, "Button task finishing");
    }

    async fn apply(&mut self, signal: Signal) {
        let outcome = self.classifier.handle(signal);
        self.log(signal, &outcome);

        match outcome.timer {
            TimerCommand::Keep => {}
            TimerCommand::Cancel => self.timer = None,
            TimerCommand::Arm(kind, token) => {
                self.timer = Some(ArmedTimer {
                    kind,
                    token,
                    sleep: Box::pin(sleep(self.timing.window(kind))),
                });
            }
        }

        if let Some(gesture) = outcome.gesture {
            info!("SEND: {} [{}:{}] ({})", gesture, self.device, self.button, self.name);
            let event = GestureEvent {
                device: self.device,
                button: self.button,
                gesture,
            };
            if self.gestures.send(event).await.is_err() {
                warn!("Gesture consumer is gone, dropping {:?}", event);
            }
        }
    }

    fn log(&self, signal: Signal, outcome: &Outcome) {
        if !outcome.accepted {
            debug!(
                "[{}:{}] {}: ignored in {:?} ({})",
                self.device, self.button, signal, outcome.state, self.name
            );
            return;
        }
        if outcome.shortcut {
            debug!(
                "[{}:{}] SINGLE_ONLY: {:?} --> {:?} ({})",
                self.device, self.button, outcome.previous, outcome.state, self.name
            );
            return;
        }
        debug!(
            "[{}:{}] {}: {:?} --> {:?} ({})",
            self.device, self.button, signal, outcome.previous, outcome.state, self.name
        );
    }
}

/// Spawn the task serving one button.
pub fn spawn(
    device: DeviceId,
    button: ButtonId,
    name: &str,
    single_press_only: bool,
    timing: Timing,
    gestures: mpsc::Sender<GestureEvent>,
) -> (ButtonHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(16);
    let task = ButtonTask {
        device,
        button,
        name: name.to_string(),
        timing,
        classifier: PressClassifier::new(single_press_only),
        timer: None,
        gestures,
    };
    let handle = tokio::spawn(task.run(rx));
    (ButtonHandle { tx }, handle)
}
