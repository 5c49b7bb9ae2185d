use crate::button::{self, ButtonHandle, Timing};
use crate::config::{ButtonConfig, DeviceConfig};
use crate::consts::{ButtonId, DeviceId};
use crate::error::ConfigError;
use crate::gesture::GestureEvent;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A configured, non-ignored button with its running classifier task.
#[derive(Debug)]
pub struct Button {
    pub name: String,
    handle: ButtonHandle,
}

impl Button {
    pub fn handle(&self) -> &ButtonHandle {
        &self.handle
    }
}

#[derive(Debug)]
enum ButtonEntry {
    Active(Button),
    Ignored,
}

#[derive(Debug)]
struct Device {
    name: Option<String>,
    /// Ignored devices keep no buttons; every lookup is answered as ignored.
    ignore: bool,
    logging: bool,
    buttons: HashMap<ButtonId, ButtonEntry>,
}

#[derive(Debug)]
pub enum Lookup<'a> {
    Active(&'a Button),
    Ignored,
    NotFound,
}

/// Validated button, before its task is started.
#[derive(Debug, PartialEq, Eq)]
struct ButtonPlan {
    id: ButtonId,
    name: String,
    single_press_only: bool,
}

#[derive(Debug, PartialEq, Eq)]
struct DevicePlan {
    id: DeviceId,
    name: Option<String>,
    ignore: bool,
    logging: bool,
    active: Vec<ButtonPlan>,
    ignored: Vec<ButtonId>,
}

fn plan_buttons(
    device: DeviceId,
    single_press_only: bool,
    buttons: &[ButtonConfig],
    errors: &mut Vec<ConfigError>,
) -> (Vec<ButtonPlan>, Vec<ButtonId>) {
    let mut active: Vec<ButtonPlan> = Vec::new();
    let mut ignored: Vec<ButtonId> = Vec::new();

    for (index, cfg) in buttons.iter().enumerate() {
        let Some(id) = cfg.id else {
            if cfg.ignore {
                debug!("Ignored button #{} of device {} has no id, dropping", index, device);
            } else {
                errors.push(ConfigError::MissingButtonId { device, index });
            }
            continue;
        };

        if active.iter().any(|b| b.id == id) || ignored.contains(&id) {
            errors.push(ConfigError::DuplicateButton { device, button: id });
            continue;
        }

        if cfg.ignore {
            info!("Ignoring device {}, button {}", device, id);
            ignored.push(id);
            continue;
        }

        let Some(name) = cfg.name.clone() else {
            errors.push(ConfigError::MissingButtonName { device, button: id });
            continue;
        };

        active.push(ButtonPlan {
            id,
            name,
            single_press_only: cfg.single_press_only.unwrap_or(single_press_only),
        });
    }

    (active, ignored)
}

/// Validates configured devices. Invalid entities are reported and left out,
/// the rest are kept.
fn plan(devices: &[DeviceConfig]) -> (Vec<DevicePlan>, Vec<ConfigError>) {
    let mut plans: Vec<DevicePlan> = Vec::new();
    let mut errors = Vec::new();

    for (index, cfg) in devices.iter().enumerate() {
        let Some(id) = cfg.id else {
            if cfg.ignore {
                debug!("Ignored device #{} has no id, dropping", index);
            } else {
                errors.push(ConfigError::MissingDeviceId { index });
            }
            continue;
        };

        if plans.iter().any(|d| d.id == id) {
            errors.push(ConfigError::DuplicateDevice { device: id });
            continue;
        }

        let mut device = DevicePlan {
            id,
            name: cfg.name.clone(),
            ignore: true,
            logging: cfg.logging,
            active: Vec::new(),
            ignored: Vec::new(),
        };

        if cfg.ignore {
            info!("Ignoring device {}", id);
            plans.push(device);
            continue;
        }

        if cfg.name.is_none() {
            errors.push(ConfigError::MissingDeviceName { device: id });
            continue;
        }

        match cfg.buttons.as_deref() {
            None | Some([]) => {
                info!("No buttons configured for device {}, ignoring", id);
            }
            Some(buttons) => {
                let (active, ignored) =
                    plan_buttons(id, cfg.single_press_only, buttons, &mut errors);
                device.ignore = false;
                device.active = active;
                device.ignored = ignored;
            }
        }
        plans.push(device);
    }

    (plans, errors)
}

/// Read-only map from (device, button) to its classifier task.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, Device>,
}

impl DeviceRegistry {
    /// Validate the configured devices and start a task per active button.
    /// Must be called within a tokio runtime.
    pub fn build(
        devices: &[DeviceConfig],
        timing: Timing,
        gestures: mpsc::Sender<GestureEvent>,
    ) -> (Self, Vec<ConfigError>) {
        let (plans, errors) = plan(devices);
        for err in &errors {
            warn!("Configuration error: {}", err);
        }

        let mut registry = HashMap::new();
        for plan in plans {
            let mut buttons = HashMap::new();
            for id in plan.ignored {
                buttons.insert(id, ButtonEntry::Ignored);
            }
            for b in plan.active {
                info!("Found device {}, button {} ({})", plan.id, b.id, b.name);
                let (handle, _task) = button::spawn(
                    plan.id,
                    b.id,
                    &b.name,
                    b.single_press_only,
                    timing,
                    gestures.clone(),
                );
                buttons.insert(
                    b.id,
                    ButtonEntry::Active(Button {
                        name: b.name,
                        handle,
                    }),
                );
            }
            registry.insert(
                plan.id,
                Device {
                    name: plan.name,
                    ignore: plan.ignore,
                    logging: plan.logging,
                    buttons,
                },
            );
        }

        (Self { devices: registry }, errors)
    }

    pub fn lookup(&self, device: DeviceId, button: ButtonId) -> Lookup<'_> {
        let Some(entry) = self.devices.get(&device) else {
            return Lookup::NotFound;
        };
        if entry.ignore {
            return Lookup::Ignored;
        }
        match entry.buttons.get(&button) {
            Some(ButtonEntry::Active(b)) => Lookup::Active(b),
            Some(ButtonEntry::Ignored) => Lookup::Ignored,
            None => Lookup::NotFound,
        }
    }

    /// Whether verbose diagnostics were requested for the device.
    pub fn logging(&self, device: DeviceId) -> bool {
        self.devices.get(&device).is_some_and(|d| d.logging)
    }

    pub fn device_name(&self, device: DeviceId) -> Option<&str> {
        self.devices.get(&device).and_then(|d| d.name.as_deref())
    }

    /// Number of buttons with a running classifier.
    pub fn active_buttons(&self) -> usize {
        self.devices
            .values()
            .flat_map(|d| d.buttons.values())
            .filter(|b| matches!(b, ButtonEntry::Active(_)))
            .count()
    }
}
