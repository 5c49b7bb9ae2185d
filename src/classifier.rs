//! Press cycle classification.
//!
//! The classifier is a plain state machine: it never sleeps and never owns a
//! timer. It tells its owner which timer to arm or cancel, and expects the
//! expiry back as a [`Signal`] carrying the token it handed out. Expiries with
//! a token that is no longer armed are dropped, so a timer that races its own
//! cancellation cannot affect a later cycle.
//!
//! ```text
//! Idle --Press--> FirstPress --Release--> AwaitingDoublePressWindow --SingleWindow--> Idle   [single]
//!                     |                              |
//!                     | LongWindow [long]            | Press [double]
//!                     v                              v
//!                 AwaitingRelease <-------------------
//!                     |
//!                     +--Release--> Idle
//! ```
use crate::gesture::Gesture;
use std::fmt;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum State {
    Idle,
    FirstPress,
    AwaitingDoublePressWindow,
    AwaitingRelease,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TimerKind {
    /// Started on the first release; a press before expiry is a double press.
    SingleWindow,
    /// Started on the first press; expiry before a release is a long press.
    LongWindow,
}

/// Identifies one arming of a timer.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct TimerToken(u64);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Signal {
    Press,
    Release,
    SingleWindowExpired(TimerToken),
    LongWindowExpired(TimerToken),
}

impl Signal {
    pub fn expired(kind: TimerKind, token: TimerToken) -> Self {
        match kind {
            TimerKind::SingleWindow => Signal::SingleWindowExpired(token),
            TimerKind::LongWindow => Signal::LongWindowExpired(token),
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Press => "PRESS",
            Signal::Release => "RELEASE",
            Signal::SingleWindowExpired(_) => "TIMEOUT_SINGLE",
            Signal::LongWindowExpired(_) => "TIMEOUT_LONG",
        };
        f.write_str(name)
    }
}

/// What the owner has to do with its timer after a signal.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TimerCommand {
    /// Leave the current timer (if any) alone.
    Keep,
    /// Drop the armed timer.
    Cancel,
    /// Drop any armed timer and start this one.
    Arm(TimerKind, TimerToken),
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Outcome {
    pub previous: State,
    pub state: State,
    pub gesture: Option<Gesture>,
    pub timer: TimerCommand,
    /// False when the signal did not fit the current state and was dropped.
    pub accepted: bool,
    /// The single-press-only shortcut was taken out of `FirstPress`.
    pub shortcut: bool,
}

impl Outcome {
    fn ignored(state: State) -> Self {
        Self {
            previous: state,
            state,
            gesture: None,
            timer: TimerCommand::Keep,
            accepted: false,
            shortcut: false,
        }
    }
}

#[derive(Debug)]
pub struct PressClassifier {
    state: State,
    single_press_only: bool,
    armed: Option<(TimerKind, TimerToken)>,
    next_token: u64,
}

impl PressClassifier {
    pub fn new(single_press_only: bool) -> Self {
        Self {
            state: State::Idle,
            single_press_only,
            armed: None,
            next_token: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn armed(&self) -> Option<(TimerKind, TimerToken)> {
        self.armed
    }

    fn is_armed(&self, kind: TimerKind, token: TimerToken) -> bool {
        self.armed == Some((kind, token))
    }

    fn arm(&mut self, kind: TimerKind) -> TimerCommand {
        self.next_token += 1;
        let token = TimerToken(self.next_token);
        self.armed = Some((kind, token));
        TimerCommand::Arm(kind, token)
    }

    /// Applies one signal. Out of sequence signals leave everything unchanged.
    pub fn handle(&mut self, signal: Signal) -> Outcome {
        let previous = self.state;
        let next = match (self.state, signal) {
            (State::Idle, Signal::Press) => (State::FirstPress, None),
            (State::FirstPress, Signal::Release) => (State::AwaitingDoublePressWindow, None),
            (State::FirstPress, Signal::LongWindowExpired(token))
                if self.is_armed(TimerKind::LongWindow, token) =>
            {
                (State::AwaitingRelease, Some(Gesture::LongPress))
            }
            (State::AwaitingDoublePressWindow, Signal::Press) => {
                (State::AwaitingRelease, Some(Gesture::DoublePress))
            }
            (State::AwaitingDoublePressWindow, Signal::SingleWindowExpired(token))
                if self.is_armed(TimerKind::SingleWindow, token) =>
            {
                (State::Idle, Some(Gesture::SinglePress))
            }
            (State::AwaitingRelease, Signal::Release) => (State::Idle, None),
            _ => return Outcome::ignored(previous),
        };
        let (mut state, mut gesture) = next;

        // Leaving a state drops the timer it started.
        let mut timer = match self.armed.take() {
            Some(_) => TimerCommand::Cancel,
            None => TimerCommand::Keep,
        };

        let mut shortcut = false;
        match state {
            State::FirstPress if self.single_press_only => {
                state = State::AwaitingRelease;
                gesture = Some(Gesture::SinglePress);
                shortcut = true;
            }
            State::FirstPress => timer = self.arm(TimerKind::LongWindow),
            State::AwaitingDoublePressWindow => timer = self.arm(TimerKind::SingleWindow),
            State::Idle | State::AwaitingRelease => {}
        }
        self.state = state;

        Outcome {
            previous,
            state,
            gesture,
            timer,
            accepted: true,
            shortcut,
        }
    }
}
