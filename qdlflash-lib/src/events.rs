//! Session state and the observer interface.
//!
//! The orchestrator never talks to a presentation layer directly. Every state
//! change is published as a typed [`FlashEvent`] together with the full
//! [`FlashSnapshot`] it produced, so an observer always sees the step and the
//! error as one consistent pair.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};
use strum::{Display, EnumIter};

/// Progress value reported when the current operation has no known fraction.
pub const PROGRESS_UNKNOWN: f64 = -1.0;

/// Stage of the flashing lifecycle, in the order a session walks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Step {
    Initializing,
    Ready,
    Connecting,
    RepairPartitionTables,
    EraseDevice,
    FlashSystem,
    Finalizing,
    Done,
}

impl Step {
    /// Short human readable status for the step.
    pub fn status(self) -> &'static str {
        match self {
            Step::Initializing => "Initializing...",
            Step::Ready => "Ready to start",
            Step::Connecting => "Waiting for connection",
            Step::RepairPartitionTables => "Repairing partition tables...",
            Step::EraseDevice => "Erasing device...",
            Step::FlashSystem => "Flashing device...",
            Step::Finalizing => "Finalizing...",
            Step::Done => "Done",
        }
    }

    /// Steps during which the device holds partially written state.
    pub fn is_device_busy(self) -> bool {
        match self {
            Step::RepairPartitionTables
            | Step::EraseDevice
            | Step::FlashSystem
            | Step::Finalizing => true,
            Step::Initializing | Step::Ready | Step::Connecting | Step::Done => false,
        }
    }

    /// The step that directly follows this one, if any.
    pub fn next(self) -> Option<Step> {
        match self {
            Step::Initializing => Some(Step::Ready),
            Step::Ready => Some(Step::Connecting),
            Step::Connecting => Some(Step::RepairPartitionTables),
            Step::RepairPartitionTables => Some(Step::EraseDevice),
            Step::EraseDevice => Some(Step::FlashSystem),
            Step::FlashSystem => Some(Step::Finalizing),
            Step::Finalizing => Some(Step::Done),
            Step::Done => None,
        }
    }
}

/// Failure kinds surfaced to observers. Every condition is terminal for the
/// session that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCondition {
    Unknown,
    RequirementsNotMet,
    StorageSpace,
    UnrecognizedDevice,
    LostConnection,
    RepairPartitionTablesFailed,
    EraseFailed,
    FlashSystemFailed,
}

impl ErrorCondition {
    pub fn status(self) -> &'static str {
        match self {
            ErrorCondition::Unknown => "Unknown error",
            ErrorCondition::RequirementsNotMet => "Requirements not met",
            ErrorCondition::StorageSpace => "Not enough storage space",
            ErrorCondition::UnrecognizedDevice => "Unrecognized device",
            ErrorCondition::LostConnection => "Lost connection",
            ErrorCondition::RepairPartitionTablesFailed => "Repairing partition tables failed",
            ErrorCondition::EraseFailed => "Erase failed",
            ErrorCondition::FlashSystemFailed => "Flash failed",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorCondition::Unknown => {
                "An unknown error has occurred. Unplug your device and try again."
            }
            ErrorCondition::RequirementsNotMet => {
                "This host cannot access USB devices. Check that USB support is available."
            }
            ErrorCondition::StorageSpace => {
                "There is not enough space available to download the system image."
            }
            ErrorCondition::UnrecognizedDevice => {
                "The connected device is not supported. Try a different cable, USB port, or computer."
            }
            ErrorCondition::LostConnection => {
                if cfg!(target_os = "linux") {
                    "The connection to your device was lost. Unplug your device and try again. \
                     Did you forget to unbind the device from qcserial?"
                } else {
                    "The connection to your device was lost. Unplug your device and try again."
                }
            }
            ErrorCondition::RepairPartitionTablesFailed => {
                "The partition tables could not be repaired. Try a different cable, USB port, or computer."
            }
            ErrorCondition::EraseFailed => {
                "The device could not be erased. Try a different cable, USB port, or computer."
            }
            ErrorCondition::FlashSystemFailed => {
                "The system image could not be flashed. Try a different cable, USB port, or computer."
            }
        }
    }
}

/// One state change, as seen by observers.
#[derive(Debug, Clone, PartialEq)]
pub enum FlashEvent {
    StepChanged(Step),
    MessageChanged(String),
    /// Fraction in `[0, 1]`, or [`PROGRESS_UNKNOWN`].
    ProgressChanged(f64),
    ErrorChanged(Option<ErrorCondition>),
    ConnectionChanged(bool),
    SerialChanged(Option<String>),
}

/// Everything an observer may want to render, read atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct FlashSnapshot {
    pub step: Step,
    pub error: Option<ErrorCondition>,
    pub message: String,
    pub progress: f64,
    pub connected: bool,
    pub serial: Option<String>,
}

impl Default for FlashSnapshot {
    fn default() -> Self {
        Self {
            step: Step::Initializing,
            error: None,
            message: String::new(),
            progress: PROGRESS_UNKNOWN,
            connected: false,
            serial: None,
        }
    }
}

impl FlashSnapshot {
    /// A session can only be started from `Ready` with no error raised.
    pub fn can_start(&self) -> bool {
        self.step == Step::Ready && self.error.is_none()
    }

    /// True once nothing more will happen without a reset.
    pub fn is_terminal(&self) -> bool {
        self.step == Step::Done || self.error.is_some()
    }
}

/// Receives every state change of a flashing session.
///
/// Implementations are called from the session thread and from the
/// connection watcher, so they must be `Send + Sync`.
pub trait FlashObserver: Send + Sync {
    fn on_event(&self, event: &FlashEvent, snapshot: &FlashSnapshot);
}

/// Observer that ignores everything.
#[derive(Debug, Default)]
pub struct NoOpObserver;

impl FlashObserver for NoOpObserver {
    fn on_event(&self, _event: &FlashEvent, _snapshot: &FlashSnapshot) {}
}

pub type FlashObserverArc = Arc<dyn FlashObserver>;

pub fn no_op_observer() -> FlashObserverArc {
    Arc::new(NoOpObserver)
}

/// Forwards events into a channel, for hosts that prefer polling a queue.
pub struct ChannelObserver {
    sender: Mutex<Sender<(FlashEvent, FlashSnapshot)>>,
}

impl ChannelObserver {
    pub fn new(sender: Sender<(FlashEvent, FlashSnapshot)>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl FlashObserver for ChannelObserver {
    fn on_event(&self, event: &FlashEvent, snapshot: &FlashSnapshot) {
        if let Ok(sender) = self.sender.lock() {
            // receiver gone means nobody is listening any more
            let _ = sender.send((event.clone(), snapshot.clone()));
        }
    }
}

type Callback<T> = Box<dyn Fn(T) + Send + Sync>;

/// Per-field callbacks, one for each kind of [`FlashEvent`].
#[derive(Default)]
pub struct CallbackObserver {
    on_step_change: Option<Callback<Step>>,
    on_message_change: Option<Box<dyn Fn(&str) + Send + Sync>>,
    on_progress_change: Option<Callback<f64>>,
    on_error_change: Option<Callback<Option<ErrorCondition>>>,
    on_connection_change: Option<Callback<bool>>,
    on_serial_change: Option<Box<dyn Fn(Option<&str>) + Send + Sync>>,
}

impl CallbackObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_step_change(mut self, f: impl Fn(Step) + Send + Sync + 'static) -> Self {
        self.on_step_change = Some(Box::new(f));
        self
    }

    pub fn on_message_change(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_message_change = Some(Box::new(f));
        self
    }

    pub fn on_progress_change(mut self, f: impl Fn(f64) + Send + Sync + 'static) -> Self {
        self.on_progress_change = Some(Box::new(f));
        self
    }

    pub fn on_error_change(
        mut self,
        f: impl Fn(Option<ErrorCondition>) + Send + Sync + 'static,
    ) -> Self {
        self.on_error_change = Some(Box::new(f));
        self
    }

    pub fn on_connection_change(mut self, f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_connection_change = Some(Box::new(f));
        self
    }

    pub fn on_serial_change(mut self, f: impl Fn(Option<&str>) + Send + Sync + 'static) -> Self {
        self.on_serial_change = Some(Box::new(f));
        self
    }
}

impl FlashObserver for CallbackObserver {
    fn on_event(&self, event: &FlashEvent, _snapshot: &FlashSnapshot) {
        match event {
            FlashEvent::StepChanged(step) => {
                if let Some(f) = &self.on_step_change {
                    f(*step);
                }
            }
            FlashEvent::MessageChanged(message) => {
                if let Some(f) = &self.on_message_change {
                    f(message);
                }
            }
            FlashEvent::ProgressChanged(progress) => {
                if let Some(f) = &self.on_progress_change {
                    f(*progress);
                }
            }
            FlashEvent::ErrorChanged(error) => {
                if let Some(f) = &self.on_error_change {
                    f(*error);
                }
            }
            FlashEvent::ConnectionChanged(connected) => {
                if let Some(f) = &self.on_connection_change {
                    f(*connected);
                }
            }
            FlashEvent::SerialChanged(serial) => {
                if let Some(f) = &self.on_serial_change {
                    f(serial.as_deref());
                }
            }
        }
    }
}

/// Shared, observable session state.
///
/// All mutations go through here. `emit` serialises mutate-then-notify so
/// observers see changes in the order they were applied.
pub(crate) struct SessionState {
    snapshot: Mutex<FlashSnapshot>,
    emit: Mutex<()>,
    observer: FlashObserverArc,
}

impl SessionState {
    pub(crate) fn new(observer: FlashObserverArc) -> Self {
        Self {
            snapshot: Mutex::new(FlashSnapshot::default()),
            emit: Mutex::new(()),
            observer,
        }
    }

    fn lock_snapshot(&self) -> MutexGuard<'_, FlashSnapshot> {
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn snapshot(&self) -> FlashSnapshot {
        self.lock_snapshot().clone()
    }

    /// Applies `f`; if it returns an event, notifies the observer with the
    /// resulting snapshot.
    fn update(&self, f: impl FnOnce(&mut FlashSnapshot) -> Option<FlashEvent>) -> bool {
        let _order = self.emit.lock().unwrap_or_else(|e| e.into_inner());
        let (event, snapshot) = {
            let mut snapshot = self.lock_snapshot();
            match f(&mut snapshot) {
                Some(event) => (event, snapshot.clone()),
                None => return false,
            }
        };
        self.observer.on_event(&event, &snapshot);
        true
    }

    /// Moves forward to `step`. Backward or repeated transitions and any
    /// transition after an error are refused.
    /// Progress restarts as unknown for the new step.
    pub(crate) fn set_step(&self, step: Step) -> bool {
        let moved = self.update(|s| {
            if s.error.is_some() || step <= s.step {
                tracing::warn!("refusing step transition {} -> {}", s.step, step);
                return None;
            }
            tracing::info!("step {} -> {}", s.step, step);
            s.step = step;
            Some(FlashEvent::StepChanged(step))
        });
        if moved {
            self.set_progress(PROGRESS_UNKNOWN);
        }
        moved
    }

    pub(crate) fn set_message(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|s| {
            if s.message == message {
                return None;
            }
            s.message = message.clone();
            Some(FlashEvent::MessageChanged(message))
        });
    }

    /// Progress within a step never goes backwards; a lower value is dropped.
    pub(crate) fn set_progress(&self, progress: f64) {
        self.update(|s| {
            let progress = if progress < 0.0 {
                PROGRESS_UNKNOWN
            } else {
                progress.min(1.0)
            };
            if progress == s.progress || (progress >= 0.0 && progress < s.progress) {
                return None;
            }
            s.progress = progress;
            Some(FlashEvent::ProgressChanged(progress))
        });
    }

    /// Raises `error` unless one is already raised. Returns whether this call won.
    pub(crate) fn raise_error(&self, error: ErrorCondition) -> bool {
        self.update(|s| {
            if let Some(existing) = s.error {
                tracing::debug!("{} already raised, dropping {}", existing, error);
                return None;
            }
            tracing::error!("{} raised during {}", error, s.step);
            s.error = Some(error);
            Some(FlashEvent::ErrorChanged(Some(error)))
        })
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.update(|s| {
            if s.connected == connected {
                return None;
            }
            s.connected = connected;
            Some(FlashEvent::ConnectionChanged(connected))
        });
    }

    /// Records the device serial. Once observed it is fixed for the session.
    pub(crate) fn set_serial(&self, serial: String) {
        self.update(|s| match &s.serial {
            Some(existing) if *existing == serial => None,
            Some(existing) => {
                tracing::warn!("ignoring serial {} (session bound to {})", serial, existing);
                None
            }
            None => {
                s.serial = Some(serial.clone());
                Some(FlashEvent::SerialChanged(Some(serial)))
            }
        });
    }

    /// Returns to a fresh `Initializing` snapshot, announcing every field that changed.
    pub(crate) fn reset(&self) {
        let _order = self.emit.lock().unwrap_or_else(|e| e.into_inner());
        let (old, fresh) = {
            let mut snapshot = self.lock_snapshot();
            let old = snapshot.clone();
            *snapshot = FlashSnapshot::default();
            (old, snapshot.clone())
        };
        let mut events = Vec::new();
        if old.step != fresh.step {
            events.push(FlashEvent::StepChanged(fresh.step));
        }
        if old.error.is_some() {
            events.push(FlashEvent::ErrorChanged(None));
        }
        if !old.message.is_empty() {
            events.push(FlashEvent::MessageChanged(String::new()));
        }
        if old.progress != fresh.progress {
            events.push(FlashEvent::ProgressChanged(fresh.progress));
        }
        if old.connected {
            events.push(FlashEvent::ConnectionChanged(false));
        }
        if old.serial.is_some() {
            events.push(FlashEvent::SerialChanged(None));
        }
        for event in events {
            self.observer.on_event(&event, &fresh);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use strum::IntoEnumIterator;

    fn state() -> (SessionState, mpsc::Receiver<(FlashEvent, FlashSnapshot)>) {
        let (tx, rx) = mpsc::channel();
        (SessionState::new(Arc::new(ChannelObserver::new(tx))), rx)
    }

    #[test]
    fn steps_are_ordered_and_chained() {
        let steps: Vec<Step> = Step::iter().collect();
        for pair in steps.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[0].next(), Some(pair[1]));
        }
        assert_eq!(Step::Done.next(), None);
        assert_eq!(Step::FlashSystem.to_string(), "FLASH_SYSTEM");
        assert_eq!(
            ErrorCondition::RepairPartitionTablesFailed.to_string(),
            "REPAIR_PARTITION_TABLES_FAILED"
        );
    }

    #[test]
    fn step_cannot_go_backwards() {
        let (state, rx) = state();
        assert!(state.set_step(Step::Ready));
        assert!(!state.set_step(Step::Initializing));
        assert!(!state.set_step(Step::Ready));
        assert_eq!(state.snapshot().step, Step::Ready);
        let steps = rx
            .try_iter()
            .filter(|(e, _)| matches!(e, FlashEvent::StepChanged(_)))
            .count();
        assert_eq!(steps, 1);
    }

    #[test]
    fn first_error_wins_and_freezes_step() {
        let (state, rx) = state();
        state.set_step(Step::Ready);
        assert!(state.raise_error(ErrorCondition::LostConnection));
        assert!(!state.raise_error(ErrorCondition::EraseFailed));
        assert!(!state.set_step(Step::Connecting));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.step, Step::Ready);
        assert_eq!(snapshot.error, Some(ErrorCondition::LostConnection));

        let (event, seen) = rx.try_iter().last().unwrap();
        assert_eq!(
            event,
            FlashEvent::ErrorChanged(Some(ErrorCondition::LostConnection))
        );
        assert_eq!(seen.step, Step::Ready);
    }

    #[test]
    fn progress_is_monotonic_within_a_step() {
        let (state, _rx) = state();
        state.set_progress(0.5);
        state.set_progress(0.25);
        assert_eq!(state.snapshot().progress, 0.5);
        state.set_progress(2.0);
        assert_eq!(state.snapshot().progress, 1.0);
        state.set_step(Step::Ready);
        assert_eq!(state.snapshot().progress, PROGRESS_UNKNOWN);
    }

    #[test]
    fn serial_is_fixed_once_seen() {
        let (state, _rx) = state();
        state.set_serial("abc".into());
        state.set_serial("def".into());
        assert_eq!(state.snapshot().serial.as_deref(), Some("abc"));
    }

    #[test]
    fn reset_clears_everything() {
        let (state, rx) = state();
        state.set_step(Step::Ready);
        state.set_connected(true);
        state.raise_error(ErrorCondition::Unknown);
        state.reset();
        assert_eq!(state.snapshot(), FlashSnapshot::default());
        let events: Vec<_> = rx.try_iter().map(|(e, _)| e).collect();
        assert!(events.contains(&FlashEvent::ErrorChanged(None)));
        assert!(events.contains(&FlashEvent::ConnectionChanged(false)));
    }

    #[test]
    fn callback_observer_dispatches_per_field() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer = CallbackObserver::new()
            .on_step_change(move |step| sink.lock().unwrap().push(step.to_string()));
        let state = SessionState::new(Arc::new(observer));
        state.set_step(Step::Ready);
        state.set_message("ignored");
        assert_eq!(*seen.lock().unwrap(), vec!["READY".to_string()]);
    }
}
