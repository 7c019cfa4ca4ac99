//! Raw device access.
//!
//! A [`Connector`] finds and opens the device; the [`Transport`] it returns
//! moves bytes. Disconnects are reported twice on purpose: as
//! [`TransportError::Disconnected`] from the call that hit them, and on the
//! [`ConnectionWatch`] channel even when no call is pending.

pub mod usb;

use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no matching device found")]
    NoDeviceFound,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device disconnected")]
    Disconnected,

    #[error("transfer timed out")]
    Timeout,

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("unsupported host: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Failures worth retrying with the same request.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::Transfer(_))
    }
}

/// Byte pipe to an opened device. All calls may block.
pub trait Transport: Send {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Reads at most `max_len` bytes; returns whatever one transfer delivered.
    fn read(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    fn reset(&mut self) -> Result<(), TransportError>;

    /// Releases the device. Further calls fail with `Disconnected`.
    fn close(&mut self);

    /// Short description for logs, e.g. bus/address.
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

/// Asynchronous connection notifications for one opened device.
pub struct ConnectionWatch {
    events: Receiver<ConnectionEvent>,
}

impl ConnectionWatch {
    pub fn new(events: Receiver<ConnectionEvent>) -> Self {
        Self { events }
    }

    /// Non-blocking poll. A dropped sender counts as a disconnect.
    pub fn poll(&self) -> Option<ConnectionEvent> {
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(ConnectionEvent::Disconnected),
        }
    }

    /// Blocks up to `timeout` for the next event.
    pub fn wait(&self, timeout: Duration) -> Option<ConnectionEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(ConnectionEvent::Disconnected),
        }
    }
}

/// An opened device plus its disconnect watcher.
pub struct Connection<T> {
    pub transport: T,
    pub watch: ConnectionWatch,
}

/// Finds and opens the target device.
pub trait Connector: Send {
    type Transport: Transport + 'static;

    /// Fails with `Unsupported` when the host cannot talk USB at all.
    fn check_requirements(&self) -> Result<(), TransportError>;

    /// Opens the device if it is present right now; `NoDeviceFound` otherwise.
    fn open(&mut self) -> Result<Connection<Self::Transport>, TransportError>;
}
