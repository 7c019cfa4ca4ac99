//! USB bulk transport built on `nusb`.

use super::{Connection, ConnectionEvent, ConnectionWatch, Connector, Transport, TransportError};
use futures_lite::{Stream, StreamExt};
use nusb::hotplug::HotplugEvent;
use nusb::transfer::{Direction, EndpointType, RequestBuffer, TransferError};
use nusb::{Device, DeviceInfo, Interface};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

/// Qualcomm emergency download mode.
pub const EDL_VID: u16 = 0x05C6;
pub const EDL_PID: u16 = 0x9008;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// How often the hotplug thread checks whether the transport was closed.
const HOTPLUG_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct UsbConfig {
    pub vid: u16,
    pub pid: u16,
    pub interface: u8,
    /// Per-transfer timeout.
    pub timeout: Duration,
    /// Only match this serial number when several devices are attached.
    pub serial: Option<String>,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            vid: EDL_VID,
            pid: EDL_PID,
            interface: 0,
            timeout: DEFAULT_TIMEOUT,
            serial: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UsbConnector {
    config: UsbConfig,
}

impl UsbConnector {
    pub fn new(config: UsbConfig) -> Self {
        Self { config }
    }

    fn matches(&self, info: &DeviceInfo) -> bool {
        if info.vendor_id() != self.config.vid || info.product_id() != self.config.pid {
            return false;
        }
        match (&self.config.serial, info.serial_number()) {
            (Some(wanted), Some(serial)) => wanted == serial,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

impl Default for UsbConnector {
    fn default() -> Self {
        Self::new(UsbConfig::default())
    }
}

fn open_error(err: std::io::Error) -> TransportError {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => TransportError::PermissionDenied(err.to_string()),
        std::io::ErrorKind::NotFound => TransportError::NoDeviceFound,
        std::io::ErrorKind::ResourceBusy => TransportError::PermissionDenied(format!(
            "{} (is another driver bound to the device?)",
            err
        )),
        _ => TransportError::Transfer(err.to_string()),
    }
}

fn transfer_error(err: TransferError) -> TransportError {
    match err {
        TransferError::Disconnected => TransportError::Disconnected,
        TransferError::Cancelled => TransportError::Timeout,
        other => TransportError::Transfer(other.to_string()),
    }
}

/// Bulk IN/OUT endpoint addresses and packet size of `interface`.
fn find_bulk_endpoints(device: &Device, interface: u8) -> Result<(u8, u8, usize), TransportError> {
    let config = device
        .active_configuration()
        .map_err(|e| TransportError::Transfer(e.to_string()))?;

    let mut in_ep = None;
    let mut out_ep = None;
    let mut packet_size = 512;
    for alt in config.interface_alt_settings() {
        if alt.interface_number() != interface {
            continue;
        }
        for ep in alt.endpoints() {
            if ep.transfer_type() != EndpointType::Bulk {
                continue;
            }
            match ep.direction() {
                Direction::In if in_ep.is_none() => {
                    in_ep = Some(ep.address());
                    packet_size = ep.max_packet_size().max(1);
                }
                Direction::Out if out_ep.is_none() => out_ep = Some(ep.address()),
                _ => {}
            }
        }
        break;
    }

    match (in_ep, out_ep) {
        (Some(in_ep), Some(out_ep)) => Ok((in_ep, out_ep, packet_size)),
        _ => Err(TransportError::Transfer(format!(
            "interface {} has no bulk endpoint pair",
            interface
        ))),
    }
}

/// Forwards `events` on a background thread until one of them matches
/// `is_removal`, the stream ends, or `closed` is set.
///
/// A match sends [`ConnectionEvent::Disconnected`]. `closed` is checked at
/// least every [`HOTPLUG_POLL`], so the thread ends soon after the transport
/// is closed even when the bus is quiet.
fn spawn_removal_watch<S, F>(
    events: S,
    is_removal: F,
    closed: Arc<AtomicBool>,
    tx: Sender<ConnectionEvent>,
) -> Result<JoinHandle<()>, TransportError>
where
    S: Stream + Send + 'static,
    F: Fn(&S::Item) -> bool + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| TransportError::Unsupported(e.to_string()))?;

    std::thread::Builder::new()
        .name("usb-hotplug".into())
        .spawn(move || {
            runtime.block_on(async move {
                let mut events = Box::pin(events);
                while !closed.load(Ordering::SeqCst) {
                    match tokio::time::timeout(HOTPLUG_POLL, events.next()).await {
                        Ok(Some(event)) if is_removal(&event) => {
                            if !closed.load(Ordering::SeqCst) {
                                let _ = tx.send(ConnectionEvent::Disconnected);
                            }
                            break;
                        }
                        Ok(Some(_)) | Err(_) => {}
                        Ok(None) => break,
                    }
                }
            })
        })
        .map_err(|e| TransportError::Unsupported(e.to_string()))
}

/// Reports on the returned watch when the device behind `info` goes away.
fn spawn_watcher(
    info: &DeviceInfo,
    closed: Arc<AtomicBool>,
) -> Result<(ConnectionWatch, JoinHandle<()>), TransportError> {
    let events = nusb::watch_devices().map_err(|e| TransportError::Unsupported(e.to_string()))?;
    let (tx, rx) = mpsc::channel();
    let _ = tx.send(ConnectionEvent::Connected);

    let id = info.id();
    let thread = spawn_removal_watch(
        events,
        move |event| match event {
            HotplugEvent::Disconnected(gone) if *gone == id => {
                tracing::warn!("device {:?} unplugged", id);
                true
            }
            _ => false,
        },
        closed,
        tx,
    )?;
    Ok((ConnectionWatch::new(rx), thread))
}

impl Connector for UsbConnector {
    type Transport = UsbTransport;

    fn check_requirements(&self) -> Result<(), TransportError> {
        nusb::list_devices()
            .map(|_| ())
            .map_err(|e| TransportError::Unsupported(e.to_string()))
    }

    fn open(&mut self) -> Result<Connection<UsbTransport>, TransportError> {
        let info = nusb::list_devices()
            .map_err(|e| TransportError::Unsupported(e.to_string()))?
            .find(|info| self.matches(info))
            .ok_or(TransportError::NoDeviceFound)?;

        tracing::info!(
            "found {:04x}:{:04x} on bus {} addr {}",
            info.vendor_id(),
            info.product_id(),
            info.bus_number(),
            info.device_address()
        );

        // watch before claiming so an unplug during setup is not missed
        let closed = Arc::new(AtomicBool::new(false));
        let (watch, watcher) = spawn_watcher(&info, Arc::clone(&closed))?;

        let device = info.open().map_err(open_error)?;
        let interface = device
            .detach_and_claim_interface(self.config.interface)
            .map_err(open_error)?;
        let (in_ep, out_ep, packet_size) = find_bulk_endpoints(&device, self.config.interface)?;
        tracing::debug!(
            "claimed interface {} (in {:#04x}, out {:#04x}, packet {})",
            self.config.interface,
            in_ep,
            out_ep,
            packet_size
        );

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| TransportError::Unsupported(e.to_string()))?;

        let transport = UsbTransport {
            description: format!("usb {}:{}", info.bus_number(), info.device_address()),
            device,
            interface: Some(interface),
            in_ep,
            out_ep,
            packet_size,
            timeout: self.config.timeout,
            runtime,
            closed,
            watcher: Some(watcher),
        };
        Ok(Connection { transport, watch })
    }
}

pub struct UsbTransport {
    description: String,
    device: Device,
    interface: Option<Interface>,
    in_ep: u8,
    out_ep: u8,
    packet_size: usize,
    timeout: Duration,
    runtime: tokio::runtime::Runtime,
    closed: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
}

impl UsbTransport {
    fn interface(&self) -> Result<&Interface, TransportError> {
        self.interface.as_ref().ok_or(TransportError::Disconnected)
    }
}

impl Transport for UsbTransport {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let interface = self.interface()?;
        let transfer = interface.bulk_out(self.out_ep, data.to_vec());
        let completion = self
            .runtime
            .block_on(tokio::time::timeout(self.timeout, transfer))
            .map_err(|_| TransportError::Timeout)?;
        let sent = completion.into_result().map_err(transfer_error)?;
        if sent.actual_length() != data.len() {
            return Err(TransportError::Transfer(format!(
                "short write: {} of {} bytes",
                sent.actual_length(),
                data.len()
            )));
        }

        // terminate transfers that end on a packet boundary
        if !data.is_empty() && data.len() % self.packet_size == 0 {
            let zlp = interface.bulk_out(self.out_ep, Vec::new());
            let completion = self
                .runtime
                .block_on(tokio::time::timeout(self.timeout, zlp))
                .map_err(|_| TransportError::Timeout)?;
            completion.into_result().map_err(transfer_error)?;
        }
        tracing::trace!("usb write {} bytes", data.len());
        Ok(())
    }

    fn read(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let interface = self.interface()?;
        // IN requests must be a multiple of the packet size
        let len = max_len.div_ceil(self.packet_size).max(1) * self.packet_size;
        let transfer = interface.bulk_in(self.in_ep, RequestBuffer::new(len));
        let completion = self
            .runtime
            .block_on(tokio::time::timeout(self.timeout, transfer))
            .map_err(|_| TransportError::Timeout)?;
        let data = completion.into_result().map_err(transfer_error)?;
        tracing::trace!("usb read {} bytes", data.len());
        Ok(data)
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.interface()?;
        self.device.reset().map_err(open_error)?;
        // the device re-enumerates after a reset
        self.close();
        Ok(())
    }

    fn close(&mut self) {
        if self.interface.take().is_some() {
            tracing::debug!("released {}", self.description);
        }
        self.closed.store(true, Ordering::SeqCst);
        if let Some(watcher) = self.watcher.take()
            && watcher.join().is_err()
        {
            tracing::error!("hotplug watcher panicked");
        }
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.close();
    }
}
