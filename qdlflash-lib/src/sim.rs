//! In-memory device speaking the flashing protocol.
//!
//! Used by the integration tests and by the host's `--simulate` mode. Faults
//! can be injected per opcode, and every request frame the device receives is
//! counted so a test can prove that traffic stopped.

use crate::partition::PartitionTable;
use crate::protocol::codec::{
    Command, DeviceIdentity, Frame, HelloInfo, Opcode, PROTOCOL_VERSION, Status,
};
use crate::transport::{
    Connection, ConnectionEvent, ConnectionWatch, Connector, Transport, TransportError,
};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub product: String,
    pub serial: String,
    pub sector_size: u32,
    pub capacity: u64,
    pub max_transfer: u32,
    pub protocol_version: u16,
    /// Table the device starts with; empty means none.
    pub initial_table: Vec<u8>,
    /// `open` reports no device this many times before succeeding.
    pub attach_after: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            product: "sdm845".into(),
            serial: "c0ffee42".into(),
            sector_size: 4096,
            capacity: 64 * 1024 * 1024 * 1024,
            max_transfer: 1024 * 1024,
            protocol_version: PROTOCOL_VERSION,
            initial_table: Vec::new(),
            attach_after: 0,
        }
    }
}

/// Misbehaviour triggered by the `nth` (1-based) request carrying `opcode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The device is unplugged as the request arrives.
    Disconnect { opcode: Opcode, nth: u64 },
    /// The request and the following `times - 1` ones with the same opcode
    /// are lost on the wire.
    Transient { opcode: Opcode, nth: u64, times: u64 },
    /// The device answers with `status` instead of executing the request.
    Nak { opcode: Opcode, nth: u64, status: Status },
}

#[derive(Debug, Default)]
struct Partition {
    data: Vec<u8>,
    erased: bool,
}

struct SimState {
    config: SimConfig,
    faults: Vec<Fault>,
    connected: bool,
    attach_countdown: u32,
    watchers: Vec<Sender<ConnectionEvent>>,
    table: Vec<u8>,
    partitions: HashMap<String, Partition>,
    programmer: Vec<u8>,
    programmer_loaded: bool,
    greeted: bool,
    seen: HashMap<Opcode, u64>,
    log: Vec<Opcode>,
    program_bytes: HashMap<String, u64>,
    outbox: VecDeque<u8>,
    unplug_when_drained: bool,
}

impl SimState {
    fn unplug(&mut self) {
        if !self.connected {
            return;
        }
        tracing::debug!("sim: device unplugged");
        self.connected = false;
        self.outbox.clear();
        for watcher in self.watchers.drain(..) {
            let _ = watcher.send(ConnectionEvent::Disconnected);
        }
    }

    fn table(&self) -> Option<PartitionTable> {
        PartitionTable::decode(&self.table).ok()
    }

    fn partition_size(&self, name: &str) -> Option<u64> {
        self.table()?.entry(name).map(|e| e.size)
    }

    fn respond(&mut self, opcode: Opcode, status: Status, seq: u16, payload: Vec<u8>) {
        let frame = Frame::response(opcode, status, seq, payload);
        self.outbox.extend(frame.encode());
    }

    /// Executes one request; returns the status and response payload.
    fn execute(&mut self, command: Command<'_>) -> (Status, Vec<u8>) {
        match command {
            Command::Hello {
                min_version,
                max_version,
            } => {
                let version = self.config.protocol_version;
                if version < min_version || version > max_version {
                    return (Status::Unsupported, Vec::new());
                }
                self.greeted = true;
                let info = HelloInfo {
                    version,
                    max_transfer: self.config.max_transfer,
                };
                (Status::Ok, info.encode())
            }
            Command::UploadProgrammer { offset, last, data } => {
                if !self.greeted {
                    return (Status::NotReady, Vec::new());
                }
                if offset as usize != self.programmer.len() {
                    return (Status::InvalidArgument, Vec::new());
                }
                self.programmer.extend_from_slice(data);
                self.programmer_loaded = last;
                (Status::Ok, Vec::new())
            }
            Command::Identify => {
                if !self.programmer_loaded {
                    return (Status::NotReady, Vec::new());
                }
                let identity = DeviceIdentity {
                    product: self.config.product.clone(),
                    serial: self.config.serial.clone(),
                    sector_size: self.config.sector_size,
                    capacity: self.config.capacity,
                };
                match identity.encode() {
                    Ok(payload) => (Status::Ok, payload),
                    Err(_) => (Status::Failed, Vec::new()),
                }
            }
            _ if !self.programmer_loaded => (Status::NotReady, Vec::new()),
            Command::ReadPartitionTable => (Status::Ok, self.table.clone()),
            Command::WritePartitionTable { table } => {
                let valid = PartitionTable::decode(table)
                    .and_then(|t| t.validate(Some(self.config.capacity)));
                if valid.is_err() {
                    return (Status::InvalidArgument, Vec::new());
                }
                self.table = table.to_vec();
                self.partitions.clear();
                (Status::Ok, Vec::new())
            }
            Command::Erase { partition } => {
                if self.partition_size(partition).is_none() {
                    return (Status::OutOfRange, Vec::new());
                }
                let entry = self.partitions.entry(partition.to_string()).or_default();
                entry.data.clear();
                entry.erased = true;
                (Status::Ok, Vec::new())
            }
            Command::Program {
                partition,
                offset,
                data,
                ..
            } => {
                let Some(size) = self.partition_size(partition) else {
                    return (Status::OutOfRange, Vec::new());
                };
                if offset + data.len() as u64 > size {
                    return (Status::OutOfRange, Vec::new());
                }
                let entry = self.partitions.entry(partition.to_string()).or_default();
                if !entry.erased {
                    return (Status::NotReady, Vec::new());
                }
                let end = offset as usize + data.len();
                if entry.data.len() < end {
                    entry.data.resize(end, 0);
                }
                entry.data[offset as usize..end].copy_from_slice(data);
                *self.program_bytes.entry(partition.to_string()).or_default() +=
                    data.len() as u64;
                (Status::Ok, Vec::new())
            }
            Command::Hash { partition, len } => {
                let Some(size) = self.partition_size(partition) else {
                    return (Status::OutOfRange, Vec::new());
                };
                if len > size {
                    return (Status::OutOfRange, Vec::new());
                }
                let data = self
                    .partitions
                    .get(partition)
                    .map(|p| p.data.as_slice())
                    .unwrap_or_default();
                let mut hasher = Sha256::new();
                let stored = (len as usize).min(data.len());
                hasher.update(&data[..stored]);
                hasher.update(vec![0u8; len as usize - stored]);
                (Status::Ok, hasher.finalize().to_vec())
            }
            Command::Reset => {
                self.unplug_when_drained = true;
                (Status::Ok, Vec::new())
            }
        }
    }

    /// Returns the fault to apply to this request, if any.
    fn fault_for(&self, opcode: Opcode, nth: u64) -> Option<Fault> {
        self.faults
            .iter()
            .find(|fault| match fault {
                Fault::Disconnect { opcode: o, nth: n } | Fault::Nak { opcode: o, nth: n, .. } => {
                    *o == opcode && *n == nth
                }
                Fault::Transient {
                    opcode: o,
                    nth: n,
                    times,
                } => *o == opcode && nth >= *n && nth < *n + *times,
            })
            .cloned()
    }

    fn receive(&mut self, frame: Frame) -> Result<(), TransportError> {
        let Ok(opcode) = Opcode::try_from(frame.opcode) else {
            self.respond(Opcode::Hello, Status::InvalidArgument, frame.seq, Vec::new());
            return Ok(());
        };
        let nth = {
            let seen = self.seen.entry(opcode).or_default();
            *seen += 1;
            *seen
        };
        self.log.push(opcode);

        match self.fault_for(opcode, nth) {
            Some(Fault::Disconnect { .. }) => {
                self.unplug();
                return Err(TransportError::Disconnected);
            }
            Some(Fault::Transient { .. }) => {
                tracing::debug!("sim: dropping {} #{}", opcode, nth);
                return Err(TransportError::Transfer("simulated CRC error".into()));
            }
            Some(Fault::Nak { status, .. }) => {
                self.respond(opcode, status, frame.seq, Vec::new());
                return Ok(());
            }
            None => {}
        }

        let (status, payload) = match Command::decode(opcode, &frame.payload) {
            Ok(command) => self.execute(command),
            Err(_) => (Status::InvalidArgument, Vec::new()),
        };
        self.respond(opcode, status, frame.seq, payload);
        Ok(())
    }
}

/// Shared handle to one simulated device.
#[derive(Clone)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
    received: Arc<AtomicU64>,
    open: Arc<AtomicUsize>,
}

impl SimDevice {
    pub fn new(config: SimConfig) -> Self {
        let state = SimState {
            table: config.initial_table.clone(),
            attach_countdown: config.attach_after,
            config,
            faults: Vec::new(),
            connected: true,
            watchers: Vec::new(),
            partitions: HashMap::new(),
            programmer: Vec::new(),
            programmer_loaded: false,
            greeted: false,
            seen: HashMap::new(),
            log: Vec::new(),
            program_bytes: HashMap::new(),
            outbox: VecDeque::new(),
            unplug_when_drained: false,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            received: Arc::new(AtomicU64::new(0)),
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_fault(self, fault: Fault) -> Self {
        self.lock().faults.push(fault);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connector(&self) -> SimConnector {
        SimConnector {
            device: self.clone(),
            host_ok: true,
        }
    }

    /// Request frames received so far, failed ones included.
    pub fn commands_received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    /// Transports opened and not yet closed or dropped.
    pub fn open_transports(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Opcodes in the order they arrived.
    pub fn command_log(&self) -> Vec<Opcode> {
        self.lock().log.clone()
    }

    pub fn count(&self, opcode: Opcode) -> u64 {
        self.lock().seen.get(&opcode).copied().unwrap_or(0)
    }

    pub fn partition_data(&self, name: &str) -> Option<Vec<u8>> {
        self.lock().partitions.get(name).map(|p| p.data.clone())
    }

    /// Total payload bytes accepted by PROGRAM for `name`.
    pub fn programmed_bytes(&self, name: &str) -> u64 {
        self.lock().program_bytes.get(name).copied().unwrap_or(0)
    }

    pub fn table_bytes(&self) -> Vec<u8> {
        self.lock().table.clone()
    }

    pub fn programmer(&self) -> Vec<u8> {
        self.lock().programmer.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Pulls the cable.
    pub fn unplug(&self) {
        self.lock().unplug();
    }
}

pub struct SimConnector {
    device: SimDevice,
    host_ok: bool,
}

impl SimConnector {
    /// A connector whose host reports no USB support.
    pub fn without_usb(mut self) -> Self {
        self.host_ok = false;
        self
    }
}

impl Connector for SimConnector {
    type Transport = SimTransport;

    fn check_requirements(&self) -> Result<(), TransportError> {
        if self.host_ok {
            Ok(())
        } else {
            Err(TransportError::Unsupported("simulated host without USB".into()))
        }
    }

    fn open(&mut self) -> Result<Connection<SimTransport>, TransportError> {
        self.check_requirements()?;
        let mut state = self.device.lock();
        if state.attach_countdown > 0 {
            state.attach_countdown -= 1;
            return Err(TransportError::NoDeviceFound);
        }
        if !state.connected {
            return Err(TransportError::NoDeviceFound);
        }
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(ConnectionEvent::Connected);
        state.watchers.push(tx);
        drop(state);
        self.device.open.fetch_add(1, Ordering::SeqCst);

        Ok(Connection {
            transport: SimTransport {
                device: self.device.clone(),
                rx: Vec::new(),
                closed: false,
            },
            watch: ConnectionWatch::new(rx),
        })
    }
}

pub struct SimTransport {
    device: SimDevice,
    rx: Vec<u8>,
    closed: bool,
}

impl Transport for SimTransport {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Disconnected);
        }
        let mut state = self.device.lock();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        self.rx.extend_from_slice(data);
        loop {
            let (frame, used) = match Frame::decode(&self.rx) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.rx.clear();
                    return Err(TransportError::Transfer(format!("sim: bad frame: {}", e)));
                }
            };
            self.rx.drain(..used);
            self.device.received.fetch_add(1, Ordering::SeqCst);
            state.receive(frame)?;
        }
    }

    fn read(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        if self.closed {
            return Err(TransportError::Disconnected);
        }
        let mut state = self.device.lock();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        if state.outbox.is_empty() {
            drop(state);
            std::thread::sleep(Duration::from_millis(1));
            return Err(TransportError::Timeout);
        }
        let n = max_len.min(state.outbox.len());
        let out: Vec<u8> = state.outbox.drain(..n).collect();
        if state.outbox.is_empty() && state.unplug_when_drained {
            state.unplug_when_drained = false;
            state.unplug();
        }
        Ok(out)
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        if self.closed || !self.device.is_connected() {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.device.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn describe(&self) -> String {
        format!("sim {}", self.device.lock().config.serial)
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EngineConfig, Interlock, ProtocolEngine};

    fn engine(device: &SimDevice) -> ProtocolEngine<SimTransport> {
        let connection = device.connector().open().unwrap();
        ProtocolEngine::new(connection.transport, EngineConfig::default(), Interlock::new())
    }

    #[test]
    fn identify_requires_programmer() {
        let device = SimDevice::new(SimConfig::default());
        let mut engine = engine(&device);
        engine.hello().unwrap();
        assert!(matches!(
            engine.identify(),
            Err(crate::Error::Device {
                status: Status::NotReady,
                ..
            })
        ));
        engine.upload_programmer(b"\x7fELF programmer").unwrap();
        assert_eq!(engine.identify().unwrap().serial, "c0ffee42");
        assert_eq!(device.programmer(), b"\x7fELF programmer");
    }

    #[test]
    fn reset_unplugs_after_acknowledging() {
        let device = SimDevice::new(SimConfig::default());
        let connection = device.connector().open().unwrap();
        let mut engine = ProtocolEngine::new(
            connection.transport,
            EngineConfig::default(),
            Interlock::new(),
        );
        engine.hello().unwrap();
        engine.upload_programmer(&[1]).unwrap();
        engine.reset().unwrap();
        assert!(!device.is_connected());
        assert_eq!(
            connection.watch.wait(Duration::from_millis(10)),
            Some(ConnectionEvent::Connected)
        );
        assert_eq!(
            connection.watch.wait(Duration::from_millis(10)),
            Some(ConnectionEvent::Disconnected)
        );
    }

    #[test]
    fn open_transports_are_counted_once() {
        let device = SimDevice::new(SimConfig::default());
        let mut first = device.connector().open().unwrap().transport;
        let second = device.connector().open().unwrap().transport;
        assert_eq!(device.open_transports(), 2);
        first.close();
        first.close();
        assert_eq!(device.open_transports(), 1);
        drop(first);
        drop(second);
        assert_eq!(device.open_transports(), 0);
    }

    #[test]
    fn attaches_after_countdown() {
        let device = SimDevice::new(SimConfig {
            attach_after: 2,
            ..SimConfig::default()
        });
        let mut connector = device.connector();
        assert!(matches!(connector.open(), Err(TransportError::NoDeviceFound)));
        assert!(matches!(connector.open(), Err(TransportError::NoDeviceFound)));
        assert!(connector.open().is_ok());
    }
}
