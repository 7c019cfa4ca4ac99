//! The flashing session state machine.
//!
//! [`FlashManager`] owns the observable session state. [`FlashManager::start`]
//! moves the device work onto a dedicated thread and returns a
//! [`SessionHandle`]; the caller keeps receiving events through its observer
//! and can abort at any time.

use crate::events::{
    ErrorCondition, FlashObserverArc, FlashSnapshot, PROGRESS_UNKNOWN, SessionState, Step,
};
use crate::image::{ImageManager, PreparedImage};
use crate::manifest::{ImageDescriptor, Manifest};
use crate::partition::{PartitionTable, TableState};
use crate::protocol::{DeviceIdentity, EngineConfig, Interlock, ProtocolEngine};
use crate::transport::{
    Connection, ConnectionEvent, ConnectionWatch, Connector, Transport, TransportError,
};
use crate::utils::Utils;
use crate::{Error, Result};
use phf::phf_map;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Product signatures reported by IDENTIFY that this host knows how to flash.
pub static SUPPORTED_PRODUCTS: phf::Map<&'static str, &'static str> = phf_map! {
    "sdm845" => "Snapdragon 845",
    "sdm670" => "Snapdragon 670",
    "sm8150" => "Snapdragon 855",
};

pub fn product_name(signature: &str) -> Option<&'static str> {
    SUPPORTED_PRODUCTS.get(signature).copied()
}

const WATCH_POLL: Duration = Duration::from_millis(100);

/// What FINALIZING checks before resetting the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum VerifyMode {
    /// Trust the pre-write checksum only.
    None,
    /// Compare the device-side HASH of every raw image.
    #[default]
    Hash,
}

#[derive(Debug, Clone)]
pub struct FlashConfig {
    pub engine: EngineConfig,
    /// Give up waiting for the device after this long; wait forever if unset.
    pub connect_timeout: Option<Duration>,
    /// Delay between attempts to open the device.
    pub poll_interval: Duration,
    /// How long a failed transfer waits for a pending disconnect
    /// notification before being reported as a failure of its own.
    pub disconnect_grace: Duration,
    pub supported_products: Vec<String>,
    pub verify: VerifyMode,
    /// Known-good partition layout; derived from the manifest if unset.
    pub partition_layout: Option<PartitionTable>,
}

impl Default for FlashConfig {
    fn default() -> Self {
        let mut supported_products: Vec<String> =
            SUPPORTED_PRODUCTS.keys().map(|k| k.to_string()).collect();
        supported_products.sort();
        Self {
            engine: EngineConfig::default(),
            connect_timeout: None,
            poll_interval: Duration::from_millis(500),
            disconnect_grace: Duration::from_millis(500),
            supported_products,
            verify: VerifyMode::default(),
            partition_layout: None,
        }
    }
}

/// Picks the condition reported for `err` raised while in `step`.
fn condition_for(step: Step, err: &Error) -> ErrorCondition {
    let stage_failure = || match step {
        Step::RepairPartitionTables => ErrorCondition::RepairPartitionTablesFailed,
        Step::EraseDevice => ErrorCondition::EraseFailed,
        Step::FlashSystem | Step::Finalizing => ErrorCondition::FlashSystemFailed,
        Step::Connecting => ErrorCondition::UnrecognizedDevice,
        Step::Initializing | Step::Ready | Step::Done => ErrorCondition::Unknown,
    };

    match err {
        Error::Transport(transport) => match transport {
            TransportError::Disconnected => ErrorCondition::LostConnection,
            // usually a kernel driver still holding the interface
            TransportError::PermissionDenied(_) => ErrorCondition::LostConnection,
            TransportError::Unsupported(_) => ErrorCondition::RequirementsNotMet,
            TransportError::NoDeviceFound => ErrorCondition::LostConnection,
            TransportError::Timeout | TransportError::Transfer(_) => match step {
                Step::Connecting => ErrorCondition::LostConnection,
                _ => stage_failure(),
            },
        },
        Error::Timeout(_) => match step {
            Step::Connecting => ErrorCondition::LostConnection,
            _ => stage_failure(),
        },
        Error::UnrecognizedDevice(_) => ErrorCondition::UnrecognizedDevice,
        Error::StorageSpace(_) => ErrorCondition::StorageSpace,
        Error::Protocol(_) | Error::Device { .. } | Error::CrcMismatch { .. } => stage_failure(),
        Error::PartitionTable(_) => stage_failure(),
        // images are fetched before the device is touched, while still CONNECTING
        Error::ChecksumMismatch { .. } | Error::SizeMismatch { .. } | Error::Download { .. } => {
            ErrorCondition::FlashSystemFailed
        }
        Error::Io(_) | Error::Manifest(_) | Error::InvalidInput(_) => match step {
            Step::Connecting => ErrorCondition::FlashSystemFailed,
            _ => stage_failure(),
        },
        Error::InvalidState(_) | Error::Aborted => ErrorCondition::Unknown,
    }
}

pub struct FlashManager {
    manifest: Arc<Manifest>,
    programmer: Arc<Vec<u8>>,
    config: FlashConfig,
    state: Arc<SessionState>,
    images: Option<Arc<ImageManager>>,
    active: Arc<AtomicBool>,
}

impl FlashManager {
    pub fn new(manifest: Manifest, programmer: Vec<u8>, observer: FlashObserverArc) -> Self {
        Self {
            manifest: Arc::new(manifest),
            programmer: Arc::new(programmer),
            config: FlashConfig::default(),
            state: Arc::new(SessionState::new(observer)),
            images: None,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_config(mut self, config: FlashConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Consistent view of step, error, message, progress and connection.
    pub fn snapshot(&self) -> FlashSnapshot {
        self.state.snapshot()
    }

    fn fail(&self, err: Error) -> Error {
        let step = self.state.snapshot().step;
        let condition = condition_for(step, &err);
        tracing::error!("{} failed: {}", step, err);
        self.state.raise_error(condition);
        err
    }

    /// Validates inputs and the host, then moves to READY.
    ///
    /// On failure the matching condition is raised and the manager stays in
    /// INITIALIZING until [`reset`](Self::reset).
    pub fn initialize<C: Connector>(
        &mut self,
        images: Arc<ImageManager>,
        connector: &C,
    ) -> Result<()> {
        let snapshot = self.state.snapshot();
        if snapshot.step != Step::Initializing || snapshot.error.is_some() {
            return Err(Error::InvalidState(format!(
                "initialize called in {}",
                snapshot.step
            )));
        }

        self.state.set_message("Checking requirements");
        if let Err(e) = connector.check_requirements() {
            return Err(self.fail(e.into()));
        }

        self.state.set_message("Loading programmer and manifest");
        if self.programmer.is_empty() {
            return Err(self.fail(Error::invalid_input("programmer binary is empty")));
        }
        self.manifest.validate().map_err(|e| self.fail(e))?;
        images
            .check_storage(&self.manifest)
            .map_err(|e| self.fail(e))?;

        tracing::info!(
            "{} images, {} total",
            self.manifest.images.len(),
            Utils::format_bytes(self.manifest.total_size())
        );
        self.images = Some(images);
        self.state.set_message("");
        self.state.set_step(Step::Ready);
        Ok(())
    }

    /// Swaps the version to flash. Only allowed in READY.
    pub fn set_manifest(&mut self, manifest: Manifest) -> Result<()> {
        let snapshot = self.state.snapshot();
        if !snapshot.can_start() {
            return Err(Error::InvalidState(format!(
                "version can only change in READY, not {}",
                snapshot.step
            )));
        }
        manifest.validate()?;
        if let Some(images) = &self.images {
            images.check_storage(&manifest).map_err(|e| self.fail(e))?;
        }
        self.manifest = Arc::new(manifest);
        Ok(())
    }

    /// Starts a session against the device `connector` finds.
    ///
    /// Only effective in READY without an error; anything else is refused
    /// with [`Error::InvalidState`] and leaves the state untouched.
    pub fn start<C>(&self, connector: C) -> Result<SessionHandle>
    where
        C: Connector + 'static,
    {
        let snapshot = self.state.snapshot();
        if !snapshot.can_start() {
            return Err(Error::InvalidState(format!(
                "cannot start in {}{}",
                snapshot.step,
                snapshot
                    .error
                    .map(|e| format!(" with {}", e))
                    .unwrap_or_default()
            )));
        }
        let images = self
            .images
            .clone()
            .ok_or_else(|| Error::InvalidState("not initialized".into()))?;
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidState("a session is already running".into()));
        }

        self.state.set_step(Step::Connecting);
        self.state.set_message("Preparing images");

        let interlock = Interlock::new();
        let session = Session {
            connector,
            manifest: Arc::clone(&self.manifest),
            programmer: Arc::clone(&self.programmer),
            config: self.config.clone(),
            images,
            state: Arc::clone(&self.state),
            interlock: interlock.clone(),
            watch_stop: Arc::new(AtomicBool::new(false)),
        };
        let active = Arc::clone(&self.active);
        let thread = std::thread::Builder::new()
            .name("flash-session".into())
            .spawn(move || {
                let result = session.run();
                active.store(false, Ordering::SeqCst);
                result
            });
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(self.fail(Error::Io(e)));
            }
        };
        Ok(SessionHandle {
            interlock,
            thread: Some(thread),
        })
    }

    /// Returns to INITIALIZING with a clean slate. The caller has to
    /// [`initialize`](Self::initialize) again before the next session.
    pub fn reset(&mut self) -> Result<()> {
        if self.active.load(Ordering::SeqCst) {
            return Err(Error::InvalidState(
                "cannot reset while a session is running".into(),
            ));
        }
        tracing::info!("resetting flash manager");
        self.images = None;
        self.state.reset();
        Ok(())
    }
}

/// Control over a running session.
pub struct SessionHandle {
    interlock: Interlock,
    thread: Option<JoinHandle<Result<()>>>,
}

impl SessionHandle {
    /// Stops the session before its next device command and releases the
    /// transport.
    pub fn abort(&self) {
        tracing::warn!("abort requested");
        self.interlock.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Blocks until the session ends and returns its outcome.
    pub fn wait(mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .unwrap_or_else(|_| Err(Error::InvalidState("session thread panicked".into()))),
            None => Ok(()),
        }
    }
}

struct Session<C: Connector> {
    connector: C,
    manifest: Arc<Manifest>,
    programmer: Arc<Vec<u8>>,
    config: FlashConfig,
    images: Arc<ImageManager>,
    state: Arc<SessionState>,
    interlock: Interlock,
    watch_stop: Arc<AtomicBool>,
}

/// Raises LOST_CONNECTION the moment the device goes away, independent of
/// whatever command the session is running.
fn spawn_watcher(
    watch: ConnectionWatch,
    state: Arc<SessionState>,
    interlock: Interlock,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let thread = std::thread::Builder::new()
        .name("flash-watch".into())
        .spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                match watch.wait(WATCH_POLL) {
                    Some(ConnectionEvent::Disconnected) => {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                        interlock.mark_disconnected();
                        state.set_connected(false);
                        if state.snapshot().step != Step::Done {
                            state.raise_error(ErrorCondition::LostConnection);
                        }
                        break;
                    }
                    Some(ConnectionEvent::Connected) if !stop.load(Ordering::SeqCst) => {
                        state.set_connected(true)
                    }
                    Some(ConnectionEvent::Connected) => {}
                    None => {}
                }
            }
        })?;
    Ok(thread)
}

impl<C: Connector> Session<C> {
    fn run(mut self) -> Result<()> {
        let result = self.drive();
        self.watch_stop.store(true, Ordering::SeqCst);
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                let err = self.settle(err);
                let step = self.state.snapshot().step;
                let condition = condition_for(step, &err);
                if self.state.raise_error(condition) {
                    tracing::error!("session stopped in {}: {}", step, err);
                }
                if matches!(err, Error::Aborted) {
                    self.state.set_message("Aborted");
                }
                Err(err)
            }
        }
    }

    /// Lets a pending disconnect notification win over the transfer failure
    /// it caused.
    fn settle(&self, err: Error) -> Error {
        if !matches!(err, Error::Transport(_) | Error::Timeout(_)) || err.is_disconnect() {
            return err;
        }
        let deadline = Instant::now() + self.config.disconnect_grace;
        while Instant::now() < deadline {
            if self.interlock.is_disconnected() {
                tracing::debug!("{} was caused by a disconnect", err);
                return TransportError::Disconnected.into();
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        err
    }

    fn drive(&mut self) -> Result<()> {
        let prepared = self.prepare_images()?;

        self.state.set_message("Waiting for connection");
        let Connection { transport, watch } = self.connect()?;
        tracing::info!("connected to {}", transport.describe());
        self.state.set_connected(true);

        let watcher = spawn_watcher(
            watch,
            Arc::clone(&self.state),
            self.interlock.clone(),
            Arc::clone(&self.watch_stop),
        )?;
        let mut engine =
            ProtocolEngine::new(transport, self.config.engine.clone(), self.interlock.clone());

        let result = self.flash(&mut engine, &prepared);

        // closing may end the transport's own watcher, which reads as a disconnect
        self.watch_stop.store(true, Ordering::SeqCst);
        engine.close();
        if watcher.join().is_err() {
            tracing::error!("connection watcher panicked");
        }
        if result.is_err() && !self.interlock.is_disconnected() {
            self.state.set_connected(false);
        }
        result
    }

    /// Polls the connector until the device shows up.
    fn connect(&mut self) -> Result<Connection<C::Transport>> {
        let started = Instant::now();
        loop {
            self.interlock.check()?;
            match self.connector.open() {
                Ok(connection) => return Ok(connection),
                Err(TransportError::NoDeviceFound) => {}
                Err(e) => return Err(e.into()),
            }
            if let Some(limit) = self.config.connect_timeout
                && started.elapsed() >= limit
            {
                return Err(Error::timeout("waiting for the device"));
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    fn flash<T: Transport>(
        &mut self,
        engine: &mut ProtocolEngine<T>,
        prepared: &[PreparedImage],
    ) -> Result<()> {
        let identity = self.handshake(engine)?;

        self.advance(Step::RepairPartitionTables)?;
        let table = self.repair_partition_tables(engine, &identity)?;

        self.advance(Step::EraseDevice)?;
        self.erase(engine)?;

        self.advance(Step::FlashSystem)?;
        self.flash_system(engine, &table, prepared)?;

        self.advance(Step::Finalizing)?;
        self.finalize(engine)?;

        self.advance(Step::Done)?;
        self.state.set_message("Done");
        Ok(())
    }

    fn advance(&self, step: Step) -> Result<()> {
        self.interlock.check()?;
        if !self.state.set_step(step) {
            return Err(Error::InvalidState(format!("could not enter {}", step)));
        }
        Ok(())
    }

    fn handshake<T: Transport>(&mut self, engine: &mut ProtocolEngine<T>) -> Result<DeviceIdentity> {
        self.state.set_message("Connecting to device");
        engine.hello()?;
        self.state.set_message("Loading programmer");
        engine.upload_programmer(&self.programmer)?;

        let identity = engine.identify()?;
        self.state.set_serial(identity.serial.clone());
        if !self
            .config
            .supported_products
            .iter()
            .any(|p| *p == identity.product)
        {
            return Err(Error::UnrecognizedDevice(identity.product));
        }
        tracing::info!(
            "flashing {} ({})",
            identity.product,
            product_name(&identity.product).unwrap_or("custom product")
        );
        Ok(identity)
    }

    fn layout(&self) -> Result<PartitionTable> {
        let Some(layout) = &self.config.partition_layout else {
            return PartitionTable::for_manifest(&self.manifest);
        };
        for image in &self.manifest.images {
            if layout.entry(&image.name).is_none() {
                return Err(Error::partition_table(format!(
                    "layout has no partition for `{}`",
                    image.name
                )));
            }
        }
        Ok(layout.clone())
    }

    fn repair_partition_tables<T: Transport>(
        &self,
        engine: &mut ProtocolEngine<T>,
        identity: &DeviceIdentity,
    ) -> Result<PartitionTable> {
        let layout = self.layout()?;
        layout.validate(Some(identity.capacity))?;

        self.state.set_message("Reading partition table");
        let current = TableState::from_bytes(&engine.read_partition_table()?, Some(identity.capacity));
        match &current {
            TableState::Absent => tracing::warn!("device has no partition table"),
            TableState::Corrupt(reason) => tracing::warn!("partition table is corrupt: {}", reason),
            TableState::Valid(_) => {}
        }
        if !current.needs_repair(&layout) {
            tracing::info!("partition table is intact");
            if let TableState::Valid(table) = current {
                return Ok(table);
            }
        }

        self.state.set_message("Writing partition table");
        let encoded = layout.encode();
        engine.write_partition_table(&encoded)?;

        self.state.set_message("Verifying partition table");
        let readback = engine.read_partition_table()?;
        if readback != encoded {
            return Err(Error::partition_table("read-back differs from written table"));
        }
        tracing::info!("partition table repaired ({} partitions)", layout.entries.len());
        Ok(layout)
    }

    fn erase<T: Transport>(&self, engine: &mut ProtocolEngine<T>) -> Result<()> {
        let count = self.manifest.images.len();
        for (index, image) in self.manifest.images.iter().enumerate() {
            self.state.set_message(format!("Erasing {}", image.name));
            engine.erase(&image.name)?;
            self.state.set_progress((index + 1) as f64 / count as f64);
        }
        Ok(())
    }

    fn flash_system<T: Transport>(
        &self,
        engine: &mut ProtocolEngine<T>,
        table: &PartitionTable,
        prepared: &[PreparedImage],
    ) -> Result<()> {
        let total = self.manifest.total_size();
        let mut done = 0u64;

        for prepared in prepared {
            let image = &prepared.descriptor;
            let needed = self.images.expanded_len(prepared)?;
            let partition = table.entry(&image.name).ok_or_else(|| {
                Error::partition_table(format!("no partition for `{}`", image.name))
            })?;
            if needed > partition.size {
                return Err(Error::partition_table(format!(
                    "`{}` needs {} but its partition holds {}",
                    image.name,
                    Utils::format_bytes(needed),
                    Utils::format_bytes(partition.size)
                )));
            }

            self.state.set_message(format!("Flashing {}", image.name));
            self.program_image(engine, prepared, done, total)?;
            done += image.size;
            if total > 0 {
                self.state.set_progress(done as f64 / total as f64);
            }
        }
        self.state.set_progress(1.0);
        Ok(())
    }

    /// Downloads and verifies every image so a bad one fails the session
    /// before anything on the device is changed.
    fn prepare_images(&self) -> Result<Vec<PreparedImage>> {
        let mut prepared = Vec::with_capacity(self.manifest.images.len());
        for image in &self.manifest.images {
            self.interlock.check()?;
            prepared.push(self.prepare(image)?);
        }
        Ok(prepared)
    }

    fn prepare(&self, image: &ImageDescriptor) -> Result<PreparedImage> {
        if self.images.is_cached(image)? {
            return self.images.prepare(image, &mut |_| {});
        }
        self.state.set_message(format!(
            "Downloading {} ({})",
            image.name,
            Utils::format_bytes(image.size)
        ));
        let mut last_logged = 0u64;
        self.images.prepare(image, &mut |staged| {
            if staged - last_logged >= 64 * 1024 * 1024 {
                tracing::debug!("{}: {} staged", image.name, Utils::format_bytes(staged));
                last_logged = staged;
            }
        })
    }

    fn program_image<T: Transport>(
        &self,
        engine: &mut ProtocolEngine<T>,
        prepared: &PreparedImage,
        done: u64,
        total: u64,
    ) -> Result<()> {
        let name = &prepared.descriptor.name;
        let mut consumed = 0u64;
        for chunk in self.images.chunks(prepared, engine.max_transfer())? {
            let chunk = chunk?;
            let span = chunk.consumed.saturating_sub(consumed);
            let len = chunk.data.len() as u64;
            let state = &self.state;
            engine.program(name, chunk.offset, &chunk.data, chunk.last, &mut |sent| {
                if total > 0 {
                    let within = consumed + span * sent / len.max(1);
                    state.set_progress((done + within) as f64 / total as f64);
                }
            })?;
            consumed = chunk.consumed;
        }
        tracing::info!("{} written", name);
        Ok(())
    }

    fn finalize<T: Transport>(&self, engine: &mut ProtocolEngine<T>) -> Result<()> {
        if self.config.verify == VerifyMode::Hash {
            for image in &self.manifest.images {
                if image.sparse || image.size == 0 {
                    continue;
                }
                self.state.set_message(format!("Verifying {}", image.name));
                let actual = hex::encode(engine.hash(&image.name, image.size)?);
                if actual != image.checksum {
                    return Err(Error::ChecksumMismatch {
                        name: image.name.clone(),
                        expected: image.checksum.clone(),
                        actual,
                    });
                }
                tracing::debug!("{} verified on device", image.name);
            }
        }

        self.state.set_message("Restarting device");
        // the device drops off the bus after RESET
        self.watch_stop.store(true, Ordering::SeqCst);
        engine.reset()?;
        self.state.set_connected(false);
        self.state.set_progress(PROGRESS_UNKNOWN);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Opcode, Status};
    use strum::IntoEnumIterator;

    #[test]
    fn stage_failures_follow_the_step() {
        let nak = Error::Device {
            command: Opcode::Erase,
            status: Status::Failed,
        };
        let expected = [
            (Step::Connecting, ErrorCondition::UnrecognizedDevice),
            (Step::RepairPartitionTables, ErrorCondition::RepairPartitionTablesFailed),
            (Step::EraseDevice, ErrorCondition::EraseFailed),
            (Step::FlashSystem, ErrorCondition::FlashSystemFailed),
            (Step::Finalizing, ErrorCondition::FlashSystemFailed),
        ];
        for (step, condition) in expected {
            assert_eq!(condition_for(step, &nak), condition);
        }
    }

    #[test]
    fn disconnect_is_lost_connection_everywhere() {
        let err = Error::Transport(TransportError::Disconnected);
        for step in Step::iter() {
            assert_eq!(condition_for(step, &err), ErrorCondition::LostConnection);
        }
    }

    #[test]
    fn distinct_conditions_survive_any_step() {
        for step in Step::iter() {
            assert_eq!(
                condition_for(step, &Error::StorageSpace("full".into())),
                ErrorCondition::StorageSpace
            );
            assert_eq!(
                condition_for(step, &Error::UnrecognizedDevice("x".into())),
                ErrorCondition::UnrecognizedDevice
            );
            assert_eq!(condition_for(step, &Error::Aborted), ErrorCondition::Unknown);
        }
        assert_eq!(
            condition_for(
                Step::Initializing,
                &Error::Transport(TransportError::Unsupported("no usb".into()))
            ),
            ErrorCondition::RequirementsNotMet
        );
    }

    #[test]
    fn image_failures_before_connecting_are_flash_failures() {
        let mismatch = Error::ChecksumMismatch {
            name: "system".into(),
            expected: "00".into(),
            actual: "11".into(),
        };
        let missing = Error::download("https://images.test/system.img", "404");
        for err in [mismatch, missing] {
            assert_eq!(
                condition_for(Step::Connecting, &err),
                ErrorCondition::FlashSystemFailed
            );
        }
        let io = Error::Io(std::io::Error::other("read failed"));
        assert_eq!(
            condition_for(Step::Connecting, &io),
            ErrorCondition::FlashSystemFailed
        );
        assert_eq!(condition_for(Step::EraseDevice, &io), ErrorCondition::EraseFailed);
    }

    #[test]
    fn default_products_come_from_the_static_map() {
        let config = FlashConfig::default();
        assert_eq!(config.supported_products.len(), SUPPORTED_PRODUCTS.len());
        assert!(config.supported_products.iter().all(|p| product_name(p).is_some()));
        assert_eq!(product_name("msm8916"), None);
    }
}
