use super::codec::{
    Command, DeviceIdentity, Frame, HelloInfo, MAX_PAYLOAD, Opcode, PROTOCOL_VERSION, RESPONSE_BIT,
    Status, decode_hash,
};
use crate::transport::{Transport, TransportError};
use crate::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default PROGRAM block size.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
/// Resends of an idempotent command after a transient failure.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
const READ_SIZE: usize = 16 * 1024;
/// Abandoned sequence numbers remembered at most.
const MAX_STALE: usize = 8;

/// Stops protocol traffic once the session is cancelled or the device is gone.
///
/// Checked before every command, so setting either flag guarantees nothing
/// more is sent.
#[derive(Debug, Clone, Default)]
pub struct Interlock {
    cancelled: Arc<AtomicBool>,
    disconnected: Arc<AtomicBool>,
}

impl Interlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// A disconnect takes precedence over a cancel.
    pub fn check(&self) -> Result<()> {
        if self.is_disconnected() {
            return Err(TransportError::Disconnected.into());
        }
        if self.is_cancelled() {
            return Err(Error::Aborted);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound for a PROGRAM block; the device may lower it in HELLO.
    pub chunk_size: usize,
    pub max_retries: u32,
    /// How long to wait for most responses.
    pub response_timeout: Duration,
    /// How long to wait for ERASE and partition table writes.
    pub erase_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            response_timeout: Duration::from_secs(10),
            erase_timeout: Duration::from_secs(120),
        }
    }
}

/// Drives request/response exchanges with the device over one transport.
pub struct ProtocolEngine<T: Transport> {
    transport: T,
    config: EngineConfig,
    interlock: Interlock,
    seq: u16,
    /// Sequence numbers of requests abandoned after a transient failure;
    /// late answers to them are dropped instead of treated as out-of-order.
    /// Cleared once a newer request is answered.
    stale: Vec<u16>,
    rx: Vec<u8>,
    max_transfer: usize,
    commands: Arc<AtomicU64>,
}

fn is_transient(err: &Error) -> bool {
    match err {
        Error::Transport(e) => e.is_transient(),
        Error::Timeout(_) => true,
        _ => false,
    }
}

impl<T: Transport> ProtocolEngine<T> {
    pub fn new(transport: T, config: EngineConfig, interlock: Interlock) -> Self {
        let max_transfer = config.chunk_size.max(1);
        Self {
            transport,
            config,
            interlock,
            seq: 0,
            stale: Vec::new(),
            rx: Vec::new(),
            max_transfer,
            commands: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Effective PROGRAM block size.
    pub fn max_transfer(&self) -> usize {
        self.max_transfer
    }

    /// Number of request frames written so far, retries included.
    pub fn commands_sent(&self) -> u64 {
        self.commands.load(Ordering::SeqCst)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Releases the transport.
    pub fn close(&mut self) {
        self.transport.close();
    }

    fn abandon(&mut self, seq: u16) {
        if self.stale.len() == MAX_STALE {
            self.stale.remove(0);
        }
        self.stale.push(seq);
    }

    fn next_seq(&mut self) -> u16 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn timeout_for(&self, opcode: Opcode) -> Duration {
        match opcode {
            Opcode::Erase | Opcode::WritePartitionTable | Opcode::Hash => {
                self.config.erase_timeout
            }
            _ => self.config.response_timeout,
        }
    }

    /// Sends one command and returns the OK response payload.
    fn exchange(&mut self, command: &Command<'_>) -> Result<Vec<u8>> {
        self.interlock.check()?;

        let opcode = command.opcode();
        let payload = command.encode_payload()?;
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::protocol(format!(
                "{} payload of {} bytes exceeds the frame limit",
                opcode,
                payload.len()
            )));
        }
        let seq = self.next_seq();
        let frame = Frame::request(opcode, seq, payload);
        tracing::debug!("-> {} seq={} len={}", opcode, seq, frame.payload.len());

        self.commands.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.transport.write(&frame.encode()) {
            if e.is_transient() {
                self.abandon(seq);
            }
            return Err(e.into());
        }

        let response = match self.read_response(opcode, seq) {
            Ok(response) => response,
            Err(e) => {
                if is_transient(&e) {
                    self.abandon(seq);
                    self.rx.clear();
                }
                return Err(e);
            }
        };

        let status = Status::try_from(response.status)?;
        tracing::debug!("<- {} seq={} status={}", opcode, seq, status);
        if status != Status::Ok {
            return Err(Error::Device {
                command: opcode,
                status,
            });
        }
        Ok(response.payload)
    }

    /// Like [`exchange`](Self::exchange), resending the command unchanged
    /// after a transient failure up to `max_retries` times. Only for
    /// commands the device can safely apply twice.
    fn exchange_retrying(&mut self, command: &Command<'_>) -> Result<Vec<u8>> {
        let mut attempt = 0;
        loop {
            match self.exchange(command) {
                Err(e) if is_transient(&e) && attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "{} failed ({}), retry {}/{}",
                        command.opcode(),
                        e,
                        attempt,
                        self.config.max_retries
                    );
                }
                result => return result,
            }
        }
    }

    fn read_response(&mut self, opcode: Opcode, seq: u16) -> Result<Frame> {
        let deadline = Instant::now() + self.timeout_for(opcode);
        loop {
            while let Some((frame, used)) = Frame::decode(&self.rx)? {
                self.rx.drain(..used);
                if self.stale.contains(&frame.seq) {
                    tracing::debug!("dropping late response seq={}", frame.seq);
                    self.stale.retain(|s| *s != frame.seq);
                    continue;
                }
                if frame.opcode != (opcode as u8 | RESPONSE_BIT) || frame.seq != seq {
                    return Err(Error::protocol(format!(
                        "out-of-order response: expected {} seq={}, got opcode {:#04x} seq={}",
                        opcode, seq, frame.opcode, frame.seq
                    )));
                }
                // answers arrive in order, so nothing older can still be in flight
                self.stale.clear();
                return Ok(frame);
            }

            if self.interlock.is_disconnected() {
                return Err(TransportError::Disconnected.into());
            }
            match self.transport.read(READ_SIZE) {
                Ok(data) => self.rx.extend_from_slice(&data),
                Err(TransportError::Timeout) if Instant::now() < deadline => continue,
                Err(TransportError::Timeout) => {
                    return Err(Error::timeout(format!("waiting for {} response", opcode)));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Negotiates the protocol version and learns the device transfer limit.
    pub fn hello(&mut self) -> Result<HelloInfo> {
        let payload = self.exchange(&Command::Hello {
            min_version: PROTOCOL_VERSION,
            max_version: PROTOCOL_VERSION,
        })?;
        let info = HelloInfo::decode(&payload)?;
        if info.version != PROTOCOL_VERSION {
            return Err(Error::protocol(format!(
                "device negotiated unsupported protocol version {}",
                info.version
            )));
        }
        if info.max_transfer == 0 {
            return Err(Error::protocol("device reported a zero transfer size"));
        }
        self.max_transfer = self.config.chunk_size.min(info.max_transfer as usize).max(1);
        tracing::info!(
            "protocol v{} negotiated, block size {} bytes",
            info.version,
            self.max_transfer
        );
        Ok(info)
    }

    /// Pushes the programmer into device RAM; the device starts it after the
    /// last block.
    pub fn upload_programmer(&mut self, programmer: &[u8]) -> Result<()> {
        if programmer.is_empty() {
            return Err(Error::invalid_input("programmer binary is empty"));
        }
        let total = programmer.len();
        if u32::try_from(total).is_err() {
            return Err(Error::protocol(format!(
                "programmer of {} bytes does not fit a 32-bit offset",
                total
            )));
        }
        let mut offset = 0usize;
        for block in programmer.chunks(self.max_transfer) {
            let start = u32::try_from(offset)
                .map_err(|_| Error::protocol(format!("programmer offset {} overflows", offset)))?;
            offset += block.len();
            self.exchange(&Command::UploadProgrammer {
                offset: start,
                last: offset == total,
                data: block,
            })?;
        }
        tracing::info!("programmer uploaded ({} bytes)", total);
        Ok(())
    }

    pub fn identify(&mut self) -> Result<DeviceIdentity> {
        let payload = self.exchange(&Command::Identify)?;
        let identity = DeviceIdentity::decode(&payload)?;
        tracing::info!(
            "device {} serial {} capacity {} bytes",
            identity.product,
            identity.serial,
            identity.capacity
        );
        Ok(identity)
    }

    /// Raw partition table bytes; empty when the device has none.
    pub fn read_partition_table(&mut self) -> Result<Vec<u8>> {
        self.exchange_retrying(&Command::ReadPartitionTable)
    }

    pub fn write_partition_table(&mut self, table: &[u8]) -> Result<()> {
        self.exchange(&Command::WritePartitionTable { table })?;
        Ok(())
    }

    pub fn erase(&mut self, partition: &str) -> Result<()> {
        self.exchange_retrying(&Command::Erase { partition })?;
        Ok(())
    }

    /// Writes `data` at `offset` of `partition`, split into transfer-sized
    /// blocks.
    ///
    /// `progress` receives the cumulative number of bytes sent by this call
    /// after every block. A block failing transiently is resent unchanged up
    /// to `max_retries` times; a disconnect is returned at once.
    pub fn program(
        &mut self,
        partition: &str,
        offset: u64,
        data: &[u8],
        last: bool,
        progress: &mut dyn FnMut(u64),
    ) -> Result<()> {
        if data.is_empty() {
            return Err(Error::invalid_input("empty PROGRAM block"));
        }
        let mut sent = 0u64;
        let blocks = data.len().div_ceil(self.max_transfer);
        for (index, block) in data.chunks(self.max_transfer).enumerate() {
            let block_last = last && index + 1 == blocks;
            self.exchange_retrying(&Command::Program {
                partition,
                offset: offset + sent,
                last: block_last,
                data: block,
            })?;
            sent += block.len() as u64;
            progress(sent);
        }
        Ok(())
    }

    /// SHA-256 of the first `len` bytes of `partition`, computed by the device.
    pub fn hash(&mut self, partition: &str, len: u64) -> Result<[u8; 32]> {
        let payload = self.exchange_retrying(&Command::Hash { partition, len })?;
        decode_hash(&payload)
    }

    /// Reboots the device and releases the transport.
    pub fn reset(&mut self) -> Result<()> {
        self.exchange(&Command::Reset)?;
        if let Err(e) = self.transport.reset() {
            // the device may already be gone after acknowledging
            tracing::debug!("transport reset after RESET: {}", e);
        }
        self.transport.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ChunkPlan;
    use crate::protocol::codec::{Frame, HEADER_LEN, TRAILER_LEN};
    use std::collections::VecDeque;

    /// Transport replaying canned replies.
    #[derive(Default)]
    struct Scripted {
        written: Vec<Frame>,
        replies: VecDeque<std::result::Result<Vec<u8>, TransportError>>,
    }

    impl Transport for Scripted {
        fn write(&mut self, data: &[u8]) -> std::result::Result<(), TransportError> {
            let (frame, _) = Frame::decode(data).unwrap().unwrap();
            self.written.push(frame);
            Ok(())
        }

        fn read(&mut self, _max_len: usize) -> std::result::Result<Vec<u8>, TransportError> {
            self.replies.pop_front().unwrap_or(Err(TransportError::Timeout))
        }

        fn reset(&mut self) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        fn close(&mut self) {}

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    fn engine(replies: Vec<std::result::Result<Vec<u8>, TransportError>>) -> ProtocolEngine<Scripted> {
        let transport = Scripted {
            written: Vec::new(),
            replies: replies.into(),
        };
        let config = EngineConfig {
            response_timeout: Duration::from_millis(50),
            erase_timeout: Duration::from_millis(50),
            ..EngineConfig::default()
        };
        ProtocolEngine::new(transport, config, Interlock::new())
    }

    fn ok(opcode: Opcode, seq: u16, payload: Vec<u8>) -> std::result::Result<Vec<u8>, TransportError> {
        Ok(Frame::response(opcode, Status::Ok, seq, payload).encode())
    }

    #[test]
    fn hello_limits_block_size() {
        let info = HelloInfo {
            version: PROTOCOL_VERSION,
            max_transfer: 4096,
        };
        let mut engine = engine(vec![ok(Opcode::Hello, 1, info.encode())]);
        assert_eq!(engine.hello().unwrap(), info);
        assert_eq!(engine.max_transfer(), 4096);
    }

    #[test]
    fn response_split_across_reads() {
        let bytes = Frame::response(Opcode::Erase, Status::Ok, 1, Vec::new()).encode();
        let (a, b) = bytes.split_at(5);
        let mut engine = engine(vec![Ok(a.to_vec()), Ok(b.to_vec())]);
        engine.erase("boot").unwrap();
    }

    #[test]
    fn rejects_out_of_order_response() {
        let mut wrong_seq = engine(vec![ok(Opcode::Erase, 9, Vec::new())]);
        assert!(matches!(wrong_seq.erase("boot"), Err(Error::Protocol(_))));

        let mut wrong_opcode = engine(vec![ok(Opcode::Identify, 1, Vec::new())]);
        assert!(matches!(wrong_opcode.erase("boot"), Err(Error::Protocol(_))));
    }

    #[test]
    fn nak_is_a_device_error() {
        let nak = Frame::response(Opcode::Erase, Status::OutOfRange, 1, Vec::new()).encode();
        let mut engine = engine(vec![Ok(nak)]);
        match engine.erase("boot") {
            Err(Error::Device { command, status }) => {
                assert_eq!(command, Opcode::Erase);
                assert_eq!(status, Status::OutOfRange);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn program_retries_transient_failures() {
        let stall: std::result::Result<Vec<u8>, TransportError> =
            Err(TransportError::Transfer("stall".into()));
        let mut engine = engine(vec![
            stall.clone(),
            stall,
            ok(Opcode::Program, 3, Vec::new()),
        ]);
        let mut seen = Vec::new();
        engine
            .program("boot", 0, &[1, 2, 3], true, &mut |n| seen.push(n))
            .unwrap();
        assert_eq!(engine.commands_sent(), 3);
        assert_eq!(seen, vec![3]);
        let offsets: Vec<_> = engine
            .transport()
            .written
            .iter()
            .map(|f| Command::decode(Opcode::Program, &f.payload).unwrap())
            .map(|c| match c {
                Command::Program { offset, data, .. } => (offset, data.len()),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(offsets, vec![(0, 3), (0, 3), (0, 3)]);
    }

    #[test]
    fn program_gives_up_after_bound() {
        let stall = || Err(TransportError::Transfer("stall".into()));
        let mut engine = engine(vec![stall(), stall(), stall(), stall(), stall()]);
        let err = engine
            .program("boot", 0, &[1], true, &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Transfer(_))));
        assert_eq!(engine.commands_sent(), 1 + DEFAULT_MAX_RETRIES as u64);
    }

    #[test]
    fn erase_retries_then_gives_up() {
        let stall = || Err(TransportError::Transfer("stall".into()));
        let mut recovered = engine(vec![stall(), ok(Opcode::Erase, 2, Vec::new())]);
        recovered.erase("system").unwrap();
        assert_eq!(recovered.commands_sent(), 2);

        let mut exhausted = engine((0..4).map(|_| stall()).collect());
        assert!(matches!(
            exhausted.erase("system"),
            Err(Error::Transport(TransportError::Transfer(_)))
        ));
        assert_eq!(exhausted.commands_sent(), 1 + DEFAULT_MAX_RETRIES as u64);
    }

    #[test]
    fn device_rejection_is_not_retried() {
        let nak = Frame::response(Opcode::Erase, Status::Failed, 1, Vec::new()).encode();
        let mut engine = engine(vec![Ok(nak)]);
        assert!(matches!(engine.erase("boot"), Err(Error::Device { .. })));
        assert_eq!(engine.commands_sent(), 1);
    }

    #[test]
    fn program_does_not_retry_disconnect() {
        let mut engine = engine(vec![Err(TransportError::Disconnected)]);
        let err = engine
            .program("boot", 0, &[1], true, &mut |_| {})
            .unwrap_err();
        assert!(err.is_disconnect());
        assert_eq!(engine.commands_sent(), 1);
    }

    #[test]
    fn late_response_to_retried_block_is_dropped() {
        let late = Frame::response(Opcode::Program, Status::Ok, 1, Vec::new()).encode();
        let current = Frame::response(Opcode::Program, Status::Ok, 2, Vec::new()).encode();
        let mut both = late;
        both.extend_from_slice(&current);
        let mut engine = engine(vec![Err(TransportError::Transfer("crc".into())), Ok(both)]);
        engine.program("boot", 0, &[7], true, &mut |_| {}).unwrap();
    }

    #[test]
    fn interlock_blocks_further_commands() {
        let mut engine = engine(vec![]);
        engine.interlock.mark_disconnected();
        assert!(engine.erase("boot").unwrap_err().is_disconnect());
        assert_eq!(engine.commands_sent(), 0);

        let interlock = Interlock::new();
        interlock.cancel();
        assert!(matches!(interlock.check(), Err(Error::Aborted)));
    }

    #[test]
    fn response_timeout_is_reported() {
        let mut engine = engine(vec![]);
        assert!(matches!(engine.identify(), Err(Error::Timeout(_))));
    }

    #[test]
    fn answered_request_forgets_abandoned_sequence_numbers() {
        let stall = || Err(TransportError::Transfer("stall".into()));
        let mut engine = engine(vec![
            stall(),
            ok(Opcode::Program, 2, Vec::new()),
            ok(Opcode::Erase, 1, Vec::new()),
        ]);
        engine.program("boot", 0, &[1], true, &mut |_| {}).unwrap();
        assert!(engine.stale.is_empty());

        // after the counter wraps, seq 1 belongs to a live request again
        engine.seq = 0;
        engine.erase("boot").unwrap();
    }

    #[test]
    fn abandoned_sequence_numbers_are_bounded() {
        let stall = || Err(TransportError::Transfer("stall".into()));
        let mut engine = engine((0..40).map(|_| stall()).collect());
        for _ in 0..10 {
            assert!(engine.program("boot", 0, &[1], true, &mut |_| {}).is_err());
        }
        assert_eq!(engine.commands_sent(), 40);
        assert_eq!(engine.stale.len(), MAX_STALE);
        assert!(engine.stale.contains(&40));
    }

    /// Acknowledges every request and records the PROGRAM layout without
    /// keeping the data.
    #[derive(Default)]
    struct Acknowledger {
        replies: VecDeque<u8>,
        blocks: Vec<(u64, usize, bool)>,
        max_transfer: u32,
    }

    impl Transport for Acknowledger {
        fn write(&mut self, data: &[u8]) -> std::result::Result<(), TransportError> {
            let opcode = Opcode::try_from(data[2]).unwrap();
            let seq = u16::from_le_bytes([data[4], data[5]]);
            let payload = &data[HEADER_LEN..data.len() - TRAILER_LEN];
            let reply = match Command::decode(opcode, payload).unwrap() {
                Command::Hello { .. } => HelloInfo {
                    version: PROTOCOL_VERSION,
                    max_transfer: self.max_transfer,
                }
                .encode(),
                Command::Program {
                    offset, last, data, ..
                } => {
                    self.blocks.push((offset, data.len(), last));
                    Vec::new()
                }
                _ => Vec::new(),
            };
            self.replies
                .extend(Frame::response(opcode, Status::Ok, seq, reply).encode());
            Ok(())
        }

        fn read(&mut self, _max_len: usize) -> std::result::Result<Vec<u8>, TransportError> {
            if self.replies.is_empty() {
                return Err(TransportError::Timeout);
            }
            Ok(self.replies.drain(..).collect())
        }

        fn reset(&mut self) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        fn close(&mut self) {}

        fn describe(&self) -> String {
            "acknowledger".into()
        }
    }

    /// Feeds a raw image through the engine the way a session does and
    /// returns the PROGRAM layout.
    fn program_image(
        size: u64,
        image_chunk: usize,
        device_limit: u32,
    ) -> (usize, Vec<(u64, usize, bool)>) {
        let transport = Acknowledger {
            max_transfer: device_limit,
            ..Acknowledger::default()
        };
        let mut engine = ProtocolEngine::new(transport, EngineConfig::default(), Interlock::new());
        engine.hello().unwrap();

        let plan = ChunkPlan::new(size, image_chunk.min(engine.max_transfer()));
        let block = vec![0x5Au8; plan.chunk_size];
        let mut sent = 0u64;
        for (offset, len) in plan.ranges() {
            let last = offset + len as u64 == size;
            engine
                .program("userdata", offset, &block[..len], last, &mut |_| {})
                .unwrap();
            sent += len as u64;
        }
        assert_eq!(sent, size);
        (plan.chunk_size, engine.transport.blocks)
    }

    fn assert_gapless(blocks: &[(u64, usize, bool)], size: u64) {
        let mut next = 0u64;
        for (offset, len, _) in blocks {
            assert_eq!(*offset, next);
            next += *len as u64;
        }
        assert_eq!(next, size);
        assert!(blocks.last().unwrap().2);
        assert_eq!(blocks.iter().filter(|b| b.2).count(), 1);
    }

    #[test]
    fn program_count_follows_the_smaller_block_limit() {
        let size = 10_000_003u64;

        let (block, blocks) = program_image(size, 1024 * 1024, 300_000);
        assert_eq!(block, 300_000);
        assert_eq!(blocks.len() as u64, size.div_ceil(300_000));
        assert_gapless(&blocks, size);

        let (block, blocks) = program_image(size, 250_000, 1024 * 1024);
        assert_eq!(block, 250_000);
        assert_eq!(blocks.len() as u64, size.div_ceil(250_000));
        assert_gapless(&blocks, size);
    }

    #[test]
    fn four_gigabyte_image_is_programmed_without_gaps() {
        let size = 4 * 1024 * 1024 * 1024 + 1234u64;
        let (block, blocks) = program_image(size, 1024 * 1024, 786_432);
        assert_eq!(block, 786_432);
        assert_eq!(blocks.len() as u64, size.div_ceil(786_432));
        assert_gapless(&blocks, size);
        assert!(blocks.last().unwrap().0 > u32::MAX as u64);
    }
}
