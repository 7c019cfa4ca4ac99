//! Frame layout and command encoding of the device-side flashing protocol.
//!
//! Every exchange is one request frame answered by one response frame:
//!
//! ```text
//! 0      2       3       4     6          8        12          12+n
//! | "QF" | opcode | status | seq | reserved | length | payload | crc32 |
//! ```
//!
//! Integers are little-endian. A response carries the request opcode with
//! [`RESPONSE_BIT`] set and echoes its sequence number. The CRC covers header
//! and payload.

use crate::utils::Utils;
use crate::{Error, Result};
use strum::{Display, EnumIter};

pub const MAGIC: [u8; 2] = *b"QF";
pub const HEADER_LEN: usize = 12;
pub const TRAILER_LEN: usize = 4;
pub const RESPONSE_BIT: u8 = 0x80;
/// Largest payload accepted in either direction.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024 + 64;
/// Protocol revision spoken by this host.
pub const PROTOCOL_VERSION: u16 = 1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    Hello = 0x01,
    UploadProgrammer = 0x02,
    Identify = 0x03,
    ReadPartitionTable = 0x04,
    WritePartitionTable = 0x05,
    Erase = 0x06,
    Program = 0x07,
    Hash = 0x08,
    Reset = 0x09,
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0x01 => Opcode::Hello,
            0x02 => Opcode::UploadProgrammer,
            0x03 => Opcode::Identify,
            0x04 => Opcode::ReadPartitionTable,
            0x05 => Opcode::WritePartitionTable,
            0x06 => Opcode::Erase,
            0x07 => Opcode::Program,
            0x08 => Opcode::Hash,
            0x09 => Opcode::Reset,
            other => return Err(Error::protocol(format!("unknown opcode {:#04x}", other))),
        })
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok = 0,
    Failed = 1,
    InvalidArgument = 2,
    NotReady = 3,
    OutOfRange = 4,
    Unsupported = 5,
}

impl TryFrom<u8> for Status {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Status::Ok,
            1 => Status::Failed,
            2 => Status::InvalidArgument,
            3 => Status::NotReady,
            4 => Status::OutOfRange,
            5 => Status::Unsupported,
            other => return Err(Error::protocol(format!("unknown status {:#04x}", other))),
        })
    }
}

/// One raw frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub status: u8,
    pub seq: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn request(opcode: Opcode, seq: u16, payload: Vec<u8>) -> Self {
        Self {
            opcode: opcode as u8,
            status: 0,
            seq,
            payload,
        }
    }

    pub fn response(opcode: Opcode, status: Status, seq: u16, payload: Vec<u8>) -> Self {
        Self {
            opcode: opcode as u8 | RESPONSE_BIT,
            status: status as u8,
            seq,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len() + TRAILER_LEN);
        out.extend_from_slice(&MAGIC);
        out.push(self.opcode);
        out.push(self.status);
        out.extend_from_slice(&self.seq.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        let crc = Utils::crc32(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Decodes the frame at the start of `buf`.
    ///
    /// Returns `Ok(None)` while more bytes are needed, otherwise the frame and
    /// the number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
        if buf.len() < MAGIC.len() {
            return Ok(None);
        }
        if buf[..2] != MAGIC {
            return Err(Error::protocol(format!(
                "bad frame magic {:02x}{:02x}",
                buf[0], buf[1]
            )));
        }
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(Error::protocol(format!("frame payload too large: {}", len)));
        }
        let total = HEADER_LEN + len + TRAILER_LEN;
        if buf.len() < total {
            return Ok(None);
        }

        let body = &buf[..HEADER_LEN + len];
        let expected = u32::from_le_bytes([
            buf[total - 4],
            buf[total - 3],
            buf[total - 2],
            buf[total - 1],
        ]);
        let actual = Utils::crc32(body);
        if expected != actual {
            return Err(Error::CrcMismatch { expected, actual });
        }

        let frame = Frame {
            opcode: buf[2],
            status: buf[3],
            seq: u16::from_le_bytes([buf[4], buf[5]]),
            payload: buf[HEADER_LEN..HEADER_LEN + len].to_vec(),
        };
        Ok(Some((frame, total)))
    }
}

/// Host-to-device requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Hello {
        min_version: u16,
        max_version: u16,
    },
    UploadProgrammer {
        offset: u32,
        last: bool,
        data: &'a [u8],
    },
    Identify,
    ReadPartitionTable,
    WritePartitionTable {
        table: &'a [u8],
    },
    Erase {
        partition: &'a str,
    },
    Program {
        partition: &'a str,
        offset: u64,
        last: bool,
        data: &'a [u8],
    },
    Hash {
        partition: &'a str,
        len: u64,
    },
    Reset,
}

impl<'a> Command<'a> {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Hello { .. } => Opcode::Hello,
            Command::UploadProgrammer { .. } => Opcode::UploadProgrammer,
            Command::Identify => Opcode::Identify,
            Command::ReadPartitionTable => Opcode::ReadPartitionTable,
            Command::WritePartitionTable { .. } => Opcode::WritePartitionTable,
            Command::Erase { .. } => Opcode::Erase,
            Command::Program { .. } => Opcode::Program,
            Command::Hash { .. } => Opcode::Hash,
            Command::Reset => Opcode::Reset,
        }
    }

    /// Fails when a string does not fit its 16-bit length prefix.
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let mut w = Writer::default();
        match self {
            Command::Hello {
                min_version,
                max_version,
            } => {
                w.u16(*min_version);
                w.u16(*max_version);
            }
            Command::UploadProgrammer { offset, last, data } => {
                w.u32(*offset);
                w.u8(*last as u8);
                w.bytes(data);
            }
            Command::Identify | Command::ReadPartitionTable | Command::Reset => {}
            Command::WritePartitionTable { table } => w.bytes(table),
            Command::Erase { partition } => w.str(partition)?,
            Command::Program {
                partition,
                offset,
                last,
                data,
            } => {
                w.str(partition)?;
                w.u64(*offset);
                w.u8(*last as u8);
                w.bytes(data);
            }
            Command::Hash { partition, len } => {
                w.str(partition)?;
                w.u64(*len);
            }
        }
        Ok(w.0)
    }

    /// Parses a request payload; used by device-side implementations.
    pub fn decode(opcode: Opcode, payload: &'a [u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let command = match opcode {
            Opcode::Hello => Command::Hello {
                min_version: r.u16()?,
                max_version: r.u16()?,
            },
            Opcode::UploadProgrammer => Command::UploadProgrammer {
                offset: r.u32()?,
                last: r.u8()? != 0,
                data: r.rest(),
            },
            Opcode::Identify => Command::Identify,
            Opcode::ReadPartitionTable => Command::ReadPartitionTable,
            Opcode::WritePartitionTable => Command::WritePartitionTable { table: r.rest() },
            Opcode::Erase => Command::Erase {
                partition: r.str()?,
            },
            Opcode::Program => Command::Program {
                partition: r.str()?,
                offset: r.u64()?,
                last: r.u8()? != 0,
                data: r.rest(),
            },
            Opcode::Hash => Command::Hash {
                partition: r.str()?,
                len: r.u64()?,
            },
            Opcode::Reset => Command::Reset,
        };
        r.finish()?;
        Ok(command)
    }
}

/// HELLO response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloInfo {
    pub version: u16,
    /// Largest data block the device accepts in one PROGRAM.
    pub max_transfer: u32,
}

impl HelloInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u16(self.version);
        w.u32(self.max_transfer);
        w.0
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let info = Self {
            version: r.u16()?,
            max_transfer: r.u32()?,
        };
        r.finish()?;
        Ok(info)
    }
}

/// IDENTIFY response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Product signature, checked against the supported set.
    pub product: String,
    pub serial: String,
    pub sector_size: u32,
    /// Storage capacity in bytes.
    pub capacity: u64,
}

impl DeviceIdentity {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::default();
        w.str(&self.product)?;
        w.str(&self.serial)?;
        w.u32(self.sector_size);
        w.u64(self.capacity);
        Ok(w.0)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let identity = Self {
            product: r.str()?.to_string(),
            serial: r.str()?.to_string(),
            sector_size: r.u32()?,
            capacity: r.u64()?,
        };
        r.finish()?;
        Ok(identity)
    }
}

/// HASH response: SHA-256 of the requested partition prefix.
pub fn decode_hash(payload: &[u8]) -> Result<[u8; 32]> {
    payload
        .try_into()
        .map_err(|_| Error::protocol(format!("hash response is {} bytes", payload.len())))
}

#[derive(Default)]
pub(crate) struct Writer(pub(crate) Vec<u8>);

impl Writer {
    pub(crate) fn u8(&mut self, v: u8) {
        self.0.push(v);
    }

    pub(crate) fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn str(&mut self, v: &str) -> Result<()> {
        let len = u16::try_from(v.len())
            .map_err(|_| Error::protocol(format!("string of {} bytes is too long", v.len())))?;
        self.u16(len);
        self.0.extend_from_slice(v.as_bytes());
        Ok(())
    }

    pub(crate) fn bytes(&mut self, v: &[u8]) {
        self.0.extend_from_slice(v);
    }
}

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                Error::protocol(format!(
                    "truncated payload: need {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub(crate) fn str(&mut self) -> Result<&'a str> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw).map_err(|e| Error::protocol(format!("invalid string: {}", e)))
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub(crate) fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(Error::protocol(format!(
                "{} trailing bytes in payload",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}
