//! On-device partition table.
//!
//! ```text
//! "QPT1" | count: u32 | count * { name_len: u8, name, offset: u64, size: u64 } | crc32
//! ```
//!
//! The CRC covers everything before it. An empty read means the device has
//! no table at all.

use crate::manifest::{MAX_NAME_LEN, Manifest};
use crate::protocol::codec::{Reader, Writer};
use crate::utils::Utils;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

pub const TABLE_MAGIC: [u8; 4] = *b"QPT1";
/// Partitions start and end on this boundary.
pub const PARTITION_ALIGN: u64 = 1024 * 1024;
/// Space reserved at the start of storage for the table itself.
pub const TABLE_RESERVED: u64 = PARTITION_ALIGN;
const MAX_ENTRIES: u32 = 128;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub name: String,
    pub offset: u64,
    pub size: u64,
}

impl PartitionEntry {
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionTable {
    pub entries: Vec<PartitionEntry>,
}

/// What READ_PARTITION_TABLE returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableState {
    Absent,
    Corrupt(String),
    Valid(PartitionTable),
}

impl PartitionTable {
    /// Lays out one aligned partition per manifest image, in manifest order.
    ///
    /// Fails when the layout would not fit a 64-bit byte range.
    pub fn for_manifest(manifest: &Manifest) -> Result<Self> {
        let mut offset = TABLE_RESERVED;
        let mut entries = Vec::with_capacity(manifest.images.len());
        for image in &manifest.images {
            let size = image
                .required_partition_size()
                .checked_next_multiple_of(PARTITION_ALIGN)
                .map(|size| size.max(PARTITION_ALIGN))
                .filter(|size| offset.checked_add(*size).is_some())
                .ok_or_else(|| {
                    Error::partition_table(format!(
                        "partition for `{}` overflows the address space",
                        image.name
                    ))
                })?;
            entries.push(PartitionEntry {
                name: image.name.clone(),
                offset,
                size,
            });
            offset += size;
        }
        Ok(Self { entries })
    }

    pub fn entry(&self, name: &str) -> Option<&PartitionEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Bytes from the start of storage to the end of the last partition.
    pub fn span(&self) -> u64 {
        self.entries.iter().map(PartitionEntry::end).max().unwrap_or(0)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.bytes(&TABLE_MAGIC);
        w.u32(self.entries.len() as u32);
        for entry in &self.entries {
            w.u8(entry.name.len() as u8);
            w.bytes(entry.name.as_bytes());
            w.u64(entry.offset);
            w.u64(entry.size);
        }
        let crc = Utils::crc32(&w.0);
        w.u32(crc);
        w.0
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < TABLE_MAGIC.len() + 8 {
            return Err(Error::partition_table(format!(
                "table is only {} bytes",
                data.len()
            )));
        }
        if data[..4] != TABLE_MAGIC {
            return Err(Error::partition_table("bad magic"));
        }
        let (body, crc) = data.split_at(data.len() - 4);
        let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        let actual = Utils::crc32(body);
        if expected != actual {
            return Err(Error::CrcMismatch { expected, actual });
        }

        let mut r = Reader::new(&body[4..]);
        let count = r.u32()?;
        if count > MAX_ENTRIES {
            return Err(Error::partition_table(format!("{} entries", count)));
        }
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name_len = r.u8()? as usize;
            let mut name = String::with_capacity(name_len);
            for _ in 0..name_len {
                name.push(r.u8()? as char);
            }
            entries.push(PartitionEntry {
                name,
                offset: r.u64()?,
                size: r.u64()?,
            });
        }
        r.finish()?;
        Ok(Self { entries })
    }

    /// Names must be unique and short enough to store; partitions must not
    /// overlap or run past `capacity`.
    pub fn validate(&self, capacity: Option<u64>) -> Result<()> {
        let mut sorted: Vec<&PartitionEntry> = self.entries.iter().collect();
        sorted.sort_by_key(|entry| entry.offset);

        for entry in &self.entries {
            if entry.name.is_empty() || entry.name.len() > MAX_NAME_LEN || !entry.name.is_ascii() {
                return Err(Error::partition_table(format!(
                    "invalid partition name `{}`",
                    entry.name
                )));
            }
            if entry.size == 0 {
                return Err(Error::partition_table(format!(
                    "partition `{}` is empty",
                    entry.name
                )));
            }
            if self.entries.iter().filter(|e| e.name == entry.name).count() > 1 {
                return Err(Error::partition_table(format!(
                    "partition `{}` is listed twice",
                    entry.name
                )));
            }
        }
        for pair in sorted.windows(2) {
            if pair[0].end() > pair[1].offset {
                return Err(Error::partition_table(format!(
                    "partitions `{}` and `{}` overlap",
                    pair[0].name, pair[1].name
                )));
            }
        }
        if let Some(capacity) = capacity
            && self.span() > capacity
        {
            return Err(Error::partition_table(format!(
                "layout needs {} but storage holds {}",
                Utils::format_bytes(self.span()),
                Utils::format_bytes(capacity)
            )));
        }
        Ok(())
    }

    /// Whether every partition of `layout` exists here and is large enough.
    pub fn satisfies(&self, layout: &PartitionTable) -> bool {
        layout.entries.iter().all(|wanted| {
            self.entry(&wanted.name)
                .is_some_and(|have| have.size >= wanted.size)
        })
    }
}

impl TableState {
    pub fn from_bytes(data: &[u8], capacity: Option<u64>) -> Self {
        if data.is_empty() {
            return TableState::Absent;
        }
        match PartitionTable::decode(data).and_then(|table| {
            table.validate(capacity)?;
            Ok(table)
        }) {
            Ok(table) => TableState::Valid(table),
            Err(e) => TableState::Corrupt(e.to_string()),
        }
    }

    /// Whether `layout` has to be written to reach a usable table.
    pub fn needs_repair(&self, layout: &PartitionTable) -> bool {
        match self {
            TableState::Absent | TableState::Corrupt(_) => true,
            TableState::Valid(table) => !table.satisfies(layout),
        }
    }
}
