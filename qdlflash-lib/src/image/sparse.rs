//! Android sparse image expansion.
//!
//! A sparse file is a header followed by chunks describing the output image
//! block by block. RAW chunks carry data, FILL chunks repeat a 32-bit value,
//! DONT_CARE chunks leave the output untouched. CRC32 chunks are skipped; the
//! whole file is already covered by the manifest checksum.

use super::chunk::Segment;
use crate::{Error, Result};
use std::io::Read;

pub const SPARSE_MAGIC: u32 = 0xED26_FF3A;
const MAJOR_VERSION: u16 = 1;
const FILE_HEADER_LEN: u16 = 28;
const CHUNK_HEADER_LEN: u16 = 12;

const CHUNK_RAW: u16 = 0xCAC1;
const CHUNK_FILL: u16 = 0xCAC2;
const CHUNK_DONT_CARE: u16 = 0xCAC3;
const CHUNK_CRC32: u16 = 0xCAC4;

fn invalid(msg: impl Into<String>) -> Error {
    Error::invalid_input(format!("sparse image: {}", msg.into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseHeader {
    pub block_size: u32,
    pub total_blocks: u32,
    pub total_chunks: u32,
    chunk_header_len: u16,
}

impl SparseHeader {
    /// Size of the image once expanded.
    pub fn expanded_len(&self) -> u64 {
        self.block_size as u64 * self.total_blocks as u64
    }
}

enum Pending {
    None,
    Raw(u64),
    Fill([u8; 4], u64),
}

/// Yields the data-bearing regions of a sparse image, split to at most
/// `chunk_size` bytes each.
pub struct SparseReader<R> {
    reader: R,
    header: SparseHeader,
    chunk_size: usize,
    chunks_left: u32,
    pending: Pending,
    out_offset: u64,
    consumed: u64,
    failed: bool,
}

fn read_array<const N: usize>(reader: &mut impl Read) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn skip(reader: &mut impl Read, len: u64) -> Result<()> {
    let copied = std::io::copy(&mut reader.take(len), &mut std::io::sink())?;
    if copied != len {
        return Err(invalid("truncated header"));
    }
    Ok(())
}

impl<R: Read> SparseReader<R> {
    pub fn new(mut reader: R, chunk_size: usize) -> Result<Self> {
        let raw: [u8; FILE_HEADER_LEN as usize] = read_array(&mut reader)?;
        let u16_at = |at: usize| u16::from_le_bytes([raw[at], raw[at + 1]]);
        let u32_at =
            |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);

        if u32_at(0) != SPARSE_MAGIC {
            return Err(invalid(format!("bad magic {:#010x}", u32_at(0))));
        }
        if u16_at(4) != MAJOR_VERSION {
            return Err(invalid(format!("unsupported version {}", u16_at(4))));
        }
        let file_header_len = u16_at(8);
        let chunk_header_len = u16_at(10);
        if file_header_len < FILE_HEADER_LEN || chunk_header_len < CHUNK_HEADER_LEN {
            return Err(invalid("header too short"));
        }
        let block_size = u32_at(12);
        if block_size == 0 || block_size % 4 != 0 {
            return Err(invalid(format!("block size {}", block_size)));
        }
        skip(&mut reader, (file_header_len - FILE_HEADER_LEN) as u64)?;

        let header = SparseHeader {
            block_size,
            total_blocks: u32_at(16),
            total_chunks: u32_at(20),
            chunk_header_len,
        };
        tracing::debug!(
            "sparse image: {} chunks, {} blocks of {} bytes",
            header.total_chunks,
            header.total_blocks,
            header.block_size
        );
        Ok(Self {
            reader,
            header,
            chunk_size: chunk_size.max(1),
            chunks_left: header.total_chunks,
            pending: Pending::None,
            out_offset: 0,
            consumed: file_header_len as u64,
            failed: false,
        })
    }

    pub fn header(&self) -> &SparseHeader {
        &self.header
    }

    /// Reads chunk headers until one with data is found.
    fn advance(&mut self) -> Result<bool> {
        while matches!(self.pending, Pending::None) {
            if self.chunks_left == 0 {
                if self.out_offset != self.header.expanded_len() {
                    return Err(invalid(format!(
                        "chunks cover {} bytes, header declares {}",
                        self.out_offset,
                        self.header.expanded_len()
                    )));
                }
                return Ok(false);
            }
            self.chunks_left -= 1;

            let raw: [u8; CHUNK_HEADER_LEN as usize] = read_array(&mut self.reader)?;
            skip(
                &mut self.reader,
                (self.header.chunk_header_len - CHUNK_HEADER_LEN) as u64,
            )?;
            self.consumed += self.header.chunk_header_len as u64;

            let kind = u16::from_le_bytes([raw[0], raw[1]]);
            let blocks = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as u64;
            let total = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]) as u64;
            let body = total
                .checked_sub(self.header.chunk_header_len as u64)
                .ok_or_else(|| invalid("chunk shorter than its header"))?;
            let out_len = blocks * self.header.block_size as u64;

            match kind {
                CHUNK_RAW => {
                    if body != out_len {
                        return Err(invalid(format!(
                            "raw chunk carries {} bytes for {} blocks",
                            body, blocks
                        )));
                    }
                    self.pending = Pending::Raw(out_len);
                }
                CHUNK_FILL => {
                    if body != 4 {
                        return Err(invalid("fill chunk without a 4-byte value"));
                    }
                    let value: [u8; 4] = read_array(&mut self.reader)?;
                    self.consumed += 4;
                    self.pending = Pending::Fill(value, out_len);
                }
                CHUNK_DONT_CARE => {
                    if body != 0 {
                        return Err(invalid("don't-care chunk carries data"));
                    }
                    self.out_offset += out_len;
                }
                CHUNK_CRC32 => {
                    skip(&mut self.reader, body)?;
                    self.consumed += body;
                }
                other => return Err(invalid(format!("unknown chunk type {:#06x}", other))),
            }
            if matches!(self.pending, Pending::Raw(0) | Pending::Fill(_, 0)) {
                self.pending = Pending::None;
            }
        }
        Ok(true)
    }

    fn next_segment(&mut self) -> Result<Option<Segment>> {
        if !self.advance()? {
            return Ok(None);
        }
        let offset = self.out_offset;
        let (data, left) = match &mut self.pending {
            Pending::Raw(left) => {
                let n = (*left).min(self.chunk_size as u64) as usize;
                let mut data = vec![0u8; n];
                self.reader.read_exact(&mut data)?;
                self.consumed += n as u64;
                *left -= n as u64;
                (data, *left)
            }
            Pending::Fill(value, left) => {
                let n = (*left).min(self.chunk_size as u64) as usize;
                let data: Vec<u8> = value.iter().copied().cycle().take(n).collect();
                *left -= n as u64;
                (data, *left)
            }
            Pending::None => return Ok(None),
        };
        if left == 0 {
            self.pending = Pending::None;
        }
        self.out_offset += data.len() as u64;
        Ok(Some(Segment {
            offset,
            data,
            consumed: self.consumed,
        }))
    }
}

impl<R: Read> Iterator for SparseReader<R> {
    type Item = Result<Segment>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_segment() {
            Ok(segment) => segment.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a sparse image from `(type, blocks, body)` chunks.
    pub(crate) fn build(block_size: u32, chunks: &[(u16, u32, Vec<u8>)]) -> Vec<u8> {
        let total_blocks: u32 = chunks.iter().filter(|c| c.0 != CHUNK_CRC32).map(|c| c.1).sum();
        let mut out = Vec::new();
        out.extend_from_slice(&SPARSE_MAGIC.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&FILE_HEADER_LEN.to_le_bytes());
        out.extend_from_slice(&CHUNK_HEADER_LEN.to_le_bytes());
        out.extend_from_slice(&block_size.to_le_bytes());
        out.extend_from_slice(&total_blocks.to_le_bytes());
        out.extend_from_slice(&(chunks.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        for (kind, blocks, body) in chunks {
            out.extend_from_slice(&kind.to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&blocks.to_le_bytes());
            out.extend_from_slice(&(CHUNK_HEADER_LEN as u32 + body.len() as u32).to_le_bytes());
            out.extend_from_slice(body);
        }
        out
    }

    pub(crate) fn sample() -> Vec<u8> {
        build(
            8,
            &[
                (CHUNK_RAW, 2, (0u8..16).collect()),
                (CHUNK_DONT_CARE, 3, Vec::new()),
                (CHUNK_FILL, 1, vec![0xAA, 0xBB, 0xCC, 0xDD]),
                (CHUNK_CRC32, 0, vec![0; 4]),
            ],
        )
    }

    #[test]
    fn expands_raw_fill_and_skips_holes() {
        let image = sample();
        let reader = SparseReader::new(image.as_slice(), 10).unwrap();
        assert_eq!(reader.header().expanded_len(), 48);
        let segments: Vec<_> = reader.collect::<Result<_>>().unwrap();

        let layout: Vec<_> = segments.iter().map(|s| (s.offset, s.data.len())).collect();
        assert_eq!(layout, vec![(0, 10), (10, 6), (40, 8)]);
        assert_eq!(segments[1].data, (10u8..16).collect::<Vec<_>>());
        assert_eq!(segments[2].data, [0xAA, 0xBB, 0xCC, 0xDD, 0xAA, 0xBB, 0xCC, 0xDD]);

        let consumed: Vec<_> = segments.iter().map(|s| s.consumed).collect();
        assert!(consumed.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn rejects_bad_magic_and_short_chunks() {
        let mut image = sample();
        image[0] ^= 0xFF;
        assert!(SparseReader::new(image.as_slice(), 16).is_err());

        let short = build(8, &[(CHUNK_RAW, 2, vec![0; 15])]);
        let mut reader = SparseReader::new(short.as_slice(), 16).unwrap();
        assert!(matches!(reader.next(), Some(Err(Error::InvalidInput(_)))));
        assert!(reader.next().is_none());
    }

    #[test]
    fn truncated_image_fails() {
        let image = sample();
        let truncated = &image[..40];
        let results: Vec<_> = SparseReader::new(truncated, 16).unwrap().collect();
        assert!(results.last().unwrap().is_err());
    }
}
