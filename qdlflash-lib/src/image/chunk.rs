//! Lazy, bounded chunk production.
//!
//! A background thread reads the cached image and feeds a bounded channel,
//! so at most `queue_depth` chunks are resident ahead of the consumer.

use crate::{Error, Result};
use std::io::Read;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::JoinHandle;

/// One contiguous piece of a decompressed payload, ready for PROGRAM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageChunk {
    /// Byte offset within the partition.
    pub offset: u64,
    pub data: Vec<u8>,
    /// Set on the final chunk of the image.
    pub last: bool,
    /// Stored payload bytes accounted for once this chunk is written.
    pub consumed: u64,
}

/// A data region produced by an image reader, before `last` is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub offset: u64,
    pub data: Vec<u8>,
    pub consumed: u64,
}

/// Fixed-size split of a raw payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub size: u64,
    pub chunk_size: usize,
}

impl ChunkPlan {
    pub fn new(size: u64, chunk_size: usize) -> Self {
        Self {
            size,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn count(&self) -> u64 {
        self.size.div_ceil(self.chunk_size as u64)
    }

    /// `(offset, len)` of every chunk, in order.
    pub fn ranges(&self) -> impl Iterator<Item = (u64, usize)> + use<> {
        let size = self.size;
        let step = self.chunk_size as u64;
        (0..self.count()).map(move |index| {
            let offset = index * step;
            (offset, (size - offset).min(step) as usize)
        })
    }
}

/// Reads a raw payload chunk by chunk following a [`ChunkPlan`].
pub struct RawReader<R> {
    reader: R,
    ranges: Box<dyn Iterator<Item = (u64, usize)> + Send>,
    failed: bool,
}

impl<R: Read> RawReader<R> {
    pub fn new(reader: R, plan: ChunkPlan) -> Self {
        Self {
            reader,
            ranges: Box::new(plan.ranges()),
            failed: false,
        }
    }
}

impl<R: Read> Iterator for RawReader<R> {
    type Item = Result<Segment>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let (offset, len) = self.ranges.next()?;
        let mut data = vec![0u8; len];
        if let Err(e) = self.reader.read_exact(&mut data) {
            self.failed = true;
            return Some(Err(e.into()));
        }
        Some(Ok(Segment {
            offset,
            consumed: offset + len as u64,
            data,
        }))
    }
}

/// Iterator over the chunks of one image, produced on a background thread.
///
/// Dropping the stream stops the producer.
pub struct ChunkStream {
    rx: Option<Receiver<Result<ImageChunk>>>,
    producer: Option<JoinHandle<()>>,
    done: bool,
}

/// Holds back one segment so the final one can be flagged `last`. The last
/// chunk accounts for all `total` stored bytes, trailing metadata included.
fn produce<I>(segments: I, total: u64, tx: SyncSender<Result<ImageChunk>>)
where
    I: Iterator<Item = Result<Segment>>,
{
    let mut held: Option<Segment> = None;
    for segment in segments {
        let segment = match segment {
            Ok(segment) => segment,
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        };
        if let Some(prev) = held.replace(segment) {
            let chunk = ImageChunk {
                offset: prev.offset,
                data: prev.data,
                last: false,
                consumed: prev.consumed,
            };
            if tx.send(Ok(chunk)).is_err() {
                tracing::trace!("chunk consumer went away");
                return;
            }
        }
    }
    if let Some(prev) = held {
        let _ = tx.send(Ok(ImageChunk {
            offset: prev.offset,
            data: prev.data,
            last: true,
            consumed: prev.consumed.max(total),
        }));
    }
}

impl ChunkStream {
    pub fn spawn<I>(name: &str, segments: I, total: u64, queue_depth: usize) -> Result<Self>
    where
        I: Iterator<Item = Result<Segment>> + Send + 'static,
    {
        let (tx, rx) = sync_channel(queue_depth.max(1));
        let producer = std::thread::Builder::new()
            .name(format!("chunks-{}", name))
            .spawn(move || produce(segments, total, tx))
            .map_err(Error::Io)?;
        Ok(Self {
            rx: Some(rx),
            producer: Some(producer),
            done: false,
        })
    }
}

impl Iterator for ChunkStream {
    type Item = Result<ImageChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.rx.as_ref()?.recv().ok();
        match &item {
            Some(Ok(chunk)) if !chunk.last => {}
            _ => self.done = true,
        }
        item
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        // unblocks a producer waiting on a full queue
        self.rx.take();
        if let Some(producer) = self.producer.take()
            && producer.join().is_err()
        {
            tracing::error!("chunk producer panicked");
        }
    }
}
