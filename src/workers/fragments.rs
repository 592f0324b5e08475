//! Fragment packing.
//!
//! File tails shorter than a block are appended to an accumulator buffer.
//! When a tail no longer fits, the accumulator is handed to the fragment
//! compressor thread and the consumer waits for the compressed block before
//! taking a new one from the fragment pool. Image space for the block is
//! reserved right then, so fragment blocks always land at the same position
//! relative to file data. A slot in the [`FragmentTable`] is marked written
//! once the writer releases the buffer.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, trace};

use super::queue::BoundedQueue;
use super::writer::{WriteCursor, WriteData, WriterHandle};
use crate::archive::tables::FragmentEntry;
use crate::common::{BlockSize, FragmentRecord};
use crate::compress::{CompressionAlgo, Packed};
use crate::error::{ImageError, Result};
use crate::interrupt::Interrupt;
use crate::memory_pool::{Buffer, BufferPool};

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    entry: Option<FragmentEntry>,
    written: bool,
}

/// Locations of every fragment block, existing and new.
#[derive(Debug, Default)]
pub struct FragmentTable {
    slots: Mutex<Vec<Slot>>,
    written: Condvar,
}

impl FragmentTable {
    /// A table that starts with fragments already present in the image.
    pub fn with_existing(entries: &[FragmentEntry]) -> Arc<Self> {
        let slots = entries.iter().map(|&e| Slot { entry: Some(e), written: true }).collect();
        Arc::new(FragmentTable { slots: Mutex::new(slots), written: Condvar::new() })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Slot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn allocate(&self) -> u32 {
        let mut slots = self.lock();
        slots.push(Slot::default());
        (slots.len() - 1) as u32
    }

    fn set_entry(&self, index: u32, entry: FragmentEntry) {
        if let Some(slot) = self.lock().get_mut(index as usize) {
            slot.entry = Some(entry);
        }
    }

    fn mark_written(&self, index: u32) {
        if let Some(slot) = self.lock().get_mut(index as usize) {
            slot.written = true;
        }
        self.written.notify_all();
    }

    /// Wait until fragment `index` is on disk and return its location.
    pub fn wait_written(&self, index: u32, interrupt: &Interrupt) -> Result<FragmentEntry> {
        let mut slots = self.lock();
        loop {
            match slots.get(index as usize) {
                None => return Err(ImageError::corrupt(format!("fragment {index} does not exist"))),
                Some(Slot { entry: Some(entry), written: true }) => return Ok(*entry),
                Some(_) => {}
            }
            interrupt.check()?;
            slots = match self.written.wait_timeout(slots, Duration::from_millis(50)) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Every entry, in index order. Fails if a fragment was never placed.
    pub fn entries(&self) -> Result<Vec<FragmentEntry>> {
        self.lock()
            .iter()
            .enumerate()
            .map(|(i, slot)| slot.entry.ok_or_else(|| ImageError::corrupt(format!("fragment {i} was never written"))))
            .collect()
    }
}

/// A fragment block on its way to or from the compressor.
pub struct FragmentBlock {
    index: u32,
    data: Buffer,
    size: BlockSize,
}

/// Consumer-side fragment state: the open accumulator, blocks in flight and
/// uncompressed copies of blocks not yet handed to the writer.
pub struct FragmentPacker {
    pool: BufferPool,
    table: Arc<FragmentTable>,
    to_compress: BoundedQueue<FragmentBlock>,
    compressed: BoundedQueue<FragmentBlock>,
    current: Option<(u32, Buffer)>,
    pending: HashMap<u32, Vec<u8>>,
    in_flight: usize,
    blocks_written: u64,
}

impl FragmentPacker {
    pub fn new(
        pool: BufferPool,
        table: Arc<FragmentTable>,
        to_compress: BoundedQueue<FragmentBlock>,
        compressed: BoundedQueue<FragmentBlock>,
    ) -> Self {
        FragmentPacker {
            pool,
            table,
            to_compress,
            compressed,
            current: None,
            pending: HashMap::new(),
            in_flight: 0,
            blocks_written: 0,
        }
    }

    pub fn table(&self) -> &Arc<FragmentTable> {
        &self.table
    }

    /// Number of new fragment blocks handed to the writer so far.
    pub fn blocks_written(&self) -> u64 {
        self.blocks_written
    }

    /// Uncompressed bytes of a fragment that is not on disk yet.
    pub fn unwritten_bytes(&self, fragment: FragmentRecord) -> Option<&[u8]> {
        let block: &[u8] = match &self.current {
            Some((index, buf)) if *index == fragment.index => buf,
            _ => self.pending.get(&fragment.index)?,
        };
        block.get(fragment.offset as usize..(fragment.offset + fragment.size) as usize)
    }

    /// Append `tail` to the open fragment block and return where it landed.
    pub fn add(&mut self, tail: &[u8], cursor: &WriteCursor, writer: &WriterHandle) -> Result<FragmentRecord> {
        if let Some((_, buf)) = &self.current {
            if buf.remaining() < tail.len() {
                self.flush()?;
                self.drain(cursor, writer)?;
            }
        }
        if self.current.is_none() {
            let buf = self.pool.acquire()?;
            self.current = Some((self.table.allocate(), buf));
        }
        let (index, buf) = self
            .current
            .as_mut()
            .ok_or_else(|| ImageError::Other("no open fragment block".into()))?;
        let record = FragmentRecord { index: *index, offset: buf.len() as u32, size: tail.len() as u32 };
        buf.extend_from_slice(tail);
        trace!(index = record.index, offset = record.offset, size = record.size, "fragment tail");
        Ok(record)
    }

    /// Send the open accumulator to the compressor.
    fn flush(&mut self) -> Result<()> {
        if let Some((index, data)) = self.current.take() {
            self.pending.insert(index, data.to_vec());
            self.in_flight += 1;
            self.to_compress.put(FragmentBlock { index, data, size: BlockSize::SPARSE })?;
        }
        Ok(())
    }

    /// Wait for every block sent to the compressor and place it.
    fn drain(&mut self, cursor: &WriteCursor, writer: &WriterHandle) -> Result<()> {
        while self.in_flight > 0 {
            self.place_one(cursor, writer)?;
        }
        Ok(())
    }

    /// Flush the accumulator and place every remaining block.
    pub fn finish(&mut self, cursor: &WriteCursor, writer: &WriterHandle) -> Result<()> {
        self.flush()?;
        self.to_compress.close();
        self.drain(cursor, writer)?;
        debug!(blocks = self.blocks_written, "fragments placed");
        Ok(())
    }

    fn place_one(&mut self, cursor: &WriteCursor, writer: &WriterHandle) -> Result<()> {
        let FragmentBlock { index, mut data, size } = self
            .compressed
            .get()?
            .ok_or_else(|| ImageError::Other("fragment compressor stopped early".into()))?;
        self.in_flight -= 1;
        let start = cursor.reserve(size.on_disk() as u64);
        self.table.set_entry(index, FragmentEntry { start: start.get(), size });
        let table = Arc::clone(&self.table);
        data.set_release_callback(move || table.mark_written(index));
        writer.submit(start, WriteData::Block(data))?;
        self.pending.remove(&index);
        self.blocks_written += 1;
        Ok(())
    }
}

/// Body of the fragment compressor thread.
pub fn compress_fragments(
    algo: CompressionAlgo,
    mut input: BoundedQueue<FragmentBlock>,
    mut output: BoundedQueue<FragmentBlock>,
    interrupt: Arc<Interrupt>,
) -> Result<()> {
    input.close();
    let result = (|| {
        while let Some(mut block) = input.get()? {
            block.size = match algo.compress(&block.data, block.data.len())? {
                Packed::Compressed(bytes) => {
                    block.data.replace_with(&bytes);
                    BlockSize::compressed(bytes.len())
                }
                Packed::Raw => BlockSize::raw(block.data.len()),
            };
            output.put(block)?;
        }
        Ok(())
    })();
    output.close();
    if result.is_err() {
        interrupt.raise();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::writer::writer_channel;
    use std::fs::File;
    use std::thread;

    #[test]
    fn wait_written_is_cancelled_by_interrupt() {
        let table = FragmentTable::default();
        let index = table.allocate();
        let int = Interrupt::new();
        int.raise();
        assert!(matches!(table.wait_written(index, &int), Err(ImageError::Interrupted)));
    }

    #[test]
    fn tails_pack_until_full_and_reach_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        let file = std::sync::Arc::new(File::create(&path).unwrap());
        let int = Interrupt::new();

        let (mut writer, writer_thread) = writer_channel(file, path.clone(), 8, Arc::clone(&int));
        let writer_join = thread::spawn(move || writer_thread.run());

        let to_compress = BoundedQueue::new(2, Arc::clone(&int));
        let compressed = BoundedQueue::new(2, Arc::clone(&int));
        let compressor = {
            let (input, output, int) = (to_compress.clone(), compressed.clone(), Arc::clone(&int));
            thread::spawn(move || compress_fragments(CompressionAlgo::None, input, output, int))
        };
        let mut compressed_rx = compressed;
        compressed_rx.close();

        let table = Arc::new(FragmentTable::default());
        let pool = BufferPool::new(16, 2, Arc::clone(&int));
        let mut packer = FragmentPacker::new(pool, Arc::clone(&table), to_compress, compressed_rx);
        let cursor = WriteCursor::new(crate::common::ImageOffset(0));

        let a = packer.add(b"0123456789", &cursor, &writer).unwrap();
        let b = packer.add(b"abcde", &cursor, &writer).unwrap();
        assert_eq!(packer.unwritten_bytes(b).unwrap(), b"abcde");
        let c = packer.add(b"XYZ", &cursor, &writer).unwrap();
        assert_eq!((a.index, a.offset), (0, 0));
        assert_eq!((b.index, b.offset), (0, 10));
        assert_eq!((c.index, c.offset), (1, 0));
        // The full block was placed before the next tail was accepted.
        assert_eq!(packer.blocks_written(), 1);
        assert_eq!(cursor.position(), crate::common::ImageOffset(15));
        assert_eq!(packer.unwritten_bytes(c).unwrap(), b"XYZ");

        packer.finish(&cursor, &writer).unwrap();
        writer.sync().unwrap();
        let entries = table.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].size.is_raw());
        assert_eq!(table.wait_written(1, &int).unwrap().start, 15);

        writer.close();
        drop(writer);
        drop(packer);
        compressor.join().unwrap().unwrap();
        writer_join.join().unwrap().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"0123456789abcdeXYZ");
    }
}
