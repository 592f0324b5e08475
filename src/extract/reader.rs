//! Read access to a finished image.
//!
//! The image is memory-mapped; the inode and directory tables are decoded
//! in full when the image is opened, data blocks and fragments on demand.

use std::collections::HashSet;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use memmap2::Mmap;
use tracing::debug;

use crate::archive::directory::{decode_listing, find_entry, ListingEntry};
use crate::archive::inode::{FileInfo, Inode};
use crate::archive::metadata::DecodedTable;
use crate::archive::tables::{
    decode_indexed, decode_u64s, FragmentEntry, IdTable, FRAGMENT_ENTRY_SIZE, ID_ENTRY_SIZE, LOOKUP_ENTRY_SIZE,
    LOOKUP_UNUSED,
};
use crate::archive::Superblock;
use crate::common::{BlockSize, MetaRef};
use crate::compress::CompressionAlgo;
use crate::error::{ImageError, Result};

/// A piece of file content produced while reassembling a file.
pub enum Chunk<'a> {
    Data(&'a [u8]),
    /// A run of zero bytes that was stored sparse.
    Hole(u64),
}

pub struct ImageReader {
    path: PathBuf,
    map: Mmap,
    superblock: Superblock,
    algo: CompressionAlgo,
    inodes: DecodedTable,
    dirs: DecodedTable,
    fragments: Vec<FragmentEntry>,
    uids: IdTable,
    gids: IdTable,
    lookup: Option<Vec<u64>>,
    fragment_cache: Mutex<Option<(u32, Arc<Vec<u8>>)>>,
}

impl ImageReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| ImageError::io(e, path))?;
        // SAFETY: the image is opened read-only and is not expected to change
        // while it is being read.
        let map = unsafe { Mmap::map(&file) }.map_err(|e| ImageError::io(e, path))?;
        let superblock = Superblock::decode(&map, map.len() as u64)?;
        let algo = superblock.algo()?;

        let inodes = DecodedTable::decode(
            algo,
            &map[superblock.inode_table_start as usize..superblock.directory_table_start as usize],
        )?;
        let dirs = DecodedTable::decode(
            algo,
            &map[superblock.directory_table_start as usize..superblock.directory_table_end as usize],
        )?;
        let fragments = if superblock.fragment_count == 0 {
            Vec::new()
        } else {
            FragmentEntry::decode_all(&decode_indexed(
                algo,
                &map,
                superblock.fragment_table_start,
                superblock.fragment_count as usize,
                FRAGMENT_ENTRY_SIZE,
            )?)?
        };
        let uids = IdTable::decode(&decode_indexed(
            algo,
            &map,
            superblock.uid_table_start,
            superblock.uid_count as usize,
            ID_ENTRY_SIZE,
        )?)?;
        let gids = IdTable::decode(&decode_indexed(
            algo,
            &map,
            superblock.gid_table_start,
            superblock.gid_count as usize,
            ID_ENTRY_SIZE,
        )?)?;
        let lookup = if superblock.has_lookup_table() {
            Some(decode_u64s(&decode_indexed(
                algo,
                &map,
                superblock.lookup_table_start,
                superblock.inode_count as usize,
                LOOKUP_ENTRY_SIZE,
            )?)?)
        } else {
            None
        };
        debug!(
            path = %path.display(),
            inodes = superblock.inode_count,
            fragments = fragments.len(),
            "opened image"
        );

        Ok(ImageReader {
            path: path.to_path_buf(),
            map,
            superblock,
            algo,
            inodes,
            dirs,
            fragments,
            uids,
            gids,
            lookup,
            fragment_cache: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn algo(&self) -> CompressionAlgo {
        self.algo
    }

    pub fn fragments(&self) -> &[FragmentEntry] {
        &self.fragments
    }

    pub fn uids(&self) -> &IdTable {
        &self.uids
    }

    pub fn gids(&self) -> &IdTable {
        &self.gids
    }

    pub fn lookup_table(&self) -> Option<&[u64]> {
        self.lookup.as_deref()
    }

    /// The compressed inode table as stored.
    pub fn inode_table_bytes(&self) -> &[u8] {
        &self.map[self.superblock.inode_table_start as usize..self.superblock.directory_table_start as usize]
    }

    pub fn directory_table_bytes(&self) -> &[u8] {
        &self.map[self.superblock.directory_table_start as usize..self.superblock.directory_table_end as usize]
    }

    pub fn inode(&self, r: MetaRef) -> Result<Inode> {
        Inode::decode(self.inodes.slice_from(r)?, self.superblock.block_size)
    }

    pub fn root(&self) -> Result<Inode> {
        self.inode(self.superblock.root_inode)
    }

    /// Inode by number, through the lookup table.
    pub fn inode_by_number(&self, number: u32) -> Result<Option<Inode>> {
        let lookup = self
            .lookup
            .as_ref()
            .ok_or_else(|| ImageError::Unsupported("image has no inode lookup table".into()))?;
        match number.checked_sub(1).and_then(|i| lookup.get(i as usize)) {
            None | Some(&LOOKUP_UNUSED) => Ok(None),
            Some(&packed) => self.inode(MetaRef::unpack(packed)).map(Some),
        }
    }

    pub fn uid(&self, inode: &Inode) -> Result<u32> {
        self.uids.get(inode.uid_idx)
    }

    pub fn gid(&self, inode: &Inode) -> Result<u32> {
        self.gids.get(inode.gid_idx)
    }

    fn listing_bytes(&self, dir: &Inode) -> Result<&[u8]> {
        let info = dir.as_dir()?;
        if info.listing_size == 0 {
            return Ok(&[]);
        }
        self.dirs
            .slice_from(info.listing)?
            .get(..info.listing_size as usize)
            .ok_or_else(|| ImageError::corrupt(format!("listing of directory {} runs past the table", dir.number)))
    }

    pub fn read_dir(&self, dir: &Inode) -> Result<Vec<ListingEntry>> {
        decode_listing(self.listing_bytes(dir)?)
    }

    /// Find one name in a directory, starting from the closest index entry
    /// of a large directory.
    pub fn lookup_child(&self, dir: &Inode, name: &[u8]) -> Result<Option<ListingEntry>> {
        let info = dir.as_dir()?;
        let from = info
            .index
            .iter()
            .take_while(|e| e.name.as_slice() <= name)
            .last()
            .map_or(0, |e| e.listing_offset as usize);
        find_entry(self.listing_bytes(dir)?, from, name)
    }

    /// Resolve a path relative to the image root. Symlinks are not followed.
    pub fn resolve(&self, path: &Path) -> Result<Option<Inode>> {
        let mut current = self.root()?;
        for component in path.components() {
            let name = match component {
                Component::Normal(name) => name,
                Component::RootDir | Component::CurDir => continue,
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(ImageError::InvalidOptions(format!("path {} leaves the image", path.display())))
                }
            };
            if current.as_dir().is_err() {
                return Ok(None);
            }
            match self.lookup_child(&current, name.as_bytes())? {
                Some(entry) => current = self.inode(entry.inode)?,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Visit every entry below `start` (whose path is `prefix`) in pre-order:
    /// a directory before its children, siblings by name.
    pub fn walk<F>(&self, start: &Inode, prefix: &Path, mut f: F) -> Result<()>
    where
        F: FnMut(&Path, &ListingEntry, &Inode) -> Result<()>,
    {
        let mut visited = HashSet::new();
        self.walk_dir(start, prefix, &mut visited, &mut f)
    }

    fn walk_dir<F>(&self, dir: &Inode, prefix: &Path, visited: &mut HashSet<u32>, f: &mut F) -> Result<()>
    where
        F: FnMut(&Path, &ListingEntry, &Inode) -> Result<()>,
    {
        if !visited.insert(dir.number) {
            return Err(ImageError::corrupt(format!("directory {} appears twice in the tree", dir.number)));
        }
        for entry in self.read_dir(dir)? {
            let inode = self.inode(entry.inode)?;
            if inode.number != entry.number || inode.kind != entry.kind {
                return Err(ImageError::corrupt(format!(
                    "entry {} does not match its inode",
                    String::from_utf8_lossy(&entry.name)
                )));
            }
            let path = prefix.join(std::ffi::OsStr::from_bytes(&entry.name));
            f(&path, &entry, &inode)?;
            if inode.as_dir().is_ok() {
                self.walk_dir(&inode, &path, visited, f)?;
            }
        }
        Ok(())
    }

    /// Stored bytes of a data or fragment block, decompressed.
    fn block(&self, start: u64, size: BlockSize) -> Result<std::borrow::Cow<'_, [u8]>> {
        let stored = self
            .map
            .get(start as usize..)
            .and_then(|rest| rest.get(..size.on_disk() as usize))
            .ok_or_else(|| ImageError::corrupt(format!("block at {start} runs past the image")))?;
        if size.is_raw() {
            Ok(std::borrow::Cow::Borrowed(stored))
        } else {
            Ok(std::borrow::Cow::Owned(self.algo.decompress(stored, self.superblock.block_size as usize)?))
        }
    }

    /// Uncompressed content of fragment block `index`.
    pub fn fragment_block(&self, index: u32) -> Result<Arc<Vec<u8>>> {
        if let Some((cached, block)) = self.lock_fragment_cache().as_ref() {
            if *cached == index {
                return Ok(Arc::clone(block));
            }
        }
        let entry = self
            .fragments
            .get(index as usize)
            .ok_or_else(|| ImageError::corrupt(format!("fragment {index} out of range")))?;
        // Decompressed unlocked so parallel extraction does not queue here.
        let block = Arc::new(self.block(entry.start, entry.size)?.into_owned());
        *self.lock_fragment_cache() = Some((index, Arc::clone(&block)));
        Ok(block)
    }

    fn lock_fragment_cache(&self) -> std::sync::MutexGuard<'_, Option<(u32, Arc<Vec<u8>>)>> {
        match self.fragment_cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Feed a file's content to `sink` in order.
    pub fn for_each_chunk<F>(&self, file: &FileInfo, mut sink: F) -> Result<()>
    where
        F: FnMut(Chunk<'_>) -> Result<()>,
    {
        let bs = self.superblock.block_size as u64;
        let mut remaining = file.size;
        let mut offset = file.start;
        for &block in &file.blocks {
            let want = remaining.min(bs);
            if block.is_sparse() {
                sink(Chunk::Hole(want))?;
            } else {
                let data = self.block(offset, block)?;
                if data.len() as u64 != want {
                    return Err(ImageError::corrupt(format!(
                        "block at {offset} holds {} bytes, expected {want}",
                        data.len()
                    )));
                }
                sink(Chunk::Data(&data))?;
                offset += block.on_disk() as u64;
            }
            remaining -= want;
        }
        if !file.fragment.is_none() {
            let block = self.fragment_block(file.fragment.index)?;
            let tail = block
                .get(file.fragment.offset as usize..)
                .and_then(|rest| rest.get(..file.fragment.size as usize))
                .ok_or_else(|| ImageError::corrupt(format!("fragment {} is too short", file.fragment.index)))?;
            sink(Chunk::Data(tail))?;
            remaining -= tail.len() as u64;
        }
        if remaining != 0 {
            return Err(ImageError::corrupt(format!("file content is {remaining} bytes short")));
        }
        Ok(())
    }

    /// Whole content of a file in memory.
    pub fn read_file(&self, file: &FileInfo) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(file.size as usize);
        self.for_each_chunk(file, |chunk| {
            match chunk {
                Chunk::Data(bytes) => out.extend_from_slice(bytes),
                Chunk::Hole(len) => out.resize(out.len() + len as usize, 0),
            }
            Ok(())
        })?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_is_not_an_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk");
        std::fs::write(&path, vec![7u8; 4096]).unwrap();
        assert!(matches!(ImageReader::open(&path), Err(ImageError::Corrupt(_))));
    }

    #[test]
    fn fragment_blocks_read_from_many_threads() {
        use crate::build::build_image;
        use crate::compress::{BuildOptions, CompressionAlgo};
        use crate::interrupt::Interrupt;

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir(&src).unwrap();
        let content = |i: usize| format!("{i:04}-").repeat(200).into_bytes();
        for i in 0..24 {
            std::fs::write(src.join(format!("f{i:02}")), content(i)).unwrap();
        }
        let image = dir.path().join("image");
        let opts = BuildOptions { block_size: 4096, algo: CompressionAlgo::Zstd { level: 3 }, ..Default::default() };
        build_image(&[src], &image, &opts, &Interrupt::new()).unwrap();

        let reader = ImageReader::open(&image).unwrap();
        assert!(reader.fragments().len() > 1);
        std::thread::scope(|scope| {
            for t in 0..4 {
                let reader = &reader;
                scope.spawn(move || {
                    for i in (0..24).map(|i| (i + t * 5) % 24) {
                        let inode = reader.resolve(Path::new(&format!("f{i:02}"))).unwrap().unwrap();
                        assert_eq!(reader.read_file(inode.as_file().unwrap()).unwrap(), content(i));
                    }
                });
            }
        });
    }
}
