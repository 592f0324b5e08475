//! Inode records.
//!
//! Every record starts with a common header; the type code selects the
//! payload. Directories and regular files have a compact and an extended
//! form; [`Inode::encode`] picks the compact one whenever the values fit.

use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use super::{LeReader, PutLe};
use crate::common::{BlockSize, FileKind, FragmentRecord, MetaRef};
use crate::error::{ImageError, Result};

const LARGE_DIR: u16 = 8;
const LARGE_FILE: u16 = 9;

/// Mask of the permission bits stored in a record (`rwx` plus setuid, setgid, sticky).
pub const PERMISSION_MASK: u32 = 0o7777;

/// One entry of a large directory's index: where a listing header starts,
/// which directory-table page holds it, and the first name it lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirIndexEntry {
    pub listing_offset: u32,
    pub dir_page: u32,
    pub name: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirInfo {
    /// Start of the listing in the directory table.
    pub listing: MetaRef,
    pub listing_size: u32,
    pub parent: u32,
    pub index: Vec<DirIndexEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Image offset of the first data block.
    pub start: u64,
    pub size: u64,
    /// Bytes of the file covered by sparse blocks.
    pub sparse: u64,
    pub fragment: FragmentRecord,
    pub blocks: Vec<BlockSize>,
}

impl FileInfo {
    /// Number of block-list entries a file of `size` bytes carries.
    pub fn block_count(size: u64, block_size: u32, has_fragment: bool) -> usize {
        let bs = block_size as u64;
        if has_fragment {
            (size / bs) as usize
        } else {
            size.div_ceil(bs) as usize
        }
    }

    /// Bytes occupied by the data blocks in the image.
    pub fn stored_len(&self) -> u64 {
        self.blocks.iter().map(|b| b.on_disk() as u64).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InodeBody {
    Dir(DirInfo),
    File(FileInfo),
    Symlink(PathBuf),
    Device { major: u32, minor: u32 },
    /// Fifo or socket.
    Ipc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub kind: FileKind,
    /// Permission bits only; the type bits come from `kind`.
    pub mode: u32,
    pub uid_idx: u16,
    pub gid_idx: u16,
    pub mtime: i64,
    pub number: u32,
    pub nlink: u32,
    pub body: InodeBody,
}

impl Inode {
    fn is_large_dir(d: &DirInfo, nlink: u32) -> bool {
        !d.index.is_empty()
            || d.listing_size > u16::MAX as u32
            || nlink > u16::MAX as u32
            || d.listing.page > u32::MAX as u64
    }

    fn is_large_file(f: &FileInfo, nlink: u32) -> bool {
        f.size > u32::MAX as u64 || f.start > u32::MAX as u64 || nlink > 1 || f.sparse > 0
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let code = match &self.body {
            InodeBody::Dir(d) if Self::is_large_dir(d, self.nlink) => LARGE_DIR,
            InodeBody::File(f) if Self::is_large_file(f, self.nlink) => LARGE_FILE,
            _ => self.kind.code(),
        };
        out.put_u16(code);
        out.put_u16((self.mode & PERMISSION_MASK) as u16);
        out.put_u16(self.uid_idx);
        out.put_u16(self.gid_idx);
        out.put_i64(self.mtime);
        out.put_u32(self.number);

        match &self.body {
            InodeBody::Dir(d) if code == LARGE_DIR => {
                out.put_u32(self.nlink);
                out.put_u32(d.listing_size);
                out.put_u32(page_u32(d.listing.page)?);
                out.put_u32(d.parent);
                out.put_u16(u16::try_from(d.index.len()).map_err(|_| {
                    ImageError::Unsupported("directory index has more than 65535 entries".into())
                })?);
                out.put_u16(d.listing.offset);
                for entry in &d.index {
                    out.put_u32(entry.listing_offset);
                    out.put_u32(entry.dir_page);
                    out.put_u32(entry.name.len() as u32);
                    out.extend_from_slice(&entry.name);
                }
            }
            InodeBody::Dir(d) => {
                out.put_u32(d.listing.page as u32);
                out.put_u16(self.nlink as u16);
                out.put_u16(d.listing_size as u16);
                out.put_u16(d.listing.offset);
                out.put_u32(d.parent);
            }
            InodeBody::File(f) if code == LARGE_FILE => {
                out.put_u64(f.start);
                out.put_u64(f.size);
                out.put_u64(f.sparse);
                out.put_u32(self.nlink);
                out.put_u32(f.fragment.index);
                out.put_u32(f.fragment.offset);
                f.blocks.iter().for_each(|b| out.put_u32(b.0));
            }
            InodeBody::File(f) => {
                out.put_u32(f.start as u32);
                out.put_u32(f.fragment.index);
                out.put_u32(f.fragment.offset);
                out.put_u32(f.size as u32);
                f.blocks.iter().for_each(|b| out.put_u32(b.0));
            }
            InodeBody::Symlink(target) => {
                let bytes = target.as_os_str().as_bytes();
                out.put_u32(self.nlink);
                out.put_u32(bytes.len() as u32);
                out.extend_from_slice(bytes);
            }
            InodeBody::Device { major, minor } => {
                out.put_u32(self.nlink);
                out.put_u32(*major);
                out.put_u32(*minor);
            }
            InodeBody::Ipc => out.put_u32(self.nlink),
        }
        Ok(())
    }

    /// Decode the record at the start of `bytes`. Regular files need the
    /// block size to know how many block-list entries follow.
    pub fn decode(bytes: &[u8], block_size: u32) -> Result<Inode> {
        let mut r = LeReader::new(bytes, "inode");
        let code = r.u16()?;
        let mode = r.u16()? as u32;
        let uid_idx = r.u16()?;
        let gid_idx = r.u16()?;
        let mtime = r.i64()?;
        let number = r.u32()?;

        let kind = match code {
            LARGE_DIR => FileKind::Directory,
            LARGE_FILE => FileKind::Regular,
            other => FileKind::from_code(other)
                .ok_or_else(|| ImageError::corrupt(format!("unknown inode type {other} for inode {number}")))?,
        };

        let (nlink, body) = match (code, kind) {
            (LARGE_DIR, _) => {
                let nlink = r.u32()?;
                let listing_size = r.u32()?;
                let page = r.u32()? as u64;
                let parent = r.u32()?;
                let count = r.u16()?;
                let offset = r.u16()?;
                let mut index = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let listing_offset = r.u32()?;
                    let dir_page = r.u32()?;
                    let len = r.u32()? as usize;
                    index.push(DirIndexEntry { listing_offset, dir_page, name: r.bytes(len)?.to_vec() });
                }
                let listing = MetaRef::new(page, offset);
                (nlink, InodeBody::Dir(DirInfo { listing, listing_size, parent, index }))
            }
            (_, FileKind::Directory) => {
                let page = r.u32()? as u64;
                let nlink = r.u16()? as u32;
                let listing_size = r.u16()? as u32;
                let offset = r.u16()?;
                let parent = r.u32()?;
                let listing = MetaRef::new(page, offset);
                (nlink, InodeBody::Dir(DirInfo { listing, listing_size, parent, index: Vec::new() }))
            }
            (LARGE_FILE, _) => {
                let start = r.u64()?;
                let size = r.u64()?;
                let sparse = r.u64()?;
                let nlink = r.u32()?;
                let mut fragment = read_fragment(&mut r)?;
                let blocks = read_blocks(&mut r, size, block_size, &mut fragment)?;
                (nlink, InodeBody::File(FileInfo { start, size, sparse, fragment, blocks }))
            }
            (_, FileKind::Regular) => {
                let start = r.u32()? as u64;
                let mut fragment = read_fragment(&mut r)?;
                let size = r.u32()? as u64;
                let blocks = read_blocks(&mut r, size, block_size, &mut fragment)?;
                (1, InodeBody::File(FileInfo { start, size, sparse: 0, fragment, blocks }))
            }
            (_, FileKind::Symlink) => {
                let nlink = r.u32()?;
                let len = r.u32()? as usize;
                let target = std::ffi::OsStr::from_bytes(r.bytes(len)?);
                (nlink, InodeBody::Symlink(PathBuf::from(target)))
            }
            (_, FileKind::BlockDevice | FileKind::CharDevice) => {
                let nlink = r.u32()?;
                let major = r.u32()?;
                let minor = r.u32()?;
                (nlink, InodeBody::Device { major, minor })
            }
            (_, FileKind::Fifo | FileKind::Socket) => (r.u32()?, InodeBody::Ipc),
        };

        Ok(Inode { kind, mode, uid_idx, gid_idx, mtime, number, nlink, body })
    }

    pub fn as_dir(&self) -> Result<&DirInfo> {
        match &self.body {
            InodeBody::Dir(d) => Ok(d),
            _ => Err(ImageError::corrupt(format!("inode {} is not a directory", self.number))),
        }
    }

    pub fn as_file(&self) -> Option<&FileInfo> {
        match &self.body {
            InodeBody::File(f) => Some(f),
            _ => None,
        }
    }

    /// Full `st_mode` value: type bits plus permissions.
    pub fn st_mode(&self) -> u32 {
        self.kind.mode_bits() | (self.mode & PERMISSION_MASK)
    }
}

fn page_u32(page: u64) -> Result<u32> {
    u32::try_from(page).map_err(|_| ImageError::Unsupported("directory table larger than 4 GiB".into()))
}

fn read_fragment(r: &mut LeReader<'_>) -> Result<FragmentRecord> {
    let index = r.u32()?;
    let offset = r.u32()?;
    Ok(FragmentRecord { index, offset, size: 0 })
}

/// Reads the block list and fills in the fragment length, which is whatever
/// the blocks do not cover.
fn read_blocks(r: &mut LeReader<'_>, size: u64, block_size: u32, fragment: &mut FragmentRecord) -> Result<Vec<BlockSize>> {
    let count = FileInfo::block_count(size, block_size, !fragment.is_none());
    if count.saturating_mul(4) > r.remaining() {
        return Err(ImageError::corrupt(format!("block list of {count} entries is truncated")));
    }
    if !fragment.is_none() {
        fragment.size = (size - count as u64 * block_size as u64) as u32;
    }
    (0..count).map(|_| r.u32().map(BlockSize)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(kind: FileKind, body: InodeBody) -> Inode {
        Inode { kind, mode: 0o644, uid_idx: 0, gid_idx: 1, mtime: 1_700_000_000, number: 7, nlink: 1, body }
    }

    fn round_trip(inode: &Inode, block_size: u32) -> Inode {
        let mut buf = Vec::new();
        inode.encode(&mut buf).unwrap();
        Inode::decode(&buf, block_size).unwrap()
    }

    #[test]
    fn compact_file_with_fragment() {
        let inode = header(
            FileKind::Regular,
            InodeBody::File(FileInfo {
                start: 128,
                size: 4096 * 2 + 500,
                sparse: 0,
                fragment: FragmentRecord { index: 3, offset: 1000, size: 500 },
                blocks: vec![BlockSize::compressed(900), BlockSize::raw(4096)],
            }),
        );
        let mut buf = Vec::new();
        inode.encode(&mut buf).unwrap();
        assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), FileKind::Regular.code());
        assert_eq!(round_trip(&inode, 4096), inode);
    }

    #[test]
    fn hard_linked_file_uses_large_form() {
        let mut inode = header(
            FileKind::Regular,
            InodeBody::File(FileInfo {
                start: 1 << 33,
                size: 10,
                sparse: 0,
                fragment: FragmentRecord::NONE,
                blocks: vec![BlockSize::compressed(8)],
            }),
        );
        inode.nlink = 2;
        let mut buf = Vec::new();
        inode.encode(&mut buf).unwrap();
        assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), LARGE_FILE);
        assert_eq!(round_trip(&inode, 4096), inode);
    }

    #[test]
    fn large_directory_keeps_index() {
        let mut inode = header(
            FileKind::Directory,
            InodeBody::Dir(DirInfo {
                listing: MetaRef::new(8200, 12),
                listing_size: 70_000,
                parent: 1,
                index: vec![
                    DirIndexEntry { listing_offset: 0, dir_page: 8200, name: b"a".to_vec() },
                    DirIndexEntry { listing_offset: 8180, dir_page: 12000, name: b"m".to_vec() },
                ],
            }),
        );
        inode.nlink = 2;
        assert_eq!(round_trip(&inode, 4096), inode);
    }

    #[test]
    fn symlink_and_device() {
        let link = header(FileKind::Symlink, InodeBody::Symlink(PathBuf::from("../target")));
        assert_eq!(round_trip(&link, 4096), link);
        let dev = header(FileKind::CharDevice, InodeBody::Device { major: 1, minor: 3 });
        assert_eq!(round_trip(&dev, 4096), dev);
        assert_eq!(dev.st_mode(), 0o020644);
    }

    #[test]
    fn unknown_type_is_corrupt() {
        let mut buf = Vec::new();
        header(FileKind::Fifo, InodeBody::Ipc).encode(&mut buf).unwrap();
        buf[0] = 42;
        assert!(matches!(Inode::decode(&buf, 4096), Err(ImageError::Corrupt(_))));
    }
}
