//! Source tree scanning.
//!
//! Walks one or more source paths with `walkdir` (never following symlinks,
//! children sorted by name bytes) and produces a [`Tree`]: nested [`Entry`]
//! values owned by their directory, plus an arena of [`InodeInfo`] that
//! entries point into. Non-directories that share a (device, inode) pair get
//! one `InodeInfo` whose link count is the number of paths found; directories
//! always get their own.
//!
//! Entries that cannot be stat'ed or read are logged and left out.

use std::collections::HashMap;
use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::common::{FileKind, MetaRef};
use crate::error::{ImageError, Result};

/// Index of an [`InodeInfo`] in [`Tree::inodes`].
pub type InodeId = usize;

/// POSIX attributes recorded for an inode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryMeta {
    /// Permission bits (including setuid, setgid, sticky).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    /// Size in bytes for regular files, zero otherwise.
    pub size: u64,
    pub rdev: u64,
}

impl EntryMeta {
    fn from_metadata(md: &fs::Metadata) -> Self {
        EntryMeta {
            mode: md.mode() & 0o7777,
            uid: md.uid(),
            gid: md.gid(),
            mtime: md.mtime(),
            size: if md.is_file() { md.len() } else { 0 },
            rdev: md.rdev(),
        }
    }
}

/// One physical inode.
#[derive(Debug, Clone)]
pub struct InodeInfo {
    pub kind: FileKind,
    pub meta: EntryMeta,
    /// First path this inode was found at.
    pub source: PathBuf,
    pub symlink_target: Option<PathBuf>,
    pub nlink: u32,
    /// Inode number; 0 until numbers are assigned.
    pub number: u32,
    /// Where the inode record was written, once it has been.
    pub inode_ref: Option<MetaRef>,
    /// Content could not be read; every path to it is dropped.
    pub failed: bool,
    /// Already present in the image being appended to.
    pub existing: bool,
}

impl InodeInfo {
    fn new(kind: FileKind, meta: EntryMeta, source: PathBuf) -> Self {
        InodeInfo {
            kind,
            meta,
            source,
            symlink_target: None,
            nlink: 1,
            number: 0,
            inode_ref: None,
            failed: false,
            existing: false,
        }
    }

    /// An inode carried over from an existing image. Only its identity matters.
    pub fn existing(kind: FileKind, number: u32, inode_ref: MetaRef) -> Self {
        InodeInfo {
            number,
            inode_ref: Some(inode_ref),
            existing: true,
            ..InodeInfo::new(kind, EntryMeta::default(), PathBuf::new())
        }
    }
}

/// A name in a directory.
#[derive(Debug, Clone)]
pub struct Entry {
    pub name: OsString,
    pub inode: InodeId,
    /// Children of a directory, sorted by name bytes.
    pub children: Vec<Entry>,
}

#[derive(Debug, Clone)]
pub struct Tree {
    pub root: Entry,
    pub inodes: Vec<InodeInfo>,
}

/// A directory whose children are still being collected.
struct OpenDir {
    name: OsString,
    path: PathBuf,
    meta: EntryMeta,
    children: Vec<Entry>,
}

/// Walks source paths and builds a [`Tree`].
pub struct Scanner {
    excludes: HashSet<PathBuf>,
    inodes: Vec<InodeInfo>,
    links: HashMap<(u64, u64), InodeId>,
}

impl Scanner {
    /// `excludes` are paths relative to each source root.
    pub fn new(excludes: &[PathBuf]) -> Self {
        Scanner {
            excludes: excludes.iter().map(|p| normalize(p)).collect(),
            inodes: Vec::new(),
            links: HashMap::new(),
        }
    }

    /// Scan `sources`. A single directory source becomes the root; otherwise
    /// each source becomes a child of a synthetic root.
    pub fn scan(mut self, sources: &[PathBuf]) -> Result<Tree> {
        if sources.is_empty() {
            return Err(ImageError::InvalidOptions("no source paths given".into()));
        }
        if let [single] = sources {
            let md = fs::symlink_metadata(single).map_err(|e| ImageError::io(e, single))?;
            if md.is_dir() {
                let root = self.scan_dir(single, OsString::new())?;
                let mut tree = Tree { root, inodes: self.inodes };
                tree.finish_dir_links();
                return Ok(tree);
            }
        }

        let root_inode = self.push_inode(InodeInfo::new(FileKind::Directory, synthetic_root_meta(), PathBuf::new()));
        let mut root = Entry { name: OsString::new(), inode: root_inode, children: Vec::new() };
        for source in sources {
            let name = source_name(source)?;
            let md = fs::symlink_metadata(source).map_err(|e| ImageError::io(e, source))?;
            let child = if md.is_dir() {
                self.scan_dir(source, name)?
            } else {
                match self.register_leaf(source, name, &md) {
                    Some(entry) => entry,
                    None => continue,
                }
            };
            add_child(&mut root, child);
        }
        let mut tree = Tree { root, inodes: self.inodes };
        tree.finish_dir_links();
        Ok(tree)
    }

    fn push_inode(&mut self, info: InodeInfo) -> InodeId {
        self.inodes.push(info);
        self.inodes.len() - 1
    }

    fn scan_dir(&mut self, root: &Path, name: OsString) -> Result<Entry> {
        let excludes = self.excludes.clone();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| match e.path().strip_prefix(root) {
                Ok(rel) if !rel.as_os_str().is_empty() => !excludes.contains(rel),
                _ => true,
            });

        let mut stack: Vec<OpenDir> = Vec::new();
        let mut finished: Option<Entry> = None;
        for item in walker {
            let entry = match item {
                Ok(entry) => entry,
                Err(err) => {
                    if err.depth() == 0 && stack.is_empty() {
                        let path = root.to_path_buf();
                        let source = err
                            .into_io_error()
                            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "cannot walk source"));
                        return Err(ImageError::io(source, path));
                    }
                    let path = err.path().map(Path::to_path_buf).unwrap_or_default();
                    warn!(path = %path.display(), error = %err, "skipping unreadable entry");
                    // A directory that could not be opened is dropped whole.
                    if stack.len() > 1 && stack.last().is_some_and(|d| d.path == path) {
                        stack.pop();
                    }
                    continue;
                }
            };

            let depth = entry.depth();
            while depth > 0 && stack.len() > depth {
                self.close_top(&mut stack);
            }

            let md = match entry.metadata() {
                Ok(md) => md,
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "cannot stat entry, skipping");
                    continue;
                }
            };

            if depth == 0 || md.is_dir() {
                stack.push(OpenDir {
                    name: if depth == 0 { name.clone() } else { entry.file_name().to_os_string() },
                    path: entry.path().to_path_buf(),
                    meta: EntryMeta::from_metadata(&md),
                    children: Vec::new(),
                });
            } else if let Some(leaf) = self.register_leaf(entry.path(), entry.file_name().to_os_string(), &md) {
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(leaf);
                }
            }
        }

        while !stack.is_empty() {
            if let Some(done) = self.close_top(&mut stack) {
                finished = Some(done);
            }
        }
        let mut root_entry =
            finished.ok_or_else(|| ImageError::io(io::ErrorKind::NotFound.into(), root))?;
        sort_tree(&mut root_entry);
        Ok(root_entry)
    }

    /// Finish the innermost open directory and attach it to its parent.
    /// Returns the entry when it was the outermost one.
    fn close_top(&mut self, stack: &mut Vec<OpenDir>) -> Option<Entry> {
        let dir = stack.pop()?;
        let inode = self.push_inode(InodeInfo::new(FileKind::Directory, dir.meta, dir.path));
        let done = Entry { name: dir.name, inode, children: dir.children };
        match stack.last_mut() {
            Some(parent) => {
                parent.children.push(done);
                None
            }
            None => Some(done),
        }
    }

    /// Register a non-directory. Returns `None` (after a warning) when the
    /// entry cannot be represented.
    fn register_leaf(&mut self, path: &Path, name: OsString, md: &fs::Metadata) -> Option<Entry> {
        let key = (md.dev(), md.ino());
        if let Some(&id) = self.links.get(&key) {
            self.inodes[id].nlink += 1;
            debug!(path = %path.display(), "hard link");
            return Some(Entry { name, inode: id, children: Vec::new() });
        }

        let ft = md.file_type();
        let kind = if ft.is_file() {
            FileKind::Regular
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_block_device() {
            FileKind::BlockDevice
        } else if ft.is_char_device() {
            FileKind::CharDevice
        } else if ft.is_fifo() {
            FileKind::Fifo
        } else if ft.is_socket() {
            FileKind::Socket
        } else {
            warn!(path = %path.display(), "unsupported file type, skipping");
            return None;
        };

        let mut info = InodeInfo::new(kind, EntryMeta::from_metadata(md), path.to_path_buf());
        if kind == FileKind::Symlink {
            match fs::read_link(path) {
                Ok(target) => info.symlink_target = Some(target),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "cannot read symlink, skipping");
                    return None;
                }
            }
        }
        let id = self.push_inode(info);
        self.links.insert(key, id);
        Some(Entry { name, inode: id, children: Vec::new() })
    }
}

fn normalize(p: &Path) -> PathBuf {
    p.components()
        .filter(|c| !matches!(c, std::path::Component::CurDir | std::path::Component::RootDir))
        .collect()
}

fn source_name(source: &Path) -> Result<OsString> {
    if let Some(name) = source.file_name() {
        return Ok(name.to_os_string());
    }
    let canonical = fs::canonicalize(source).map_err(|e| ImageError::io(e, source))?;
    Ok(canonical.file_name().unwrap_or_else(|| OsStr::new("root")).to_os_string())
}

fn synthetic_root_meta() -> EntryMeta {
    // SAFETY: getuid/getgid cannot fail.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    EntryMeta { mode: 0o755, uid, gid, mtime: chrono::Utc::now().timestamp(), size: 0, rdev: 0 }
}

fn sort_tree(entry: &mut Entry) {
    entry.children.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
    for child in &mut entry.children {
        sort_tree(child);
    }
}

/// Add `child` to `dir`, renaming it `name_1`, `name_2`, ... when the name is
/// taken. Returns the name it was added under.
pub fn add_child(dir: &mut Entry, mut child: Entry) -> OsString {
    let taken = |name: &OsStr, dir: &Entry| dir.children.iter().any(|c| c.name == name);
    if taken(&child.name, dir) {
        let base = child.name.clone();
        let mut n = 1;
        loop {
            let mut candidate = base.clone();
            candidate.push(format!("_{n}"));
            if !taken(&candidate, dir) {
                warn!(name = %base.to_string_lossy(), renamed = %candidate.to_string_lossy(), "name collision in root directory");
                child.name = candidate;
                break;
            }
            n += 1;
        }
    }
    let name = child.name.clone();
    let pos = dir
        .children
        .binary_search_by(|c| c.name.as_bytes().cmp(child.name.as_bytes()))
        .unwrap_or_else(|p| p);
    dir.children.insert(pos, child);
    name
}

impl Tree {
    pub fn inode(&self, entry: &Entry) -> &InodeInfo {
        &self.inodes[entry.inode]
    }

    pub fn is_dir(&self, entry: &Entry) -> bool {
        self.inodes[entry.inode].kind == FileKind::Directory
    }

    /// Directory link count: itself, its parent's entry, one per subdirectory.
    pub fn finish_dir_links(&mut self) {
        fn walk(entry: &Entry, inodes: &mut [InodeInfo]) {
            if inodes[entry.inode].kind != FileKind::Directory || inodes[entry.inode].existing {
                return;
            }
            let subdirs = entry
                .children
                .iter()
                .filter(|c| inodes[c.inode].kind == FileKind::Directory)
                .count() as u32;
            inodes[entry.inode].nlink = 2 + subdirs;
            for child in &entry.children {
                walk(child, inodes);
            }
        }
        walk(&self.root, &mut self.inodes);
    }

    /// Visit entries in the order they are encoded: children before their
    /// directory, siblings by name. `f` sees each entry with its parent
    /// directory's inode (or `None` for the root).
    pub fn post_order<F: FnMut(&Entry, Option<InodeId>)>(&self, mut f: F) {
        fn walk<F: FnMut(&Entry, Option<InodeId>)>(tree: &Tree, entry: &Entry, parent: Option<InodeId>, f: &mut F) {
            if tree.is_dir(entry) && !tree.inode(entry).existing {
                for child in &entry.children {
                    walk(tree, child, Some(entry.inode), f);
                }
            }
            f(entry, parent);
        }
        walk(self, &self.root, None, &mut f);
    }

    /// Regular-file inodes that need content, in the order the encoder asks
    /// for them (first path in post-order wins for hard links).
    pub fn content_order(&self) -> Vec<InodeId> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        self.post_order(|entry, _| {
            let info = self.inode(entry);
            if info.kind == FileKind::Regular && !info.existing && seen.insert(entry.inode) {
                out.push(entry.inode);
            }
        });
        out
    }

    /// Assign inode numbers: new directories first (pre-order, root first
    /// unless `root_number` pins it), then new non-directories in encode
    /// order. Returns the highest number handed out.
    pub fn assign_numbers(&mut self, first: u32, root_number: Option<u32>) -> u32 {
        let mut next = first;
        let root = self.root.inode;
        self.inodes[root].number = match root_number {
            Some(n) => n,
            None => {
                next += 1;
                next - 1
            }
        };

        let mut dirs = Vec::new();
        fn collect_dirs(tree: &Tree, entry: &Entry, out: &mut Vec<InodeId>) {
            for child in &entry.children {
                let info = tree.inode(child);
                if info.kind == FileKind::Directory && !info.existing {
                    out.push(child.inode);
                    collect_dirs(tree, child, out);
                }
            }
        }
        collect_dirs(self, &self.root, &mut dirs);
        for id in dirs {
            self.inodes[id].number = next;
            next += 1;
        }

        let mut others = Vec::new();
        let mut seen = HashSet::new();
        self.post_order(|entry, _| {
            let info = self.inode(entry);
            if info.kind != FileKind::Directory && !info.existing && seen.insert(entry.inode) {
                others.push(entry.inode);
            }
        });
        for id in others {
            self.inodes[id].number = next;
            next += 1;
        }
        next - 1
    }

    /// Total bytes and count of regular files that will be read.
    pub fn content_totals(&self) -> (u64, u64) {
        self.content_order()
            .iter()
            .fold((0, 0), |(files, bytes), &id| (files + 1, bytes + self.inodes[id].meta.size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    fn names(entry: &Entry) -> Vec<String> {
        entry.children.iter().map(|c| c.name.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn sorts_children_and_detects_hard_links() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("b")).unwrap();
        fs::write(root.join("b/zeta"), b"z").unwrap();
        fs::write(root.join("a.txt"), b"hello").unwrap();
        fs::hard_link(root.join("a.txt"), root.join("b/alias")).unwrap();
        symlink("a.txt", root.join("c")).unwrap();

        let tree = Scanner::new(&[]).scan(&[root.to_path_buf()]).unwrap();
        assert_eq!(names(&tree.root), ["a.txt", "b", "c"]);
        let b = &tree.root.children[1];
        assert_eq!(names(b), ["alias", "zeta"]);
        assert_eq!(b.children[0].inode, tree.root.children[0].inode);
        assert_eq!(tree.inode(&tree.root.children[0]).nlink, 2);
        assert_eq!(tree.inode(&tree.root.children[2]).symlink_target.as_deref(), Some(Path::new("a.txt")));
        assert_eq!(tree.inode(&tree.root).nlink, 3);
    }

    #[test]
    fn excludes_relative_paths() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("keep/skip")).unwrap();
        fs::write(dir.path().join("keep/skip/x"), b"x").unwrap();
        fs::write(dir.path().join("keep/y"), b"y").unwrap();
        let tree = Scanner::new(&[PathBuf::from("keep/skip")]).scan(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(names(&tree.root.children[0]), ["y"]);
    }

    #[test]
    fn multiple_sources_rename_collisions() {
        let one = tempdir().unwrap();
        let two = tempdir().unwrap();
        fs::create_dir(one.path().join("data")).unwrap();
        fs::create_dir(two.path().join("data")).unwrap();
        fs::write(two.path().join("data/f"), b"f").unwrap();

        let tree = Scanner::new(&[]).scan(&[one.path().join("data"), two.path().join("data")]).unwrap();
        assert_eq!(names(&tree.root), ["data", "data_1"]);
        assert_eq!(names(&tree.root.children[1]), ["f"]);
    }

    #[test]
    fn numbers_directories_before_files() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();
        fs::write(dir.path().join("d/f"), b"1").unwrap();
        fs::write(dir.path().join("g"), b"2").unwrap();
        let mut tree = Scanner::new(&[]).scan(&[dir.path().to_path_buf()]).unwrap();
        let last = tree.assign_numbers(1, None);
        assert_eq!(last, 4);
        assert_eq!(tree.inode(&tree.root).number, 1);
        let d = &tree.root.children[0];
        assert_eq!(tree.inode(d).number, 2);
        assert_eq!(tree.inode(&d.children[0]).number, 3);
        assert_eq!(tree.inode(&tree.root.children[1]).number, 4);
        assert_eq!(tree.content_order().len(), 2);
    }
}
