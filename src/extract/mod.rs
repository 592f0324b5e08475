//! # Extraction
//!
//! Reading images back: full or selective extraction into a directory,
//! listing and superblock information. All three go through
//! [`ImageReader`], which maps the image and decodes its tables.
//!
//! Extraction runs in three passes. Directories are created first, regular
//! file content is then written in parallel and the remaining entries (hard
//! links, symlinks, device nodes) follow. Directory permissions and times are
//! applied last, deepest first, so writing into a read-only directory works.

mod parallel;
pub mod reader;

use std::collections::HashMap;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use self::parallel::{write_files, FileTask};
pub use self::reader::{Chunk, ImageReader};
use crate::archive::inode::{Inode, InodeBody};
use crate::archive::Superblock;
use crate::common::FileKind;
use crate::error::{ImageError, Result};
use crate::fsx as fs;
use crate::interrupt::Interrupt;

/// Options for [`extract_image`].
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Directory the image contents are written into.
    pub dest: PathBuf,
    /// Paths inside the image to extract; empty extracts everything.
    pub paths: Vec<PathBuf>,
    /// Restore owners. Only takes effect when running as root.
    pub preserve_owner: bool,
    /// Write into a non-empty destination, replacing existing entries.
    pub force: bool,
    /// Writer threads; 0 picks the number of cores.
    pub workers: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        ExtractOptions { dest: PathBuf::from("."), paths: Vec::new(), preserve_owner: true, force: false, workers: 0 }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractSummary {
    pub entries: u64,
    pub files: u64,
    pub bytes: u64,
    pub hard_links: u64,
    /// Entries that could not be created and were skipped.
    pub skipped: u64,
    pub elapsed: Duration,
}

/// One entry to create, with its path relative to the destination.
struct Planned {
    path: PathBuf,
    inode: Inode,
}

/// Extract `image` according to `options`.
pub fn extract_image(image: &Path, options: &ExtractOptions, interrupt: &Interrupt) -> Result<ExtractSummary> {
    let started = Instant::now();
    let reader = ImageReader::open(image)?;
    prepare_dest(&options.dest, options.force)?;
    let plan = plan(&reader, &options.paths)?;
    let owners = options.preserve_owner && fs::is_root();
    debug!(entries = plan.len(), owners, dest = %options.dest.display(), "extracting");

    let mut summary = ExtractSummary { entries: plan.len() as u64, ..Default::default() };
    let dest = &options.dest;

    for entry in plan.iter().filter(|e| e.inode.kind == FileKind::Directory) {
        let target = dest.join(&entry.path);
        if !target.as_os_str().is_empty() {
            replace_non_dir(&target, options.force)?;
            fs::create_dir_all(&target).map_err(|e| ImageError::io(e, &target))?;
        }
    }
    interrupt.check()?;

    // The first path of every regular inode gets the content, later paths
    // become hard links to it.
    let mut first_path: HashMap<u32, PathBuf> = HashMap::new();
    let mut files = Vec::new();
    let mut links = Vec::new();
    for entry in plan.iter().filter(|e| e.inode.kind == FileKind::Regular) {
        let target = dest.join(&entry.path);
        match first_path.get(&entry.inode.number) {
            Some(original) => links.push((original.clone(), target)),
            None => {
                first_path.insert(entry.inode.number, target.clone());
                files.push(FileTask { path: target, inode: &entry.inode });
            }
        }
    }
    for task in &files {
        replace_non_dir(&task.path, options.force)?;
    }
    let written = write_files(&reader, &files, owners, options.workers, interrupt)?;
    summary.files = files.len() as u64;
    summary.bytes = written;

    for (original, link) in links {
        interrupt.check()?;
        replace_non_dir(&link, options.force)?;
        fs::hard_link(&original, &link).map_err(|e| ImageError::io(e, &link))?;
        summary.hard_links += 1;
    }

    for entry in plan.iter().filter(|e| !matches!(e.inode.kind, FileKind::Directory | FileKind::Regular)) {
        interrupt.check()?;
        let target = dest.join(&entry.path);
        replace_non_dir(&target, options.force)?;
        if let Err(e) = create_special(&reader, &target, &entry.inode, owners) {
            warn!(path = %target.display(), error = %e, "could not create entry, skipping");
            summary.skipped += 1;
        }
    }

    for entry in plan.iter().rev().filter(|e| e.inode.kind == FileKind::Directory) {
        let target = dest.join(&entry.path);
        apply_attributes(&reader, &target, &entry.inode, owners)?;
    }

    summary.elapsed = started.elapsed();
    info!(
        image = %image.display(),
        entries = summary.entries,
        files = summary.files,
        bytes = summary.bytes,
        "extraction finished"
    );
    Ok(summary)
}

/// Refuse to write into a non-empty destination unless forced.
fn prepare_dest(dest: &Path, force: bool) -> Result<()> {
    match fs::read_dir(dest) {
        Ok(mut entries) => {
            if entries.next().is_some() && !force {
                return Err(ImageError::InvalidOptions(format!(
                    "destination {} is not empty (use --force to overwrite)",
                    dest.display()
                )));
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(dest).map_err(|e| ImageError::io(e, dest)),
        Err(e) => Err(ImageError::io(e, dest)),
    }
}

/// Remove whatever non-directory sits at `path` so a new entry can take
/// its place.
fn replace_non_dir(path: &Path, force: bool) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(md) if md.is_dir() => Ok(()),
        Ok(_) if force => fs::remove_file(path).map_err(|e| ImageError::io(e, path)),
        Ok(_) => Err(ImageError::io(io::ErrorKind::AlreadyExists.into(), path)),
        Err(_) => Ok(()),
    }
}

/// Every entry to extract, in pre-order. Selected paths keep their path
/// relative to the image root; their parent directories are planned too.
fn plan(reader: &ImageReader, paths: &[PathBuf]) -> Result<Vec<Planned>> {
    let root = reader.root()?;
    let mut out = vec![Planned { path: PathBuf::new(), inode: root.clone() }];
    if paths.is_empty() {
        reader.walk(&root, Path::new(""), |path, _, inode| {
            out.push(Planned { path: path.to_path_buf(), inode: inode.clone() });
            Ok(())
        })?;
        return Ok(out);
    }

    let mut planned = std::collections::HashSet::new();
    for requested in paths {
        let relative: PathBuf = requested
            .components()
            .filter(|c| !matches!(c, std::path::Component::RootDir | std::path::Component::CurDir))
            .collect();
        let inode = reader
            .resolve(&relative)?
            .ok_or_else(|| ImageError::InvalidOptions(format!("{} is not in the image", requested.display())))?;

        // Parents up to the selected entry.
        let mut prefix = PathBuf::new();
        let mut parent = root.clone();
        let components: Vec<_> = relative.components().collect();
        for component in components.iter().take(components.len().saturating_sub(1)) {
            prefix.push(component);
            let entry = reader
                .lookup_child(&parent, component.as_os_str().as_bytes())?
                .ok_or_else(|| ImageError::corrupt(format!("{} vanished while resolving", prefix.display())))?;
            parent = reader.inode(entry.inode)?;
            if planned.insert(prefix.clone()) {
                out.push(Planned { path: prefix.clone(), inode: parent.clone() });
            }
        }

        if relative.as_os_str().is_empty() {
            reader.walk(&inode, Path::new(""), |path, _, child| {
                if planned.insert(path.to_path_buf()) {
                    out.push(Planned { path: path.to_path_buf(), inode: child.clone() });
                }
                Ok(())
            })?;
            continue;
        }
        if planned.insert(relative.clone()) {
            out.push(Planned { path: relative.clone(), inode: inode.clone() });
        }
        if inode.kind == FileKind::Directory {
            reader.walk(&inode, &relative, |path, _, child| {
                if planned.insert(path.to_path_buf()) {
                    out.push(Planned { path: path.to_path_buf(), inode: child.clone() });
                }
                Ok(())
            })?;
        }
    }
    Ok(out)
}

fn create_special(reader: &ImageReader, path: &Path, inode: &Inode, owners: bool) -> Result<()> {
    let io = |e| ImageError::io(e, path);
    match &inode.body {
        InodeBody::Symlink(target) => std::os::unix::fs::symlink(target, path).map_err(io)?,
        InodeBody::Device { major, minor } => {
            fs::mknod(path, inode.st_mode(), fs::makedev(*major, *minor)).map_err(io)?
        }
        InodeBody::Ipc if inode.kind == FileKind::Fifo => fs::mkfifo(path, inode.mode).map_err(io)?,
        InodeBody::Ipc => fs::mknod(path, inode.st_mode(), 0).map_err(io)?,
        InodeBody::Dir(_) | InodeBody::File(_) => {
            return Err(ImageError::Other(format!("{} is not a special file", path.display()).into()))
        }
    }
    apply_attributes(reader, path, inode, owners)
}

/// Owner, permissions and modification time, in that order (chown clears
/// setuid bits). Symlinks only get owner and time.
pub(crate) fn apply_attributes(reader: &ImageReader, path: &Path, inode: &Inode, owners: bool) -> Result<()> {
    let io = |e| ImageError::io(e, path);
    if owners {
        fs::lchown(path, reader.uid(inode)?, reader.gid(inode)?).map_err(io)?;
    }
    if inode.kind != FileKind::Symlink {
        fs::set_unix_permissions(path, inode.mode).map_err(io)?;
    }
    fs::set_mtime(path, inode.mtime).map_err(io)
}

/// One row of an image listing.
#[derive(Debug, Clone, Serialize)]
pub struct ListedEntry {
    pub path: PathBuf,
    pub kind: FileKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: i64,
    pub number: u32,
    pub nlink: u32,
    pub target: Option<PathBuf>,
}

impl ListedEntry {
    /// `ls -l` style line.
    pub fn long_line(&self) -> String {
        let mut perms = String::with_capacity(10);
        perms.push(self.kind.type_char());
        for shift in [6, 3, 0] {
            let bits = (self.mode >> shift) & 7;
            perms.push(if bits & 4 != 0 { 'r' } else { '-' });
            perms.push(if bits & 2 != 0 { 'w' } else { '-' });
            perms.push(if bits & 1 != 0 { 'x' } else { '-' });
        }
        let time = chrono::DateTime::from_timestamp(self.mtime, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| self.mtime.to_string());
        let mut line = format!(
            "{perms} {:>3} {:>5}/{:<5} {:>12} {time} {}",
            self.nlink,
            self.uid,
            self.gid,
            self.size,
            self.path.display()
        );
        if let Some(target) = &self.target {
            line.push_str(" -> ");
            line.push_str(&target.to_string_lossy());
        }
        line
    }
}

/// Every entry in the image, in pre-order.
pub fn list_image(image: &Path) -> Result<Vec<ListedEntry>> {
    let reader = ImageReader::open(image)?;
    let root = reader.root()?;
    let mut out = Vec::new();
    reader.walk(&root, Path::new(""), |path, _, inode| {
        out.push(ListedEntry {
            path: path.to_path_buf(),
            kind: inode.kind,
            mode: inode.mode,
            uid: reader.uid(inode)?,
            gid: reader.gid(inode)?,
            size: inode.as_file().map_or(0, |f| f.size),
            mtime: inode.mtime,
            number: inode.number,
            nlink: inode.nlink,
            target: match &inode.body {
                InodeBody::Symlink(target) => Some(target.clone()),
                _ => None,
            },
        });
        Ok(())
    })?;
    Ok(out)
}

/// The image's superblock.
pub fn image_info(image: &Path) -> Result<Superblock> {
    Ok(ImageReader::open(image)?.superblock().clone())
}
