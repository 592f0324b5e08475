mod common;

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use blitzfs::compress::{BuildOptions, CompressionAlgo};
use blitzfs::extract::{extract_image, ExtractOptions, ImageReader};
use blitzfs::interrupt::Interrupt;
use blitzfs::ImageError;
use common::*;
use tempfile::tempdir;

const MTIME: i64 = 1_600_000_000;

fn set_mode(path: &Path, mode: u32) {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

/// A tree with files around every block boundary, nested directories,
/// a symlink, an empty file and an empty directory.
fn populate(src: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let files: Vec<(PathBuf, Vec<u8>)> = vec![
        ("empty".into(), Vec::new()),
        ("one".into(), b"x".to_vec()),
        ("docs/almost_block".into(), random_bytes(1, 4095)),
        ("docs/block".into(), random_bytes(2, 4096)),
        ("docs/block_plus_one".into(), text_bytes(4097)),
        ("docs/deep/nested/several".into(), random_bytes(3, 3 * 4096 + 17)),
        ("docs/deep/text".into(), text_bytes(50_000)),
    ];
    for (path, data) in &files {
        write(&src.join(path), data);
    }
    fs::create_dir_all(src.join("void")).unwrap();
    std::os::unix::fs::symlink("docs/block", src.join("shortcut")).unwrap();
    set_mode(&src.join("one"), 0o755);
    set_mode(&src.join("docs/block"), 0o600);
    set_mode(&src.join("void"), 0o711);

    for entry in walkdir::WalkDir::new(src).contents_first(true) {
        let entry = entry.unwrap();
        blitzfs::fsx::set_mtime(entry.path(), MTIME).unwrap();
    }
    files
}

#[test]
fn round_trip_keeps_content_names_modes_and_times() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src");
    fs::create_dir(&src).unwrap();
    let files = populate(&src);
    let image = dir.path().join("image.bfs");
    let out = dir.path().join("out");

    let summary = build(&[src.clone()], &image, &options(4096));
    assert_eq!(summary.files, files.len() as u64);
    assert_eq!(summary.failed, 0);
    assert_eq!(fs::metadata(&image).unwrap().len() % 4096, 0);

    extract(&image, &out);
    assert_eq!(tree_paths(&out), tree_paths(&src));
    for (path, data) in &files {
        assert_eq!(&fs::read(out.join(path)).unwrap(), data, "content of {}", path.display());
    }
    for path in tree_paths(&src) {
        let a = fs::symlink_metadata(src.join(&path)).unwrap();
        let b = fs::symlink_metadata(out.join(&path)).unwrap();
        assert_eq!(a.file_type(), b.file_type(), "type of {}", path.display());
        if !a.file_type().is_symlink() {
            assert_eq!(a.mode() & 0o7777, b.mode() & 0o7777, "mode of {}", path.display());
        }
        assert_eq!(b.mtime(), MTIME, "mtime of {}", path.display());
    }
    assert_eq!(fs::read_link(out.join("shortcut")).unwrap(), PathBuf::from("docs/block"));
}

#[test]
fn every_codec_and_raw_metadata_round_trips() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src");
    fs::create_dir(&src).unwrap();
    let files = populate(&src);

    let variants = [
        BuildOptions { algo: CompressionAlgo::Lzma { preset: 1 }, ..options(4096) },
        BuildOptions { algo: CompressionAlgo::None, ..options(8192) },
        BuildOptions { compress_inodes: false, compress_fragments: false, ..options(4096) },
        BuildOptions { fragments: false, dedup: false, exportable: false, ..options(4096) },
    ];
    for (i, opts) in variants.iter().enumerate() {
        let image = dir.path().join(format!("image{i}"));
        let out = dir.path().join(format!("out{i}"));
        build(&[src.clone()], &image, opts);
        extract(&image, &out);
        for (path, data) in &files {
            assert_eq!(&fs::read(out.join(path)).unwrap(), data, "variant {i}: {}", path.display());
        }
        let reader = ImageReader::open(&image).unwrap();
        assert_eq!(reader.lookup_table().is_some(), opts.exportable, "variant {i}");
    }
}

#[test]
fn sparse_blocks_take_no_space_and_read_back_as_zeros() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src");
    fs::create_dir(&src).unwrap();
    let mut data = vec![0u8; 6 * 4096];
    data[2 * 4096..3 * 4096].copy_from_slice(&random_bytes(9, 4096));
    write(&src.join("holes"), &data);
    let image = dir.path().join("image");

    build(&[src], &image, &options(4096));
    let reader = ImageReader::open(&image).unwrap();
    let inode = reader.resolve(Path::new("holes")).unwrap().unwrap();
    let file = inode.as_file().unwrap();
    assert_eq!(file.blocks.len(), 6);
    assert_eq!(file.sparse, 5 * 4096);
    assert_eq!(file.stored_len(), file.blocks[2].on_disk() as u64);
    assert_eq!(reader.read_file(file).unwrap(), data);

    let out = dir.path().join("out");
    extract(&image, &out);
    assert_eq!(fs::read(out.join("holes")).unwrap(), data);
}

#[test]
fn tails_go_to_fragments_only_for_small_files_unless_forced() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src");
    fs::create_dir(&src).unwrap();
    write(&src.join("small"), &random_bytes(4, 1000));
    write(&src.join("large"), &random_bytes(5, 2 * 4096 + 300));

    let image = dir.path().join("default");
    build(&[src.clone()], &image, &options(4096));
    let reader = ImageReader::open(&image).unwrap();
    let small = reader.resolve(Path::new("small")).unwrap().unwrap();
    let small = small.as_file().unwrap();
    assert!(small.blocks.is_empty());
    assert_eq!(small.fragment.size, 1000);
    let large = reader.resolve(Path::new("large")).unwrap().unwrap();
    let large = large.as_file().unwrap();
    assert_eq!(large.blocks.len(), 3);
    assert!(large.fragment.is_none());

    let image = dir.path().join("always");
    build(&[src], &image, &BuildOptions { always_fragments: true, ..options(4096) });
    let reader = ImageReader::open(&image).unwrap();
    let large = reader.resolve(Path::new("large")).unwrap().unwrap();
    let large = large.as_file().unwrap();
    assert_eq!(large.blocks.len(), 2);
    assert_eq!(large.fragment.size, 300);
    // Every fragment entry holds no more than one block of tails.
    assert!(reader.fragments().iter().all(|f| f.size.on_disk() <= 4096));
    assert_eq!(reader.read_file(large).unwrap(), random_bytes(5, 2 * 4096 + 300));
}

#[test]
fn large_directory_is_indexed_and_searchable() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src");
    fs::create_dir(&src).unwrap();
    let names: Vec<String> = (0..700).map(|i| format!("entry-with-a-fairly-long-name-{i:05}")).collect();
    for (i, name) in names.iter().enumerate() {
        write(&src.join(name), format!("{i}").as_bytes());
    }
    let image = dir.path().join("image");
    build(&[src], &image, &options(4096));

    let reader = ImageReader::open(&image).unwrap();
    let root = reader.root().unwrap();
    assert!(!root.as_dir().unwrap().index.is_empty());
    assert_eq!(reader.read_dir(&root).unwrap().len(), names.len());
    for (i, name) in names.iter().enumerate().step_by(37) {
        let entry = reader.lookup_child(&root, name.as_bytes()).unwrap().expect("name is listed");
        let inode = reader.inode(entry.inode).unwrap();
        assert_eq!(reader.read_file(inode.as_file().unwrap()).unwrap(), format!("{i}").into_bytes());
    }
    assert!(reader.lookup_child(&root, b"entry-with-a-fairly-long-name-99999").unwrap().is_none());
    assert!(reader.lookup_child(&root, b"a").unwrap().is_none());
}

#[test]
fn selected_paths_bring_their_parents() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src");
    fs::create_dir(&src).unwrap();
    write(&src.join("a/b/keep.txt"), b"keep");
    write(&src.join("a/b/also/inner"), b"inner");
    write(&src.join("a/skip.txt"), b"skip");
    write(&src.join("other"), b"other");
    let image = dir.path().join("image");
    build(&[src], &image, &options(4096));

    let out = dir.path().join("out");
    let options = ExtractOptions {
        dest: out.clone(),
        paths: vec![PathBuf::from("a/b/keep.txt"), PathBuf::from("/a/b/also")],
        ..Default::default()
    };
    extract_image(&image, &options, &Interrupt::new()).unwrap();
    let expected: Vec<PathBuf> =
        ["a", "a/b", "a/b/also", "a/b/also/inner", "a/b/keep.txt"].iter().map(PathBuf::from).collect();
    assert_eq!(tree_paths(&out), expected);

    let missing = ExtractOptions { dest: dir.path().join("out2"), paths: vec!["nope".into()], ..Default::default() };
    assert!(extract_image(&image, &missing, &Interrupt::new()).is_err());
}

#[test]
fn crafted_parent_name_is_refused_on_extract() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src");
    write(&src.join("abcd"), b"payload");
    write(&src.join("keep"), b"keep");
    let image = dir.path().join("image");
    build(&[src], &image, &BuildOptions { compress_inodes: false, ..options(4096) });

    let (start, end) = {
        let reader = ImageReader::open(&image).unwrap();
        let sb = reader.superblock();
        (sb.directory_table_start as usize, sb.directory_table_end as usize)
    };
    let mut bytes = fs::read(&image).unwrap();
    let at = bytes[start..end].windows(4).position(|w| w == b"abcd").expect("name is stored raw") + start;
    bytes[at..at + 4].copy_from_slice(b"../z");
    fs::write(&image, &bytes).unwrap();

    let out = dir.path().join("out");
    let options = ExtractOptions { dest: out.join("inner"), ..Default::default() };
    let err = extract_image(&image, &options, &Interrupt::new()).unwrap_err();
    assert!(matches!(err, ImageError::Corrupt(_)), "{err}");
    assert!(!out.join("z").exists());

    let reader = ImageReader::open(&image).unwrap();
    assert!(reader.read_dir(&reader.root().unwrap()).is_err());
}

#[test]
fn force_replaces_existing_files() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src");
    write(&src.join("f"), b"from image");
    let image = dir.path().join("image");
    build(&[src], &image, &options(4096));

    let out = dir.path().join("out");
    write(&out.join("f"), b"stale");
    let plain = ExtractOptions { dest: out.clone(), ..Default::default() };
    assert!(extract_image(&image, &plain, &Interrupt::new()).is_err());
    let forced = ExtractOptions { force: true, ..plain };
    extract_image(&image, &forced, &Interrupt::new()).unwrap();
    assert_eq!(fs::read(out.join("f")).unwrap(), b"from image");
}

#[test]
fn several_sources_share_a_synthetic_root() {
    let dir = tempdir().unwrap();
    write(&dir.path().join("one/x"), b"1");
    write(&dir.path().join("two/x"), b"2");
    write(&dir.path().join("loose"), b"3");
    let image = dir.path().join("image");
    let sources = ["one", "two", "loose"].map(|n| dir.path().join(n));
    build(&sources, &image, &options(4096));

    let out = dir.path().join("out");
    extract(&image, &out);
    assert_eq!(fs::read(out.join("one/x")).unwrap(), b"1");
    assert_eq!(fs::read(out.join("two/x")).unwrap(), b"2");
    assert_eq!(fs::read(out.join("loose")).unwrap(), b"3");
}

#[test]
fn empty_tree_round_trips() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src");
    fs::create_dir(&src).unwrap();
    for (i, opts) in [options(4096), BuildOptions { compress_inodes: false, ..options(4096) }].iter().enumerate() {
        let image = dir.path().join(format!("image{i}"));
        let summary = build(&[src.clone()], &image, opts);
        assert_eq!(summary.inode_count, 1);

        let reader = ImageReader::open(&image).unwrap();
        let root = reader.root().unwrap();
        assert!(reader.read_dir(&root).unwrap().is_empty());
        assert!(reader.lookup_child(&root, b"anything").unwrap().is_none());
        let mut visited = 0;
        reader
            .walk(&root, Path::new(""), |_, _, _| {
                visited += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(visited, 0);

        let out = dir.path().join(format!("out{i}"));
        extract(&image, &out);
        assert!(out.is_dir());
        assert!(tree_paths(&out).is_empty());
    }
}

/// Same sources, several builds: only the superblock's build time may differ.
fn assert_builds_match(src: &Path, dir: &Path, variants: &[BuildOptions]) {
    let images: Vec<Vec<u8>> = variants
        .iter()
        .enumerate()
        .map(|(i, opts)| {
            let image = dir.join(format!("repeat{i}"));
            build(&[src.to_path_buf()], &image, opts);
            fs::read(&image).unwrap()
        })
        .collect();
    for (i, image) in images.iter().enumerate().skip(1) {
        assert_eq!(images[0].len(), image.len(), "build {i}");
        let first_difference = images[0][128..].iter().zip(&image[128..]).position(|(a, b)| a != b);
        assert_eq!(first_difference, None, "build {i} differs after the superblock");
    }
}

#[test]
fn repeated_single_worker_builds_are_identical() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src");
    for i in 0..40u64 {
        write(&src.join(format!("f{i:02}")), &random_bytes(200 + i, 700 + 1300 * i as usize));
    }
    let opts = BuildOptions { workers: 1, ..options(4096) };
    assert_builds_match(&src, dir.path(), &[opts.clone(), opts.clone(), opts.clone(), opts]);
}

#[test]
fn worker_count_does_not_change_the_image() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src");
    fs::create_dir(&src).unwrap();
    populate(&src);
    for i in 0..40 {
        write(&src.join(format!("bulk/{i:02}")), &random_bytes(100 + i, 1500 * i as usize));
    }
    write(&src.join("bulk/dup"), &random_bytes(110, 15_000));

    let single = dir.path().join("single");
    let many = dir.path().join("many");
    build(&[src.clone()], &single, &BuildOptions { workers: 1, ..options(4096) });
    build(&[src], &many, &BuildOptions { workers: 6, ..options(4096) });

    let a = fs::read(&single).unwrap();
    let b = fs::read(&many).unwrap();
    assert_eq!(a.len(), b.len());
    // The superblock carries the build time; everything after it must match.
    assert!(a[128..] == b[128..], "images differ");
}

#[test]
fn unreadable_file_is_skipped() {
    if blitzfs::fsx::is_root() {
        return;
    }
    let dir = tempdir().unwrap();
    let src = dir.path().join("src");
    write(&src.join("fine"), b"fine");
    write(&src.join("secret"), &random_bytes(6, 9000));
    set_mode(&src.join("secret"), 0o000);
    let image = dir.path().join("image");

    let summary = build(&[src.clone()], &image, &options(4096));
    set_mode(&src.join("secret"), 0o600);
    assert_eq!(summary.failed, 1);
    let reader = ImageReader::open(&image).unwrap();
    assert!(reader.resolve(Path::new("secret")).unwrap().is_none());
    let fine = reader.resolve(Path::new("fine")).unwrap().unwrap();
    assert_eq!(reader.read_file(fine.as_file().unwrap()).unwrap(), b"fine");
}
