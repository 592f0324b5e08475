mod common;

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use blitzfs::common::SUPERBLOCK_SIZE;
use blitzfs::compress::{BuildOptions, CompressionAlgo};
use blitzfs::extract::ImageReader;
use common::*;
use tempfile::tempdir;

#[test]
fn duplicate_and_hard_linked_small_files_store_one_body() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src");
    let body = random_bytes(42, 500);
    write(&src.join("a/foo.txt"), &body);
    write(&src.join("a/bar.txt"), &body);
    fs::create_dir_all(src.join("b")).unwrap();
    fs::hard_link(src.join("a/foo.txt"), src.join("b/link")).unwrap();
    let image = dir.path().join("image");

    let opts = BuildOptions { algo: CompressionAlgo::None, ..options(4096) };
    let summary = build(&[src], &image, &opts);
    assert_eq!(summary.files, 2);
    assert_eq!(summary.duplicates, 1);

    let reader = ImageReader::open(&image).unwrap();
    let sb = reader.superblock();
    // root, a, b, foo/link, bar
    assert_eq!(sb.inode_count, 5);
    assert_eq!(reader.fragments().len(), 1);
    assert_eq!(reader.fragments()[0].size.on_disk(), 500);
    assert_eq!(sb.inode_table_start - SUPERBLOCK_SIZE, 500);

    let foo = reader.resolve(Path::new("a/foo.txt")).unwrap().unwrap();
    let bar = reader.resolve(Path::new("a/bar.txt")).unwrap().unwrap();
    let link = reader.resolve(Path::new("b/link")).unwrap().unwrap();
    assert_eq!(foo.number, link.number);
    assert_ne!(foo.number, bar.number);
    assert_eq!(foo.nlink, 2);
    assert_eq!(foo.as_file().unwrap().fragment, bar.as_file().unwrap().fragment);
    assert_eq!(reader.read_file(bar.as_file().unwrap()).unwrap(), body);

    let out = dir.path().join("out");
    let extracted = extract(&image, &out);
    assert_eq!(extracted.hard_links, 1);
    let foo_md = fs::metadata(out.join("a/foo.txt")).unwrap();
    let link_md = fs::metadata(out.join("b/link")).unwrap();
    let bar_md = fs::metadata(out.join("a/bar.txt")).unwrap();
    assert_eq!(foo_md.ino(), link_md.ino());
    assert_ne!(foo_md.ino(), bar_md.ino());
    assert_eq!(fs::read(out.join("b/link")).unwrap(), body);
    assert_eq!(fs::read(out.join("a/bar.txt")).unwrap(), body);
}

#[test]
fn duplicate_large_files_share_blocks() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src");
    let content = random_bytes(7, 5 * 4096 + 123);
    write(&src.join("one"), &content);
    write(&src.join("two"), &content);
    let mut almost = content.clone();
    almost[3 * 4096] ^= 1;
    write(&src.join("three"), &almost);
    let image = dir.path().join("image");

    let summary = build(&[src.clone()], &image, &options(4096));
    assert_eq!(summary.duplicates, 1);
    let reader = ImageReader::open(&image).unwrap();
    let one = reader.resolve(Path::new("one")).unwrap().unwrap();
    let two = reader.resolve(Path::new("two")).unwrap().unwrap();
    let three = reader.resolve(Path::new("three")).unwrap().unwrap();
    let (one, two, three) = (one.as_file().unwrap(), two.as_file().unwrap(), three.as_file().unwrap());
    assert_eq!(one.start, two.start);
    assert_eq!(one.blocks, two.blocks);
    assert_ne!(one.start, three.start);
    assert_eq!(reader.read_file(two).unwrap(), content);
    assert_eq!(reader.read_file(three).unwrap(), almost);

    let plain = dir.path().join("plain");
    let summary = build(&[src], &plain, &BuildOptions { dedup: false, ..options(4096) });
    assert_eq!(summary.duplicates, 0);
    assert!(fs::metadata(&plain).unwrap().len() >= fs::metadata(&image).unwrap().len());
    let reader = ImageReader::open(&plain).unwrap();
    let one = reader.resolve(Path::new("one")).unwrap().unwrap();
    let two = reader.resolve(Path::new("two")).unwrap().unwrap();
    assert_ne!(one.as_file().unwrap().start, two.as_file().unwrap().start);
}

#[test]
fn same_size_different_tails_are_not_merged() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src");
    write(&src.join("left"), &[1u8; 700]);
    write(&src.join("right"), &[2u8; 700]);
    let image = dir.path().join("image");

    let summary = build(&[src], &image, &options(4096));
    assert_eq!(summary.duplicates, 0);
    let reader = ImageReader::open(&image).unwrap();
    let left = reader.resolve(Path::new("left")).unwrap().unwrap();
    let right = reader.resolve(Path::new("right")).unwrap().unwrap();
    assert_ne!(left.as_file().unwrap().fragment, right.as_file().unwrap().fragment);
    assert_eq!(reader.read_file(right.as_file().unwrap()).unwrap(), vec![2u8; 700]);
}

#[test]
fn inode_numbers_are_dense_and_exported() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src");
    write(&src.join("d/e/f"), b"f");
    write(&src.join("g"), b"g");
    fs::hard_link(src.join("g"), src.join("d/h")).unwrap();
    let image = dir.path().join("image");
    build(&[src], &image, &options(4096));

    let reader = ImageReader::open(&image).unwrap();
    let count = reader.superblock().inode_count;
    let lookup = reader.lookup_table().expect("exportable by default");
    assert_eq!(lookup.len(), count as usize);
    for number in 1..=count {
        let inode = reader.inode_by_number(number).unwrap().expect("every number is used");
        assert_eq!(inode.number, number);
    }
    assert_eq!(reader.root().unwrap().number, 1);
}
