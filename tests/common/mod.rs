#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use blitzfs::build::{build_image, BuildSummary};
use blitzfs::compress::{BuildOptions, CompressionAlgo};
use blitzfs::extract::{extract_image, ExtractOptions, ExtractSummary};
use blitzfs::interrupt::Interrupt;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Small blocks so that modest test files span several of them.
pub fn options(block_size: u32) -> BuildOptions {
    BuildOptions { block_size, algo: CompressionAlgo::Zstd { level: 3 }, workers: 2, ..Default::default() }
}

pub fn build(sources: &[PathBuf], image: &Path, options: &BuildOptions) -> BuildSummary {
    build_image(sources, image, options, &Interrupt::new()).expect("build failed")
}

pub fn extract(image: &Path, dest: &Path) -> ExtractSummary {
    let options = ExtractOptions { dest: dest.to_path_buf(), workers: 2, ..Default::default() };
    extract_image(image, &options, &Interrupt::new()).expect("extract failed")
}

pub fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill(&mut data[..]);
    data
}

/// Text-like content that compresses well.
pub fn text_bytes(len: usize) -> Vec<u8> {
    b"the quick brown fox jumps over the lazy dog\n".iter().copied().cycle().take(len).collect()
}

pub fn write(path: &Path, data: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, data).unwrap();
}

/// Every path below `root`, relative and sorted.
pub fn tree_paths(root: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .map(|e| e.unwrap().path().strip_prefix(root).unwrap().to_path_buf())
        .collect();
    out.sort();
    out
}
