//! Command-line driver: logging setup, Ctrl-C handling, progress bar and
//! dispatch of the parsed subcommand to the library.

use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::archive::Superblock;
use crate::build::build_image;
use crate::cli::{self, Args, Commands};
use crate::compress::ProgressFn;
use crate::error::{ImageError, Result};
use crate::extract::{extract_image, image_info, list_image};
use crate::fsx::TerminationSignals;
use crate::interrupt::Interrupt;
use crate::progress::ProgressState;

/// Parse the command line, run it and map the outcome to an exit code.
pub fn run_cli_app() -> ExitCode {
    let args = cli::run();
    init_tracing(&args);

    let interrupt = Interrupt::new();
    if let Err(e) = install_interrupt_handler(&interrupt) {
        warn!(error = %e, "could not install the signal handler");
    }

    match dispatch(args, &interrupt) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Events from `tracing` reach the terminal as `log` records. `BLITZFS_LOG`
/// wins over `RUST_LOG`; without either, `-q`/`-v` pick the level.
fn init_tracing(args: &Args) {
    let default = if args.quiet {
        "warn"
    } else if args.verbose {
        "debug"
    } else {
        "info"
    };
    let filters = std::env::var("BLITZFS_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default.to_string());
    // A logger may already be installed when embedded; that is fine.
    let _ = env_logger::Builder::new()
        .parse_filters(&filters)
        .target(env_logger::Target::Stderr)
        .format_target(false)
        .try_init();
}

/// SIGINT and SIGTERM are taken by a dedicated thread. The first raises the
/// interrupt so the build can roll back; the second exits, after waiting for
/// any append that is still putting the image back. Must run
/// before any other thread is started.
fn install_interrupt_handler(interrupt: &Arc<Interrupt>) -> io::Result<()> {
    let signals = TerminationSignals::new();
    signals.block()?;
    let interrupt = Arc::clone(interrupt);
    thread::Builder::new().name("signals".into()).spawn(move || loop {
        match signals.wait() {
            Ok(_) if interrupt.raise() == 1 => {
                eprintln!("\ninterrupted: cleaning up (press Ctrl-C again to exit immediately)");
            }
            Ok(_) => {
                if interrupt.is_shielded() {
                    eprintln!("appending: exiting once the image is consistent again");
                    interrupt.wait_unshielded();
                }
                std::process::exit(130)
            }
            Err(e) => {
                warn!(error = %e, "stopped waiting for signals");
                return;
            }
        }
    })?;
    Ok(())
}

fn dispatch(args: Args, interrupt: &Arc<Interrupt>) -> Result<()> {
    match args.command {
        Commands::Build(build) => {
            let mut options = build.to_options()?;
            if build.progress {
                options.progress = Some(create_cli_progress_callback(if build.append { "append" } else { "build" }));
            }
            let summary = build_image(&build.sources, &build.output, &options, interrupt)?;
            info!(
                "{}: {} inodes, {} files ({} duplicates, {} skipped), {} read, {} used, {:.2}s",
                summary.output.display(),
                summary.inode_count,
                summary.files,
                summary.duplicates,
                summary.failed,
                human_bytes(summary.bytes_read),
                human_bytes(summary.bytes_used),
                summary.elapsed.as_secs_f64()
            );
        }
        Commands::Extract { image, paths, output, force, no_owner, workers } => {
            let options = cli::extract_options(&paths, &output, force, no_owner, workers);
            let summary = extract_image(&image, &options, interrupt)?;
            info!(
                "{}: {} entries, {} files, {} hard links, {} written, {:.2}s",
                output.display(),
                summary.entries,
                summary.files,
                summary.hard_links,
                human_bytes(summary.bytes),
                summary.elapsed.as_secs_f64()
            );
            if summary.skipped > 0 {
                warn!(skipped = summary.skipped, "some entries could not be created");
            }
        }
        Commands::List { image, long } => {
            let entries = list_image(&image)?;
            let mut out = io::stdout().lock();
            for entry in entries {
                let line = if long { entry.long_line() } else { entry.path.display().to_string() };
                writeln!(out, "{line}").map_err(ImageError::from)?;
            }
        }
        Commands::Info { image, json } => {
            let superblock = image_info(&image)?;
            let text = if json { serde_json::to_string_pretty(&superblock)? } else { describe(&superblock) };
            println!("{text}");
        }
    }
    Ok(())
}

fn describe(sb: &Superblock) -> String {
    let algo = sb.algo().map(|a| a.to_string()).unwrap_or_else(|_| format!("unknown ({})", sb.compressor));
    let created = chrono::DateTime::from_timestamp(sb.mkfs_time, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| sb.mkfs_time.to_string());
    let table = |start: u64| {
        if start == crate::archive::NO_TABLE {
            "absent".to_string()
        } else {
            start.to_string()
        }
    };
    [
        format!("version:          {}.{}", sb.version_major, sb.version_minor),
        format!("created:          {created}"),
        format!("block size:       {}", sb.block_size),
        format!("compressor:       {algo}"),
        format!("flags:            {}", sb.flags.names().join(" ")),
        format!("inodes:           {}", sb.inode_count),
        format!("fragments:        {}", sb.fragment_count),
        format!("uids / gids:      {} / {}", sb.uid_count, sb.gid_count),
        format!("root inode:       {}", sb.root_inode),
        format!("bytes used:       {} ({})", sb.bytes_used, human_bytes(sb.bytes_used)),
        format!("inode table:      {}", sb.inode_table_start),
        format!("directory table:  {}", sb.directory_table_start),
        format!("fragment table:   {}", table(sb.fragment_table_start)),
        format!("lookup table:     {}", table(sb.lookup_table_start)),
        format!("uid table:        {}", table(sb.uid_table_start)),
        format!("gid table:        {}", table(sb.gid_table_start)),
    ]
    .join("\n")
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

// --- progress bar -----------------------------------------------------------

fn create_cli_progress_callback(operation: &str) -> ProgressFn {
    let operation = operation.to_uppercase();
    let last_update = Mutex::new(Instant::now() - Duration::from_secs(1));
    let prev_len = AtomicUsize::new(0);
    let done = AtomicBool::new(false);

    Arc::new(move |state: ProgressState| {
        if done.load(Ordering::Relaxed) {
            return;
        }
        let finished = state.progress_percent >= 100.0;
        // Redraw at most every 100ms, but always show completion.
        if !finished {
            let mut last = match last_update.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if last.elapsed() < Duration::from_millis(100) {
                return;
            }
            *last = Instant::now();
        }

        let term_width = term_size::dimensions().map(|(w, _)| w).unwrap_or(80);
        let eta = state.estimated_time_remaining().as_secs_f32();
        let eta = if state.speed_mbps <= 0.0 {
            "--".to_string()
        } else if eta > 60.0 {
            format!("{:.1}m", eta / 60.0)
        } else {
            format!("{eta:.1}s")
        };
        let line_for = |width: usize| {
            let filled = ((state.progress_percent / 100.0) * width as f32) as usize;
            let bar = format!("[{}{}]", "█".repeat(filled.min(width)), "░".repeat(width - filled.min(width)));
            format!(
                "[{operation}] {bar} {:.1}% | {}/{} files | {} dup | {:.1} MB/s | ETA: {eta}",
                state.progress_percent,
                state.processed_files,
                state.total_files,
                state.duplicate_files,
                state.speed_mbps,
            )
        };
        let mut width = 40;
        let mut line = line_for(width);
        while line.chars().count() > term_width && width > 10 {
            width -= 4;
            line = line_for(width);
        }

        let len = line.chars().count();
        let prev = prev_len.swap(len, Ordering::Relaxed);
        if prev > len {
            line.push_str(&" ".repeat(prev - len));
        }
        eprint!("\r\x1B[2K{line}");
        io::stderr().flush().ok();

        if finished {
            eprintln!();
            done.store(true, Ordering::Relaxed);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_bytes_picks_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.0 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024 + 512 * 1024), "5.5 MiB");
    }

    #[test]
    fn describe_marks_absent_tables() {
        let sb = Superblock::new(4096, crate::compress::CompressionAlgo::None, Default::default());
        let text = describe(&sb);
        assert!(text.contains("block size:       4096"));
        assert!(text.contains("lookup table:     absent"));
    }
}
