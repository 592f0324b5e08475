//! Main entry point for the blitzfs CLI app

fn main() -> std::process::ExitCode {
    blitzfs::cli_runner::run_cli_app()
}
