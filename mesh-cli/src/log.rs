use anyhow::{Context, Result};
use simplelog::{ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};

/// Sets up terminal logging for the CLI: info-and-above on stderr, with a
/// local timestamp, matching the teacher app's conventions without its
/// per-file log splitting (a one-shot CLI has no frontend/backend split).
pub fn setup_logger() -> Result<()> {
    let config = ConfigBuilder::new()
        .set_time_offset_to_local()
        .unwrap()
        .build();

    let logger = TermLogger::new(
        LevelFilter::Info,
        config,
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );

    CombinedLogger::init(vec![logger]).context("failed to install logger")
}
