//! Process wide `tracing` setup.

use std::io;
use std::io::IsTerminal;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::util::TryInitError;

/// Installs the global subscriber.
///
/// Events go to stderr, stdout is reserved for command output such as a
/// catalog printed by `scan`. The level defaults to `info` and is overridden
/// through `RUST_LOG`.
pub fn init() -> Result<(), TryInitError> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let stderr_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_target(true)
        .with_filter(env_filter);

    registry().with(stderr_layer).try_init()
}
