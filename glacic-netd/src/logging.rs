//! `tracing` subscriber setup, grounded on `gnosis_vpn-lib::logging`'s
//! file-backed `fmt::Layer` behind a `reload::Handle` so SIGHUP can swap
//! in a freshly-opened file after external log rotation.

use std::fs::OpenOptions;
use std::path::Path;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

pub type FileFmtLayer =
    fmt::Layer<tracing_subscriber::Registry, fmt::format::DefaultFields, fmt::format::Format, BoxMakeWriter>;

pub type LogReloadHandle = reload::Handle<FileFmtLayer, tracing_subscriber::Registry>;

const DEFAULT_LOG_FILTER: &str = "info";

pub fn make_file_fmt_layer(log_path: &str) -> std::io::Result<FileFmtLayer> {
    let file = OpenOptions::new().create(true).append(true).open(log_path)?;
    Ok(fmt::layer().with_writer(BoxMakeWriter::new(file)).with_ansi(false))
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Initializes logging to `log_path`, returning a handle that
/// [`reload_log_file`] can use to reopen the file after rotation.
pub fn setup_log_file(log_path: &Path) -> std::io::Result<LogReloadHandle> {
    let (reload_layer, handle) = reload::Layer::new(make_file_fmt_layer(&log_path.to_string_lossy())?);
    tracing_subscriber::registry().with(reload_layer).with(filter()).init();
    Ok(handle)
}

/// Initializes logging to stdout; used when no `--log-file` is given.
pub fn setup_stdout() {
    tracing_subscriber::registry().with(fmt::layer()).with(filter()).init();
}

/// Reopens `log_path` (e.g. after an external log rotator renamed the old
/// file) and swaps the new layer into the running subscriber.
pub fn reload_log_file(handle: &LogReloadHandle, log_path: &Path) -> std::io::Result<()> {
    let layer = make_file_fmt_layer(&log_path.to_string_lossy())?;
    handle.reload(layer).map_err(std::io::Error::other)
}
