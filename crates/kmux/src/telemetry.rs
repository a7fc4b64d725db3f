//! Console + rotating-file logging setup, in the vein of the original
//! backend's telemetry module, minus the OpenTelemetry export this binary
//! has no use for.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Holds the non-blocking file writer alive for the process lifetime; drop
/// it last so buffered log lines get flushed.
pub struct TelemetryGuard {
    _file_guard: Option<WorkerGuard>,
}

pub fn init_tracing(verbose: bool) -> TelemetryGuard {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("kmux={default_level},kmux_core={default_level}")));

    let (file_layer, file_guard) = match dirs::home_dir() {
        Some(home) => {
            let log_dir = home.join(".kmux");
            match std::fs::create_dir_all(&log_dir) {
                Ok(()) => {
                    let appender = tracing_appender::rolling::never(&log_dir, "kmux.log");
                    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                    let layer = tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false);
                    (Some(layer), Some(guard))
                }
                Err(e) => {
                    eprintln!("warning: could not create ~/.kmux for file logging: {e}");
                    (None, None)
                }
            }
        }
        None => (None, None),
    };

    // The server talks MCP over stdio; writing log lines to stdout would
    // interleave with the JSON-RPC stream, so the console layer goes to stderr.
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr);

    let _ = Registry::default().with(filter).with(file_layer).with(fmt_layer).try_init();

    TelemetryGuard { _file_guard: file_guard }
}
