mod engine;
mod types;

use napi_derive::napi;
use tracing_subscriber::EnvFilter;

/// Install a stderr log subscriber. `filter` uses `RUST_LOG` syntax and
/// defaults to `backfill=info`. Calling it twice is a no-op.
#[napi]
pub fn init_logging(filter: Option<String>) {
    let filter = filter
        .and_then(|f| EnvFilter::try_new(f).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("backfill=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
