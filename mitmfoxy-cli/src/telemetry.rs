use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Initialize stdout logging.
///
/// Verbosity comes from `RUST_LOG` (default: `info`).
pub fn init_telemetry() -> Result<()> {
    let fmt_layer = fmt::layer().with_target(false).with_level(true);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    Registry::default().with(filter).with(fmt_layer).init();

    Ok(())
}
