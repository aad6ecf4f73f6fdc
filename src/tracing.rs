use ::tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::conf;

/// Install the global subscriber. `RUST_LOG`, when set, wins over the
/// configured level.
pub fn init() -> anyhow::Result<()> {
    init_with(conf::global().log_level)
}

pub fn init_with(level: Level) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(level)))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .try_init()?;
    Ok(())
}

fn default_directive(level: Level) -> String {
    // Our own events at the configured level, dependencies one notch quieter.
    let deps = match level {
        Level::TRACE => Level::DEBUG,
        Level::DEBUG => Level::INFO,
        Level::INFO => Level::WARN,
        _ => Level::ERROR,
    };
    format!("{deps},{}={level},tower_http={level}", env!("CARGO_CRATE_NAME"))
}
