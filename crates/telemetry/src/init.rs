use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Initializes the global `tracing` subscriber for structured JSON logging
/// on stderr. The filter comes from `RUST_LOG` when set; the default keeps
/// the storage targets (`pool`, `aux`, `recovery`, `db`, ...) at info.
pub fn init_tracing() -> Result<(), anyhow::Error> {
    let fmt_layer = fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_current_span(false);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_log::LogTracer::init()?;
    tracing::subscriber::set_global_default(Registry::default().with(filter).with(fmt_layer))?;
    Ok(())
}
