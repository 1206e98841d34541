use lumen::TRACE_TARGET_SCRIPT;
use tracing::Level;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the fmt subscriber. `RUST_LOG` overrides the `info` default;
/// script output stays on unless filtered by target.
pub fn init_tracing() -> anyhow::Result<()> {
    let envfilter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env()?
        .add_directive(format!("{TRACE_TARGET_SCRIPT}=debug").parse()?)
        .add_directive("tower_http=info".parse()?);

    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::Layer::default()
                .with_target(true)
                .with_filter(envfilter),
        )
        .try_init()?;
    Ok(())
}
