/// Builds the process-wide tracing subscriber: an `EnvFilter` honouring
/// `RUST_LOG`, falling back to info level for this crate's dependents and
/// warn for everything else, plus a plain formatting layer.
pub fn init() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "dupescan_worker=info,dupescan_phases=info,dupescan_core=info,dupescan_providers=info,warn"
            .into()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
