use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber. `RUST_LOG` overrides the default of
/// `energy_analytics=info`.
pub fn init_tracing() {
    let filter = EnvFilter::from_default_env()
        .add_directive("energy_analytics=info".parse().unwrap_or_else(|_| "info".parse().unwrap()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
