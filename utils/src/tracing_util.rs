//! Helpers related to tracing, used by entrypoints.

/// Initialize tracing for a mup entrypoint.
///
/// Events go to stderr, compact and without timestamps (imports run in
/// terminals or under supervisors that already stamp lines). `RUST_LOG`
/// overrides the `warn` default, so `RUST_LOG=mup_lib=debug` turns on
/// import tracing alone.
pub fn initialize_tracing() {
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}
