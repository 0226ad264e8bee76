use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Install a console subscriber honouring `RUST_LOG`.
///
/// Falls back to `info` globally and `debug` for this crate. Calling it twice
/// is harmless: the second install is rejected and ignored.
pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let filter = EnvFilter::new("info");
        match "kinetik=debug".parse() {
            Ok(directive) => filter.add_directive(directive),
            Err(_) => filter,
        }
    });

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_span_events(FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_names(true),
        )
        .try_init();

    if result.is_ok() {
        tracing::debug!("logging initialized");
    }
}

/// Subscriber for tests: captured output, `warn` unless `RUST_LOG` says otherwise.
pub fn init_test_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}
