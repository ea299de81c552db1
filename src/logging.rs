/// Installs the JSON tracing subscriber for standalone binaries.
///
/// Filtering comes from `RESCOPE_LOG` (default `rescope=info,sqlx=warn`).
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let _ = tracing_log::LogTracer::init();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RESCOPE_LOG").unwrap_or_else(|_| "rescope=info,sqlx=warn".into()),
        )
        .json()
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .try_init();
}
