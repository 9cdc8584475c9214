use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{MeterProvider, MeterProviderBuilder};
use tracing_subscriber::{EnvFilter, prelude::*};

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("{level},hyper=warn,rustls=warn")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_names(true);

    // Ignore a subscriber installed earlier, e.g. by a test harness
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

/// Register the process-wide meter provider the attack instruments report to
pub fn init_metrics() -> MeterProvider {
    let provider = MeterProviderBuilder::default()
        .with_resource(Resource::new(vec![
            KeyValue::new("service.name", "arquebus"),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]))
        .build();

    global::set_meter_provider(provider.clone());
    provider
}

/// Flush and stop the meter provider
pub fn shutdown_metrics(provider: &MeterProvider) {
    if let Err(e) = provider.shutdown() {
        tracing::warn!("Failed to shut down meter provider: {}", e);
    }
}
