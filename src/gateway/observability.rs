use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionCountersSnapshot {
    pub moderation_checked: u64,
    pub moderation_blocked: u64,
    pub moderation_provider_failures: u64,
    pub probe_rejected: u64,
    pub channels_selected: u64,
    pub channel_pool_exhausted: u64,
    pub quota_reserved: u64,
    pub quota_trusted: u64,
    pub quota_rejected: u64,
    pub quota_returned: u64,
    pub reconcile_failures: u64,
    pub webhook_delivered: u64,
    pub webhook_failed: u64,
}

/// Lock-free counters shared by the admission components.
#[derive(Debug, Default)]
pub struct AdmissionCounters {
    moderation_checked: AtomicU64,
    moderation_blocked: AtomicU64,
    moderation_provider_failures: AtomicU64,
    probe_rejected: AtomicU64,
    channels_selected: AtomicU64,
    channel_pool_exhausted: AtomicU64,
    quota_reserved: AtomicU64,
    quota_trusted: AtomicU64,
    quota_rejected: AtomicU64,
    quota_returned: AtomicU64,
    reconcile_failures: AtomicU64,
    webhook_delivered: AtomicU64,
    webhook_failed: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl AdmissionCounters {
    pub fn record_moderation_checked(&self) {
        bump(&self.moderation_checked);
    }

    pub fn record_moderation_blocked(&self) {
        bump(&self.moderation_blocked);
    }

    pub fn record_moderation_provider_failure(&self) {
        bump(&self.moderation_provider_failures);
    }

    pub fn record_probe_rejected(&self) {
        bump(&self.probe_rejected);
    }

    pub fn record_channel_selected(&self) {
        bump(&self.channels_selected);
    }

    pub fn record_channel_pool_exhausted(&self) {
        bump(&self.channel_pool_exhausted);
    }

    pub fn record_quota_reserved(&self) {
        bump(&self.quota_reserved);
    }

    pub fn record_quota_trusted(&self) {
        bump(&self.quota_trusted);
    }

    pub fn record_quota_rejected(&self) {
        bump(&self.quota_rejected);
    }

    pub fn record_quota_returned(&self) {
        bump(&self.quota_returned);
    }

    pub fn record_reconcile_failure(&self) {
        bump(&self.reconcile_failures);
    }

    pub fn record_webhook_delivered(&self) {
        bump(&self.webhook_delivered);
    }

    pub fn record_webhook_failed(&self) {
        bump(&self.webhook_failed);
    }

    pub fn snapshot(&self) -> AdmissionCountersSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        AdmissionCountersSnapshot {
            moderation_checked: load(&self.moderation_checked),
            moderation_blocked: load(&self.moderation_blocked),
            moderation_provider_failures: load(&self.moderation_provider_failures),
            probe_rejected: load(&self.probe_rejected),
            channels_selected: load(&self.channels_selected),
            channel_pool_exhausted: load(&self.channel_pool_exhausted),
            quota_reserved: load(&self.quota_reserved),
            quota_trusted: load(&self.quota_trusted),
            quota_rejected: load(&self.quota_rejected),
            quota_returned: load(&self.quota_returned),
            reconcile_failures: load(&self.reconcile_failures),
            webhook_delivered: load(&self.webhook_delivered),
            webhook_failed: load(&self.webhook_failed),
        }
    }
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

fn fmt_layer<S>(json_logs: bool) -> Box<dyn tracing_subscriber::Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    }
}

/// Installs the global subscriber: `RUST_LOG`-style filter (default `info`)
/// and a plain or JSON fmt layer.
pub fn init_tracing(json_logs: bool) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer(json_logs))
        .try_init()?;
    Ok(())
}

#[cfg(feature = "otel")]
pub use otel::{OtelGuard, init_tracing_with_otel};

#[cfg(feature = "otel")]
mod otel {
    use opentelemetry::global;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::SpanExporter;
    use opentelemetry_otlp::WithExportConfig as _;
    use opentelemetry_sdk::Resource;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    #[derive(Debug)]
    pub struct OtelGuard {
        provider: opentelemetry_sdk::trace::SdkTracerProvider,
    }

    impl Drop for OtelGuard {
        fn drop(&mut self) {
            let _ = self.provider.shutdown();
        }
    }

    /// Like [`super::init_tracing`], plus an OTLP/HTTP span exporter.
    pub fn init_tracing_with_otel(
        service_name: &str,
        endpoint: Option<&str>,
        json_logs: bool,
    ) -> Result<OtelGuard, Box<dyn std::error::Error>> {
        let mut exporter = SpanExporter::builder().with_http();
        if let Some(endpoint) = endpoint {
            exporter = exporter.with_endpoint(endpoint.to_string());
        }
        let exporter = exporter.build()?;

        let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(
                Resource::builder_empty()
                    .with_service_name(service_name.to_string())
                    .build(),
            )
            .build();
        global::set_tracer_provider(provider.clone());

        let tracer = provider.tracer(service_name.to_string());
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        tracing_subscriber::registry()
            .with(super::env_filter())
            .with(super::fmt_layer(json_logs))
            .with(otel_layer)
            .try_init()?;

        Ok(OtelGuard { provider })
    }
}
