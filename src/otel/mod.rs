//! OpenTelemetry integration for member-sync
//!
//! This module provides observability through OpenTelemetry, including
//! tracing, metrics, and optional export to OTLP endpoints.

use crate::config::{LoggingConfig, OtelConfig};
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter, MeterProvider as _},
    trace::TracerProvider as TracerProviderTrait,
    KeyValue,
};
use opentelemetry_sdk::{metrics::SdkMeterProvider, trace::TracerProvider, Resource};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// OpenTelemetry error types
#[derive(Debug, Error)]
pub enum OtelError {
    /// Failed to initialize tracer
    #[error("Failed to initialize tracer: {0}")]
    TracerInit(String),

    /// Failed to initialize meter
    #[error("Failed to initialize meter: {0}")]
    MeterInit(String),

    /// Failed to shutdown
    #[error("Failed to shutdown: {0}")]
    Shutdown(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// OpenTelemetry provider for member-sync
///
/// Manages tracing and metrics providers with OTLP export capability.
pub struct OtelProvider {
    tracer_provider: Option<TracerProvider>,
    meter_provider: SdkMeterProvider,
    config: OtelConfig,
}

impl OtelProvider {
    /// Create a new OtelProvider with the given configuration
    pub fn new(config: &OtelConfig) -> Result<Self, OtelError> {
        let resource = Resource::new(vec![KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]);

        let (tracer_provider, meter_provider) = if config.enabled {
            let endpoint = config.endpoint.as_ref().ok_or_else(|| {
                OtelError::Config("OTLP endpoint is required when enabled".into())
            })?;

            let tracer_provider = Self::init_tracer_provider(endpoint, &resource)?;
            let meter_provider = Self::init_meter_provider(endpoint, &resource)?;

            (Some(tracer_provider), meter_provider)
        } else {
            // No reader, nothing is exported
            let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
            (None, meter_provider)
        };

        if let Some(ref tp) = tracer_provider {
            global::set_tracer_provider(tp.clone());
        }

        Ok(Self {
            tracer_provider,
            meter_provider,
            config: config.clone(),
        })
    }

    fn init_tracer_provider(
        endpoint: &str,
        resource: &Resource,
    ) -> Result<TracerProvider, OtelError> {
        use opentelemetry_otlp::WithExportConfig;
        use opentelemetry_sdk::runtime;
        use opentelemetry_sdk::trace::{Config, Sampler};

        let exporter = opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(endpoint)
            .build_span_exporter()
            .map_err(|e| OtelError::TracerInit(e.to_string()))?;

        let trace_config = Config::default()
            .with_sampler(Sampler::AlwaysOn)
            .with_resource(resource.clone());

        Ok(TracerProvider::builder()
            .with_batch_exporter(exporter, runtime::Tokio)
            .with_config(trace_config)
            .build())
    }

    fn init_meter_provider(
        endpoint: &str,
        resource: &Resource,
    ) -> Result<SdkMeterProvider, OtelError> {
        use opentelemetry_otlp::{MetricsExporterBuilder, WithExportConfig};
        use opentelemetry_sdk::metrics::reader::{
            DefaultAggregationSelector, DefaultTemporalitySelector,
        };
        use opentelemetry_sdk::{metrics::PeriodicReader, runtime};

        let exporter = MetricsExporterBuilder::from(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .build_metrics_exporter(
            Box::new(DefaultTemporalitySelector::new()),
            Box::new(DefaultAggregationSelector::new()),
        )
        .map_err(|e| OtelError::MeterInit(e.to_string()))?;

        let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();

        Ok(SdkMeterProvider::builder()
            .with_resource(resource.clone())
            .with_reader(reader)
            .build())
    }

    /// Tracer exporting over OTLP, `None` when export is disabled
    pub fn tracer(&self, name: &'static str) -> Option<opentelemetry_sdk::trace::Tracer> {
        self.tracer_provider.as_ref().map(|tp| tp.tracer(name))
    }

    /// Get the meter for creating metrics
    pub fn meter(&self) -> Meter {
        self.meter_provider.meter(self.config.service_name.clone())
    }

    /// Shutdown the OpenTelemetry providers gracefully
    pub fn shutdown(&self) -> Result<(), OtelError> {
        if let Err(e) = self.meter_provider.shutdown() {
            return Err(OtelError::Shutdown(format!(
                "Meter shutdown failed: {:?}",
                e
            )));
        }

        if let Some(ref tp) = self.tracer_provider {
            for result in tp.force_flush() {
                if let Err(e) = result {
                    return Err(OtelError::Shutdown(format!("Tracer flush failed: {:?}", e)));
                }
            }
        }

        Ok(())
    }
}

impl Drop for OtelProvider {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Metrics of the synchronization engine
#[derive(Clone)]
pub struct SyncMetrics {
    /// Jobs launched by the driver
    pub jobs_started: Counter<u64>,

    /// Jobs finished, labelled by outcome
    pub jobs_completed: Counter<u64>,

    /// Ledger rows excluded as invalid
    pub invalid_jobs: Counter<u64>,

    /// Jobs left Pending because their owner has no credential
    pub missing_credentials: Counter<u64>,

    /// Membership rows inserted or deleted, labelled by change
    pub membership_changes: Counter<u64>,

    /// Physical upstream requests
    pub upstream_requests: Counter<u64>,

    /// Waits caused by rate limiting
    pub rate_limit_retries: Counter<u64>,

    /// Reconciliation duration in seconds
    pub job_duration: Histogram<f64>,
}

impl SyncMetrics {
    /// Create new metrics with the given meter
    pub fn new(meter: &Meter) -> Self {
        Self {
            jobs_started: meter
                .u64_counter("member_sync_jobs_started_total")
                .with_description("Number of jobs launched by the driver")
                .init(),
            jobs_completed: meter
                .u64_counter("member_sync_jobs_completed_total")
                .with_description("Number of jobs that reached a terminal status")
                .init(),
            invalid_jobs: meter
                .u64_counter("member_sync_invalid_jobs_total")
                .with_description("Number of claimed rows with inconsistent status and info")
                .init(),
            missing_credentials: meter
                .u64_counter("member_sync_missing_credentials_total")
                .with_description("Number of claims skipped for lack of an access token")
                .init(),
            membership_changes: meter
                .u64_counter("member_sync_membership_changes_total")
                .with_description("Number of membership rows inserted or deleted")
                .init(),
            upstream_requests: meter
                .u64_counter("member_sync_upstream_requests_total")
                .with_description("Number of physical upstream requests")
                .init(),
            rate_limit_retries: meter
                .u64_counter("member_sync_rate_limit_retries_total")
                .with_description("Number of retries after rate limiting")
                .init(),
            job_duration: meter
                .f64_histogram("member_sync_job_duration_seconds")
                .with_description("Reconciliation duration in seconds")
                .init(),
        }
    }

    /// Metrics bound to the global meter, a no-op until a provider is installed
    pub fn global() -> Self {
        Self::new(&global::meter("member-sync"))
    }

    pub fn record_job_started(&self) {
        self.jobs_started.add(1, &[]);
    }

    /// Record a finished job with its outcome and duration
    pub fn record_job_completed(&self, outcome: &str, duration_secs: f64) {
        let attrs = [KeyValue::new("outcome", outcome.to_string())];
        self.jobs_completed.add(1, &attrs);
        self.job_duration.record(duration_secs, &attrs);
    }

    pub fn record_invalid_job(&self) {
        self.invalid_jobs.add(1, &[]);
    }

    pub fn record_missing_credential(&self) {
        self.missing_credentials.add(1, &[]);
    }

    /// Record applied membership changes
    pub fn record_membership_changes(&self, joined: usize, left: usize) {
        self.membership_changes
            .add(joined as u64, &[KeyValue::new("change", "joined")]);
        self.membership_changes
            .add(left as u64, &[KeyValue::new("change", "left")]);
    }

    /// Record one physical upstream request
    pub fn record_upstream_request(&self, method: &str) {
        self.upstream_requests
            .add(1, &[KeyValue::new("method", method.to_string())]);
    }

    pub fn record_rate_limit_retry(&self) {
        self.rate_limit_retries.add(1, &[]);
    }
}

/// Initialize tracing subscriber with OpenTelemetry integration
///
/// `RUST_LOG` takes precedence over `logging.level`.
pub fn init_tracing(otel: &OtelProvider, logging: &LoggingConfig) -> Result<(), OtelError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(logging.level.to_lowercase()))
        .map_err(|e| OtelError::Config(format!("Invalid log level: {}", e)))?;

    let otel_layer = otel
        .tracer("member-sync")
        .map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    let (json_layer, pretty_layer) = if logging.format == "pretty" {
        (None, Some(tracing_subscriber::fmt::layer().pretty()))
    } else {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(otel_layer)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
        .map_err(|e| OtelError::TracerInit(e.to_string()))
}
