use std::sync::atomic::{AtomicU64, Ordering};

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry_sdk::metrics::SdkMeterProvider;

/// Installs a global meter provider backed by a prometheus registry and
/// returns the registry. The registry must be kept alive for the sink to
/// keep collecting.
pub fn init_provider() -> prometheus::Registry {
    let registry = prometheus::Registry::new();

    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build();

    let mut provider = SdkMeterProvider::builder();
    if let Ok(exporter) = exporter {
        provider = provider.with_reader(exporter);
    }
    global::set_meter_provider(provider.build());

    registry
}

/// Instruments recorded by the admission core. Safe to record from any
/// thread; the SDK aggregates per instrument.
#[derive(Clone)]
pub struct GatewayMetrics {
    pub incoming_external_requests: Counter<u64>,
    pub external_requests_instant_rps: Histogram<f64>,
    pub inflight_external_requests: Histogram<u64>,
    pub pending_external_requests: Histogram<u64>,
    pub message_delay_us: Histogram<u64>,
    pub processing_time_us: Histogram<u64>,
    pub dispatch_delay_us: Histogram<u64>,
    pub input_use_shm: Counter<u64>,
    pub output_use_shm: Counter<u64>,
    pub discarded_func_calls: Counter<u64>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let meter = global::meter("faasgate");
        Self {
            incoming_external_requests: meter
                .u64_counter("incoming_external_requests")
                .with_description("External invocations accepted at ingress")
                .build(),
            external_requests_instant_rps: meter
                .f64_histogram("external_requests_instant_rps")
                .with_description("Instantaneous external request rate from inter-arrival gaps")
                .build(),
            inflight_external_requests: meter
                .u64_histogram("inflight_external_requests")
                .with_description("Live external call contexts sampled at admission")
                .build(),
            pending_external_requests: meter
                .u64_histogram("pending_external_requests")
                .with_description("Admitted calls waiting for dispatch capacity")
                .build(),
            message_delay_us: meter
                .u64_histogram("message_delay_us")
                .with_description("IPC message flight time in microseconds")
                .build(),
            processing_time_us: meter
                .u64_histogram("processing_time_us")
                .with_description("Worker-reported processing time in microseconds")
                .build(),
            dispatch_delay_us: meter
                .u64_histogram("dispatch_delay_us")
                .with_description("Worker-reported dispatch delay in microseconds")
                .build(),
            input_use_shm: meter
                .u64_counter("input_use_shm")
                .with_description("Invocations whose input went through shared memory")
                .build(),
            output_use_shm: meter
                .u64_counter("output_use_shm")
                .with_description("Completions whose output went through shared memory")
                .build(),
            discarded_func_calls: meter
                .u64_counter("discarded_func_calls")
                .with_description("Calls discarded because their worker vanished")
                .build(),
        }
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Atomic bookkeeping of external call outcomes. Together with the table
/// sizes these satisfy: incoming == completed + failed + dispatch_failed
/// + running + pending whenever the admission lock is released.
#[derive(Default)]
pub struct CallCounters {
    pub incoming: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub dispatch_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallCounterSnapshot {
    pub incoming: u64,
    pub completed: u64,
    pub failed: u64,
    pub dispatch_failed: u64,
}

impl CallCounters {
    pub fn snapshot(&self) -> CallCounterSnapshot {
        CallCounterSnapshot {
            incoming: self.incoming.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dispatch_failed: self.dispatch_failed.load(Ordering::Relaxed),
        }
    }
}
