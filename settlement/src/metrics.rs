//! Prometheus metrics for settlement
//!
//! # Metrics
//!
//! - `mesh_settlements_total{status}` - Settlements by final status
//! - `mesh_reroutes_total` - Path substitutions after a reroutable failure
//! - `mesh_hop_latency_seconds` - Observed hop call latency
//! - `mesh_admission_rejections_total` - Requests shed by admission control
//! - `mesh_circuit_trips_total` - Circuits opened by hop outcomes

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use protocol_core::SettlementStatus;
use std::time::Duration;

/// Metrics collector with its own registry
#[derive(Clone)]
pub struct Metrics {
    /// Settlements by status
    pub settlements_total: IntCounterVec,

    /// Reroutes
    pub reroutes_total: IntCounter,

    /// Hop latency histogram
    pub hop_latency: Histogram,

    /// Admission rejections
    pub admission_rejections: IntCounter,

    /// Circuit trips caused by hop outcomes
    pub circuit_trips: IntCounter,

    registry: Registry,
}

impl Metrics {
    /// Create and register every metric
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let settlements_total = IntCounterVec::new(
            Opts::new("mesh_settlements_total", "Settlements by final status"),
            &["status"],
        )?;
        registry.register(Box::new(settlements_total.clone()))?;

        let reroutes_total = IntCounter::new(
            "mesh_reroutes_total",
            "Path substitutions after a reroutable hop failure",
        )?;
        registry.register(Box::new(reroutes_total.clone()))?;

        let hop_latency = Histogram::with_opts(
            HistogramOpts::new("mesh_hop_latency_seconds", "Observed hop call latency").buckets(
                vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.200, 0.500, 1.0, 5.0, 30.0],
            ),
        )?;
        registry.register(Box::new(hop_latency.clone()))?;

        let admission_rejections = IntCounter::new(
            "mesh_admission_rejections_total",
            "Requests shed by admission control",
        )?;
        registry.register(Box::new(admission_rejections.clone()))?;

        let circuit_trips = IntCounter::new(
            "mesh_circuit_trips_total",
            "Circuits opened by hop outcomes",
        )?;
        registry.register(Box::new(circuit_trips.clone()))?;

        Ok(Self {
            settlements_total,
            reroutes_total,
            hop_latency,
            admission_rejections,
            circuit_trips,
            registry,
        })
    }

    /// Count a settlement that reached `status`
    pub fn record_settlement(&self, status: SettlementStatus) {
        self.settlements_total
            .with_label_values(&[status.as_str()])
            .inc();
    }

    /// Record one hop call's latency
    pub fn observe_hop(&self, latency: Duration) {
        self.hop_latency.observe(latency.as_secs_f64());
    }

    /// Settlements counted under `status`
    pub fn settlements(&self, status: SettlementStatus) -> u64 {
        self.settlements_total
            .with_label_values(&[status.as_str()])
            .get()
    }

    /// Render the registry in the text exposition format
    pub fn gather_text(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
