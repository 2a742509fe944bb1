use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{
        counter::Counter,
        family::Family,
        gauge::Gauge,
        histogram::{exponential_buckets, Histogram},
    },
    registry::Registry,
};

use crate::models::StageType;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StageLabels {
    pub stage: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DeferLabels {
    pub stage: String,
    pub reason: String,
}

fn stage(stage_type: StageType) -> StageLabels {
    StageLabels { stage: stage_type.as_str().to_ascii_lowercase() }
}

fn duration_histogram() -> Histogram {
    Histogram::new(exponential_buckets(0.1, 2.0, 12))
}

/// Batch runner collectors. Each instance owns its own registry, so separate
/// runners (and tests) never share counters.
#[derive(Clone)]
pub struct BatchMetrics {
    pub registry: Arc<Mutex<Registry>>,

    pub runs_started: Family<StageLabels, Counter>,
    pub runs_succeeded: Family<StageLabels, Counter>,
    pub runs_failed: Family<StageLabels, Counter>,
    pub runs_deferred: Family<DeferLabels, Counter>,

    pub units_processed: Family<StageLabels, Counter>,
    pub units_failed: Family<StageLabels, Counter>,
    pub retries: Family<StageLabels, Counter>,

    pub last_position: Family<StageLabels, Gauge>,
    pub run_duration: Family<StageLabels, Histogram>,
}

impl Default for BatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("bento_etl");

        let runs_started = Family::<StageLabels, Counter>::default();
        registry.register("batch_runs_started", "Runs that acquired their stage lock", runs_started.clone());

        let runs_succeeded = Family::<StageLabels, Counter>::default();
        registry.register(
            "batch_runs_succeeded",
            "Runs that reached SUCCESS or COMPLETED",
            runs_succeeded.clone(),
        );

        let runs_failed = Family::<StageLabels, Counter>::default();
        registry.register("batch_runs_failed", "Runs that ended FAILED", runs_failed.clone());

        let runs_deferred = Family::<DeferLabels, Counter>::default();
        registry.register(
            "batch_runs_deferred",
            "Invocations that deferred without touching state",
            runs_deferred.clone(),
        );

        let units_processed = Family::<StageLabels, Counter>::default();
        registry.register("batch_units_processed", "Work units persisted", units_processed.clone());

        let units_failed = Family::<StageLabels, Counter>::default();
        registry.register("batch_units_failed", "Work units that failed", units_failed.clone());

        let retries = Family::<StageLabels, Counter>::default();
        registry.register("batch_retries", "Retries of transient faults", retries.clone());

        let last_position = Family::<StageLabels, Gauge>::default();
        registry.register(
            "batch_last_position",
            "Last position persisted by the stage",
            last_position.clone(),
        );

        let run_duration = Family::<StageLabels, Histogram>::new_with_constructor(
            duration_histogram as fn() -> Histogram,
        );
        registry.register(
            "batch_run_duration_seconds",
            "Wall-clock duration of finished runs",
            run_duration.clone(),
        );

        Self {
            registry: Arc::new(Mutex::new(registry)),
            runs_started,
            runs_succeeded,
            runs_failed,
            runs_deferred,
            units_processed,
            units_failed,
            retries,
            last_position,
            run_duration,
        }
    }

    pub fn run_started(&self, stage_type: StageType) {
        self.runs_started.get_or_create(&stage(stage_type)).inc();
    }

    pub fn run_finished(&self, stage_type: StageType, success: bool, duration_seconds: f64) {
        let labels = stage(stage_type);
        if success {
            self.runs_succeeded.get_or_create(&labels).inc();
        } else {
            self.runs_failed.get_or_create(&labels).inc();
        }
        self.run_duration.get_or_create(&labels).observe(duration_seconds);
    }

    pub fn run_deferred(&self, stage_type: StageType, reason: &str) {
        let labels = DeferLabels { stage: stage(stage_type).stage, reason: reason.to_string() };
        self.runs_deferred.get_or_create(&labels).inc();
    }

    pub fn record_group(&self, stage_type: StageType, processed: usize, failed: usize, position: i64) {
        let labels = stage(stage_type);
        self.units_processed.get_or_create(&labels).inc_by(processed as u64);
        self.units_failed.get_or_create(&labels).inc_by(failed as u64);
        self.last_position.get_or_create(&labels).set(position);
    }

    pub fn record_retries(&self, stage_type: StageType, retries: u32) {
        if retries > 0 {
            self.retries.get_or_create(&stage(stage_type)).inc_by(retries as u64);
        }
    }

    /// Encode metrics in Prometheus text format.
    pub fn encode_metrics(&self) -> Result<String> {
        let registry = self.registry.lock().map_err(|_| anyhow!("Failed to lock registry"))?;
        let mut buffer = String::new();
        encode(&mut buffer, &registry)?;
        Ok(buffer)
    }
}
