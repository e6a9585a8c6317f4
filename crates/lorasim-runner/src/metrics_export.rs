//! In-memory `metrics` recorder and JSON export.
//!
//! Entities record through the `metrics` facade with names from
//! [`lorasim_common::metric_defs`]. Installing an [`InMemoryRecorder`]
//! collects every series; a [`MetricsSnapshot`] totals each metric, splits
//! counters by their extra labels (`mtype`, `kind`) and breaks everything
//! down per `node`.

use crate::RunnerError;
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Label that attributes a series to a device, gateway or server.
const NODE_LABEL: &str = "node";

// ============================================================================
// Snapshot Types
// ============================================================================

/// Metric values of one node.
#[derive(Debug, Default, Clone, Serialize)]
pub struct NodeMetrics {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub gauges: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Unit and help text registered for a metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDescription {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
    pub description: String,
}

/// Everything the recorder holds at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Counters summed over every label set.
    pub counters: BTreeMap<String, u64>,
    /// Counters summed per value of their non-node labels, e.g.
    /// `lorasim.device.tx_packets` by `mtype=join_request`.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub counter_breakdown: BTreeMap<String, BTreeMap<String, u64>>,
    /// Gauges summed over nodes.
    pub gauges: BTreeMap<String, f64>,
    /// Histograms merged over every label set.
    pub histograms: BTreeMap<String, HistogramSummary>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<String, NodeMetrics>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub descriptions: BTreeMap<String, MetricDescription>,
}

/// Summary statistics for a histogram metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

/// Export metrics as pretty JSON followed by a newline.
pub fn export_json<W: Write>(snapshot: &MetricsSnapshot, writer: &mut W) -> std::io::Result<()> {
    serde_json::to_writer_pretty(&mut *writer, snapshot)?;
    writeln!(writer)?;
    Ok(())
}

// ============================================================================
// Series State
// ============================================================================

#[derive(Debug, Default)]
struct CounterCell(AtomicU64);

impl CounterCell {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn store(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// f64 kept as its bit pattern.
#[derive(Debug, Default)]
struct GaugeCell(AtomicU64);

impl GaugeCell {
    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    fn add(&self, delta: f64) {
        let _ = self.0.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
            Some((f64::from_bits(bits) + delta).to_bits())
        });
    }

    fn value(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Samples kept per histogram series for percentiles.
const RESERVOIR_CAPACITY: usize = 10_000;

/// Exact count/sum/min/max plus a uniform sample reservoir.
#[derive(Debug)]
struct Reservoir {
    samples: Vec<f64>,
    seen: u64,
    sum: f64,
    min: f64,
    max: f64,
    /// xorshift64 state choosing which sample a late value replaces.
    state: u64,
}

impl Default for Reservoir {
    fn default() -> Self {
        Reservoir {
            samples: Vec::new(),
            seen: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            state: 0x9E37_79B9_7F4A_7C15,
        }
    }
}

impl Reservoir {
    fn push(&mut self, value: f64) {
        self.seen += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        if self.samples.len() < RESERVOIR_CAPACITY {
            self.samples.push(value);
            return;
        }
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        let slot = (self.state % self.seen) as usize;
        if slot < RESERVOIR_CAPACITY {
            self.samples[slot] = value;
        }
    }

    fn summary(&self) -> HistogramSummary {
        if self.seen == 0 {
            return HistogramSummary::default();
        }
        HistogramSummary {
            count: self.seen,
            sum: self.sum,
            min: self.min,
            max: self.max,
            mean: self.sum / self.seen as f64,
            ..percentiles(&self.samples)
        }
    }
}

#[derive(Debug, Default)]
struct HistogramCell(Mutex<Reservoir>);

/// Summary of raw samples; used when merging series of one metric.
fn percentiles(samples: &[f64]) -> HistogramSummary {
    if samples.is_empty() {
        return HistogramSummary::default();
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let last = sorted.len() - 1;
    let at = |p: f64| sorted[((p * last as f64).round() as usize).min(last)];
    let sum: f64 = sorted.iter().sum();
    HistogramSummary {
        count: sorted.len() as u64,
        sum,
        min: sorted[0],
        max: sorted[last],
        mean: sum / sorted.len() as f64,
        p50: at(0.50),
        p90: at(0.90),
        p99: at(0.99),
    }
}

/// Labels of a series, parsed once at registration.
#[derive(Debug, Clone)]
struct SeriesLabels {
    name: String,
    node: Option<String>,
    /// Remaining labels as `k=v,k=v`, if any.
    extra: Option<String>,
}

impl SeriesLabels {
    fn from_key(key: &Key) -> Self {
        let mut node = None;
        let mut extra = Vec::new();
        for label in key.labels() {
            if label.key() == NODE_LABEL {
                node = Some(label.value().to_string());
            } else {
                extra.push(format!("{}={}", label.key(), label.value()));
            }
        }
        SeriesLabels {
            name: key.name().to_string(),
            node,
            extra: (!extra.is_empty()).then(|| extra.join(",")),
        }
    }
}

struct Series<T> {
    labels: SeriesLabels,
    cell: Arc<T>,
}

/// Series of one instrument type, keyed by `name{k=v,...}`.
type SeriesMap<T> = RwLock<BTreeMap<String, Series<T>>>;

fn series_id(key: &Key) -> String {
    let labels: Vec<String> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
    format!("{}{{{}}}", key.name(), labels.join(","))
}

fn register<T: Default>(map: &SeriesMap<T>, key: &Key) -> Arc<T> {
    let id = series_id(key);
    if let Some(series) = map.read().get(&id) {
        return series.cell.clone();
    }
    map.write()
        .entry(id)
        .or_insert_with(|| Series {
            labels: SeriesLabels::from_key(key),
            cell: Arc::default(),
        })
        .cell
        .clone()
}

#[derive(Default)]
struct RecorderState {
    counters: SeriesMap<CounterCell>,
    gauges: SeriesMap<GaugeCell>,
    histograms: SeriesMap<HistogramCell>,
    descriptions: RwLock<BTreeMap<String, MetricDescription>>,
}

impl RecorderState {
    fn describe(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        self.descriptions.write().insert(
            key.as_str().to_string(),
            MetricDescription {
                unit: unit.map(|u| u.as_str()),
                description: String::from(&*description),
            },
        );
    }

    /// Zero every series; handles stay registered.
    fn reset(&self) {
        for series in self.counters.read().values() {
            series.cell.store(0);
        }
        for series in self.gauges.read().values() {
            series.cell.store(0.0);
        }
        for series in self.histograms.read().values() {
            *series.cell.0.lock() = Reservoir::default();
        }
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot {
            counters: BTreeMap::new(),
            counter_breakdown: BTreeMap::new(),
            gauges: BTreeMap::new(),
            histograms: BTreeMap::new(),
            nodes: BTreeMap::new(),
            descriptions: self.descriptions.read().clone(),
        };

        for series in self.counters.read().values() {
            let SeriesLabels { name, node, extra } = &series.labels;
            let value = series.cell.value();
            *snapshot.counters.entry(name.clone()).or_default() += value;
            if let Some(extra) = extra {
                *snapshot
                    .counter_breakdown
                    .entry(name.clone())
                    .or_default()
                    .entry(extra.clone())
                    .or_default() += value;
            }
            if let Some(node) = node {
                *snapshot
                    .nodes
                    .entry(node.clone())
                    .or_default()
                    .counters
                    .entry(name.clone())
                    .or_default() += value;
            }
        }

        for series in self.gauges.read().values() {
            let SeriesLabels { name, node, .. } = &series.labels;
            let value = series.cell.value();
            *snapshot.gauges.entry(name.clone()).or_default() += value;
            if let Some(node) = node {
                *snapshot
                    .nodes
                    .entry(node.clone())
                    .or_default()
                    .gauges
                    .entry(name.clone())
                    .or_default() += value;
            }
        }

        let mut merged: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for series in self.histograms.read().values() {
            let SeriesLabels { name, node, .. } = &series.labels;
            let reservoir = series.cell.0.lock();
            merged.entry(name.clone()).or_default().extend_from_slice(&reservoir.samples);
            if let Some(node) = node {
                snapshot
                    .nodes
                    .entry(node.clone())
                    .or_default()
                    .histograms
                    .insert(name.clone(), reservoir.summary());
            }
        }
        snapshot.histograms = merged.into_iter().map(|(name, samples)| (name, percentiles(&samples))).collect();
        snapshot
    }
}

/// Recorder that keeps every metric in memory until snapshotted.
#[derive(Clone, Default)]
pub struct InMemoryRecorder {
    state: Arc<RecorderState>,
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current values of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.state.snapshot()
    }

    /// Reset all values, e.g. after a warm-up period.
    pub fn clear(&self) {
        self.state.reset();
    }
}

/// Install a fresh [`InMemoryRecorder`] as the global `metrics` recorder
/// and register the simulator's metric descriptions.
///
/// Only one global recorder can exist per process.
pub fn install_recorder() -> Result<Arc<InMemoryRecorder>, RunnerError> {
    let recorder = Arc::new(InMemoryRecorder::new());
    metrics::set_global_recorder(recorder.clone())
        .map_err(|e| RunnerError::ConfigError(format!("metrics recorder: {}", e)))?;
    lorasim_common::metric_defs::describe_all();
    Ok(recorder)
}

// ============================================================================
// metrics trait glue
// ============================================================================

struct CounterHandle(Arc<CounterCell>);

impl metrics::CounterFn for CounterHandle {
    fn increment(&self, value: u64) {
        self.0.add(value);
    }

    fn absolute(&self, value: u64) {
        self.0.store(value);
    }
}

struct GaugeHandle(Arc<GaugeCell>);

impl metrics::GaugeFn for GaugeHandle {
    fn increment(&self, value: f64) {
        self.0.add(value);
    }

    fn decrement(&self, value: f64) {
        self.0.add(-value);
    }

    fn set(&self, value: f64) {
        self.0.store(value);
    }
}

struct HistogramHandle(Arc<HistogramCell>);

impl metrics::HistogramFn for HistogramHandle {
    fn record(&self, value: f64) {
        self.0 .0.lock().push(value);
    }
}

impl Recorder for InMemoryRecorder {
    fn describe_counter(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        self.state.describe(key, unit, description);
    }

    fn describe_gauge(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        self.state.describe(key, unit, description);
    }

    fn describe_histogram(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        self.state.describe(key, unit, description);
    }

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(Arc::new(CounterHandle(register(&self.state.counters, key))))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(Arc::new(GaugeHandle(register(&self.state.gauges, key))))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(Arc::new(HistogramHandle(register(&self.state.histograms, key))))
    }
}
