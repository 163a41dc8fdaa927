use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// A histogram that tracks the distribution of observed values across buckets.
#[derive(Debug)]
pub struct Histogram {
    pub buckets: Vec<f64>,
    pub counts: Vec<AtomicU64>,
    pub sum: AtomicU64,
    pub count: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with the given bucket boundaries.
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value into the histogram.
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        // The sum is an f64 stored as bits; CAS gives an atomic add.
        loop {
            let current = self.sum.load(Ordering::Relaxed);
            let updated = (f64::from_bits(current) + value).to_bits();
            match self.sum.compare_exchange_weak(
                current,
                updated,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(_) => continue,
            }
        }
        // Buckets hold per-range counts; the export derives the
        // cumulative form. Values above the top boundary only reach
        // `count`.
        for (i, boundary) in self.buckets.iter().enumerate() {
            if value <= *boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    pub fn get_sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Default buckets for subtask durations (in seconds). Worker calls can
/// legitimately run for minutes, so the tail is long.
fn default_duration_buckets() -> Vec<f64> {
    vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]
}

// ---------------------------------------------------------------------------
// Label key for counters
// ---------------------------------------------------------------------------

/// A label set is a sorted list of key=value pairs, used to distinguish
/// counter families.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Format labels as `{key="value",key2="value2"}` for Prometheus output.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// MetricsRegistry
// ---------------------------------------------------------------------------

/// Thread-safe registry of counters, gauges, and histograms.
///
/// Values use atomics; registration of new names takes a write lock,
/// updates to known names only a read lock. There is deliberately no
/// process-global instance: each orchestrator owns its registry, so
/// two orchestrators in one process (say, in tests) never mix numbers.
#[derive(Debug)]
pub struct MetricsRegistry {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    gauges: RwLock<AHashMap<String, AtomicI64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

impl MetricsRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(AHashMap::new()),
            gauges: RwLock::new(AHashMap::new()),
            histograms: RwLock::new(AHashMap::new()),
        }
    }

    // -- Counters -----------------------------------------------------------

    /// Increment a counter by 1.
    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    /// Increment a counter by an arbitrary amount.
    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = self.counters.read().expect("metrics lock poisoned");
            if let Some(c) = map.get(&key) {
                c.fetch_add(amount, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.counters.write().expect("metrics lock poisoned");
        let c = map.entry(key).or_insert_with(|| AtomicU64::new(0));
        c.fetch_add(amount, Ordering::Relaxed);
    }

    /// Get the current value of a counter.
    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        let map = self.counters.read().expect("metrics lock poisoned");
        map.get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Gauges -------------------------------------------------------------

    /// Set a gauge to an absolute value.
    pub fn set_gauge(&self, name: &str, value: i64) {
        {
            let map = self.gauges.read().expect("metrics lock poisoned");
            if let Some(g) = map.get(name) {
                g.store(value, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.gauges.write().expect("metrics lock poisoned");
        let g = map
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0));
        g.store(value, Ordering::Relaxed);
    }

    /// Adjust a gauge by a signed delta.
    pub fn add_gauge(&self, name: &str, delta: i64) {
        {
            let map = self.gauges.read().expect("metrics lock poisoned");
            if let Some(g) = map.get(name) {
                g.fetch_add(delta, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.gauges.write().expect("metrics lock poisoned");
        let g = map
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0));
        g.fetch_add(delta, Ordering::Relaxed);
    }

    /// Get the current value of a gauge.
    pub fn get_gauge(&self, name: &str) -> i64 {
        let map = self.gauges.read().expect("metrics lock poisoned");
        map.get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Histograms ---------------------------------------------------------

    /// Record a value into a histogram. If the histogram does not exist it is
    /// created with default duration buckets.
    pub fn record_histogram(&self, name: &str, value: f64) {
        {
            let map = self.histograms.read().expect("metrics lock poisoned");
            if let Some(h) = map.get(name) {
                h.observe(value);
                return;
            }
        }
        let mut map = self.histograms.write().expect("metrics lock poisoned");
        let h = map
            .entry(name.to_string())
            .or_insert_with(|| Histogram::new(default_duration_buckets()));
        h.observe(value);
    }

    // -- Export --------------------------------------------------------------

    /// Export all metrics in Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = self.counters.read().expect("metrics lock poisoned");
            let mut grouped: AHashMap<&str, Vec<(&Labels, u64)>> = AHashMap::new();
            for ((name, labels), val) in map.iter() {
                let v = val.load(Ordering::Relaxed);
                grouped.entry(name.as_str()).or_default().push((labels, v));
            }
            let mut names: Vec<&&str> = grouped.keys().collect();
            names.sort();
            for name in names {
                out.push_str(&format!("# TYPE {} counter\n", name));
                for (labels, value) in &grouped[name] {
                    out.push_str(&format!("{}{} {}\n", name, labels.prometheus_str(), value));
                }
            }
        }

        {
            let map = self.gauges.read().expect("metrics lock poisoned");
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let val = map[name].load(Ordering::Relaxed);
                out.push_str(&format!("# TYPE {} gauge\n", name));
                out.push_str(&format!("{} {}\n", name, val));
            }
        }

        {
            let map = self.histograms.read().expect("metrics lock poisoned");
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let h = &map[name];
                out.push_str(&format!("# TYPE {} histogram\n", name));
                let mut cumulative = 0u64;
                for (i, boundary) in h.buckets.iter().enumerate() {
                    cumulative += h.counts[i].load(Ordering::Relaxed);
                    out.push_str(&format!(
                        "{}_bucket{{le=\"{}\"}} {}\n",
                        name, boundary, cumulative
                    ));
                }
                out.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, h.get_count()));
                out.push_str(&format!("{}_sum {}\n", name, h.get_sum()));
                out.push_str(&format!("{}_count {}\n", name, h.get_count()));
            }
        }

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments_per_label_set() {
        let m = MetricsRegistry::new();
        m.increment_counter("subtasks_dispatched_total", &[("capability", "implement")]);
        m.increment_counter("subtasks_dispatched_total", &[("capability", "implement")]);
        m.increment_counter("subtasks_dispatched_total", &[("capability", "validate")]);

        assert_eq!(
            m.get_counter("subtasks_dispatched_total", &[("capability", "implement")]),
            2
        );
        assert_eq!(
            m.get_counter("subtasks_dispatched_total", &[("capability", "validate")]),
            1
        );
        assert_eq!(
            m.get_counter("subtasks_dispatched_total", &[("capability", "plan")]),
            0
        );
    }

    #[test]
    fn counter_increment_by_amount() {
        let m = MetricsRegistry::new();
        m.increment_counter_by("attempts_total", &[], 3);
        m.increment_counter_by("attempts_total", &[], 2);
        assert_eq!(m.get_counter("attempts_total", &[]), 5);
    }

    #[test]
    fn gauge_set_and_add() {
        let m = MetricsRegistry::new();
        m.set_gauge("subtasks_in_flight", 4);
        assert_eq!(m.get_gauge("subtasks_in_flight"), 4);
        m.add_gauge("subtasks_in_flight", -1);
        assert_eq!(m.get_gauge("subtasks_in_flight"), 3);
        m.add_gauge("fresh_gauge", 2);
        assert_eq!(m.get_gauge("fresh_gauge"), 2);
    }

    #[test]
    fn histogram_records_sum_and_count() {
        let m = MetricsRegistry::new();
        m.record_histogram("subtask_duration_seconds", 0.4);
        m.record_histogram("subtask_duration_seconds", 2.0);
        m.record_histogram("subtask_duration_seconds", 40.0);

        let map = m.histograms.read().unwrap();
        let h = map.get("subtask_duration_seconds").unwrap();
        assert_eq!(h.get_count(), 3);
        assert!((h.get_sum() - 42.4).abs() < 0.001);
    }

    #[test]
    fn each_observation_lands_in_one_bucket() {
        let h = Histogram::new(vec![1.0, 5.0, 10.0]);
        h.observe(0.5);
        h.observe(3.0);
        h.observe(20.0);

        let raw: Vec<u64> = h.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect();
        assert_eq!(raw, vec![1, 1, 0]);
        assert_eq!(h.get_count(), 3);
    }

    #[test]
    fn prometheus_export_covers_all_kinds() {
        let m = MetricsRegistry::new();
        m.increment_counter("tasks_escalated_total", &[("signature", "test_failure")]);
        m.set_gauge("pipelines_active", 2);
        m.record_histogram("subtask_duration_seconds", 1.5);

        let output = m.export_prometheus();
        assert!(output.contains("# TYPE tasks_escalated_total counter"));
        assert!(output.contains("tasks_escalated_total{signature=\"test_failure\"} 1"));
        assert!(output.contains("# TYPE pipelines_active gauge"));
        assert!(output.contains("pipelines_active 2"));
        assert!(output.contains("# TYPE subtask_duration_seconds histogram"));
        // Bucket lines are cumulative: empty below the value, exactly one
        // from the first bucket that holds it through +Inf.
        assert!(output.contains("subtask_duration_seconds_bucket{le=\"1\"} 0"));
        assert!(output.contains("subtask_duration_seconds_bucket{le=\"5\"} 1"));
        assert!(output.contains("subtask_duration_seconds_bucket{le=\"300\"} 1"));
        assert!(output.contains("subtask_duration_seconds_bucket{le=\"+Inf\"} 1"));
        assert!(output.contains("subtask_duration_seconds_sum 1.5"));
        assert!(output.contains("subtask_duration_seconds_count 1"));
    }

    #[test]
    fn labels_sort_for_stable_output() {
        let l = Labels::new(&[("status", "ok"), ("capability", "plan")]);
        assert_eq!(
            l.prometheus_str(),
            "{capability=\"plan\",status=\"ok\"}"
        );
        assert_eq!(Labels::empty().prometheus_str(), "");
    }
}
