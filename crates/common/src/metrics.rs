use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    task_attempts: CounterVec,
    task_retries: CounterVec,
    tasks_abandoned: CounterVec,
    query_restarts: CounterVec,
    exchange_bytes_written: CounterVec,
    exchange_bytes_read: CounterVec,
    exchange_partitions_spooled: CounterVec,
    exchange_partitions_collected: CounterVec,
    exchange_seal_seconds: HistogramVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn inc_task_attempt(&self, query_id: &str, stage_id: u64) {
        let labels = [query_id, &stage_id.to_string()];
        self.inner.task_attempts.with_label_values(&labels).inc();
    }

    pub fn inc_task_retry(&self, query_id: &str, stage_id: u64) {
        let labels = [query_id, &stage_id.to_string()];
        self.inner.task_retries.with_label_values(&labels).inc();
    }

    pub fn inc_task_abandoned(&self, query_id: &str, stage_id: u64) {
        let labels = [query_id, &stage_id.to_string()];
        self.inner.tasks_abandoned.with_label_values(&labels).inc();
    }

    pub fn inc_query_restart(&self, query_id: &str) {
        let labels = [query_id];
        self.inner.query_restarts.with_label_values(&labels).inc();
    }

    pub fn record_exchange_write(&self, query_id: &str, stage_id: u64, bytes: u64, partitions: u64) {
        let labels = [query_id, &stage_id.to_string()];
        self.inner
            .exchange_bytes_written
            .with_label_values(&labels)
            .inc_by(bytes as f64);
        self.inner
            .exchange_partitions_spooled
            .with_label_values(&labels)
            .inc_by(partitions as f64);
    }

    pub fn record_exchange_read(&self, query_id: &str, stage_id: u64, bytes: u64) {
        let labels = [query_id, &stage_id.to_string()];
        self.inner
            .exchange_bytes_read
            .with_label_values(&labels)
            .inc_by(bytes as f64);
    }

    pub fn record_exchange_seal(&self, query_id: &str, stage_id: u64, secs: f64) {
        let labels = [query_id, &stage_id.to_string()];
        self.inner
            .exchange_seal_seconds
            .with_label_values(&labels)
            .observe(secs.max(0.0));
    }

    pub fn inc_partitions_collected(&self, query_id: &str, partitions: u64) {
        let labels = [query_id];
        self.inner
            .exchange_partitions_collected
            .with_label_values(&labels)
            .inc_by(partitions as f64);
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let task_attempts = counter_vec(
            &registry,
            "ftq_task_attempts_total",
            "Task attempts scheduled",
            &["query_id", "stage_id"],
        );
        let task_retries = counter_vec(
            &registry,
            "ftq_task_retries_total",
            "Task retries scheduled after failures",
            &["query_id", "stage_id"],
        );
        let tasks_abandoned = counter_vec(
            &registry,
            "ftq_tasks_abandoned_total",
            "Tasks abandoned after budget exhaustion or fatal failures",
            &["query_id", "stage_id"],
        );
        let query_restarts = counter_vec(
            &registry,
            "ftq_query_restarts_total",
            "Whole-query restarts",
            &["query_id"],
        );

        let exchange_bytes_written = counter_vec(
            &registry,
            "ftq_exchange_bytes_written_total",
            "Spooled exchange bytes written",
            &["query_id", "stage_id"],
        );
        let exchange_bytes_read = counter_vec(
            &registry,
            "ftq_exchange_bytes_read_total",
            "Spooled exchange bytes read",
            &["query_id", "stage_id"],
        );
        let exchange_partitions_spooled = counter_vec(
            &registry,
            "ftq_exchange_partitions_spooled_total",
            "Spooled exchange partitions written",
            &["query_id", "stage_id"],
        );
        let exchange_partitions_collected = counter_vec(
            &registry,
            "ftq_exchange_partitions_collected_total",
            "Spooled exchange partitions garbage-collected",
            &["query_id"],
        );
        let exchange_seal_seconds = histogram_vec(
            &registry,
            "ftq_exchange_seal_seconds",
            "Time spent sealing exchange sinks",
            &["query_id", "stage_id"],
        );

        Self {
            registry,
            task_attempts,
            task_retries,
            tasks_abandoned,
            query_restarts,
            exchange_bytes_written,
            exchange_bytes_read,
            exchange_partitions_spooled,
            exchange_partitions_collected,
            exchange_seal_seconds,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
