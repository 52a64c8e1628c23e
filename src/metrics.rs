use crate::probes::disk::DiskUsage;
use crate::probes::speedtest::SpeedResult;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at: Instant,
    pub disk_usage_percent: GaugeVec,
    pub disk_used_bytes: GaugeVec,
    pub disk_avail_bytes: GaugeVec,
    pub speedtest_download_mbps: Gauge,
    pub speedtest_upload_mbps: Gauge,
    pub speedtest_latency_ms: Gauge,
    pub job_runs_total: CounterVec,
    pub job_rejections_total: CounterVec,
    pub ingest_poll_errors_total: CounterVec,
    pub ingest_backoff_seconds: Gauge,
    pub uptime_seconds: Gauge,
    pub scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let disk_usage_percent = GaugeVec::new(
            opts!(
                "hostwatch_disk_usage_percent",
                "Disk usage percentage reported by df"
            ),
            &["target", "path"],
        )?;
        let disk_used_bytes = GaugeVec::new(
            opts!("hostwatch_disk_used_bytes", "Disk used space in bytes"),
            &["target", "path"],
        )?;
        let disk_avail_bytes = GaugeVec::new(
            opts!("hostwatch_disk_avail_bytes", "Disk available space in bytes"),
            &["target", "path"],
        )?;
        let speedtest_download_mbps = Gauge::with_opts(opts!(
            "hostwatch_speedtest_download_mbps",
            "Download throughput of the last successful speedtest in Mbit/s"
        ))?;
        let speedtest_upload_mbps = Gauge::with_opts(opts!(
            "hostwatch_speedtest_upload_mbps",
            "Upload throughput of the last successful speedtest in Mbit/s"
        ))?;
        let speedtest_latency_ms = Gauge::with_opts(opts!(
            "hostwatch_speedtest_latency_ms",
            "Round-trip latency of the last successful speedtest in milliseconds"
        ))?;
        let job_runs_total = CounterVec::new(
            opts!(
                "hostwatch_job_runs_total",
                "Measurement runs by command and outcome"
            ),
            &["command", "outcome"],
        )?;
        let job_rejections_total = CounterVec::new(
            opts!(
                "hostwatch_job_rejections_total",
                "Measurement requests rejected by the command gate"
            ),
            &["command"],
        )?;
        let ingest_poll_errors_total = CounterVec::new(
            opts!(
                "hostwatch_ingest_poll_errors_total",
                "Failed command polls by error class"
            ),
            &["class"],
        )?;
        let ingest_backoff_seconds = Gauge::with_opts(opts!(
            "hostwatch_ingest_backoff_seconds",
            "Current delay before the next command poll after a failure"
        ))?;
        let uptime_seconds =
            Gauge::with_opts(opts!("hostwatch_uptime_seconds", "Agent uptime in seconds"))?;
        let scrape_count_total = Counter::with_opts(opts!(
            "hostwatch_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &disk_usage_percent)?;
        register(&registry, &disk_used_bytes)?;
        register(&registry, &disk_avail_bytes)?;
        register(&registry, &speedtest_download_mbps)?;
        register(&registry, &speedtest_upload_mbps)?;
        register(&registry, &speedtest_latency_ms)?;
        register(&registry, &job_runs_total)?;
        register(&registry, &job_rejections_total)?;
        register(&registry, &ingest_poll_errors_total)?;
        register(&registry, &ingest_backoff_seconds)?;
        register(&registry, &uptime_seconds)?;
        register(&registry, &scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            started_at: Instant::now(),
            disk_usage_percent,
            disk_used_bytes,
            disk_avail_bytes,
            speedtest_download_mbps,
            speedtest_upload_mbps,
            speedtest_latency_ms,
            job_runs_total,
            job_rejections_total,
            ingest_poll_errors_total,
            ingest_backoff_seconds,
            uptime_seconds,
            scrape_count_total,
        }))
    }

    pub fn record_disk(&self, target: &str, path: &str, usage: &DiskUsage) {
        self.disk_usage_percent
            .with_label_values(&[target, path])
            .set(usage.percent as f64);
        self.disk_used_bytes
            .with_label_values(&[target, path])
            .set(usage.used_bytes);
        self.disk_avail_bytes
            .with_label_values(&[target, path])
            .set(usage.avail_bytes);
    }

    pub fn record_speedtest(&self, result: &SpeedResult) {
        self.speedtest_download_mbps.set(result.download_mbps);
        self.speedtest_upload_mbps.set(result.upload_mbps);
        self.speedtest_latency_ms.set(result.latency_ms);
    }

    pub fn inc_job_run(&self, command: &str, ok: bool) {
        let outcome = if ok { "ok" } else { "failed" };
        self.job_runs_total
            .with_label_values(&[command, outcome])
            .inc();
    }

    pub fn inc_rejection(&self, command: &str) {
        self.job_rejections_total
            .with_label_values(&[command])
            .inc();
    }

    pub fn inc_poll_error(&self, class: &str) {
        self.ingest_poll_errors_total
            .with_label_values(&[class])
            .inc();
    }

    pub fn set_backoff(&self, secs: f64) {
        self.ingest_backoff_seconds.set(secs);
    }

    pub fn inc_scrape_count(&self) {
        self.scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        self.uptime_seconds
            .set(self.started_at.elapsed().as_secs() as f64);
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}
