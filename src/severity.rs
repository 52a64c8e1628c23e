use crate::config::SpeedtestConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub enum Severity {
    Ok,
    Warning,
    Critical,
}

pub const DISK_WARNING_PERCENT: u32 = 70;
pub const DISK_CRITICAL_PERCENT: u32 = 90;

impl Severity {
    pub fn disk_label(self) -> &'static str {
        match self {
            Severity::Ok => "🟢 OK",
            Severity::Warning => "🟡 Warning",
            Severity::Critical => "🔴 CRITICAL",
        }
    }

    pub fn speed_label(self) -> &'static str {
        match self {
            Severity::Ok => "🟢 OK",
            Severity::Warning => "🟡 Degraded",
            Severity::Critical => "🔴 Poor",
        }
    }
}

pub fn classify_disk(percent: u32) -> Severity {
    if percent >= DISK_CRITICAL_PERCENT {
        Severity::Critical
    } else if percent >= DISK_WARNING_PERCENT {
        Severity::Warning
    } else {
        Severity::Ok
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeedThresholds {
    pub expected_download_mbps: f64,
    pub expected_upload_mbps: f64,
    pub warn_ratio: f64,
    pub crit_ratio: f64,
    pub warn_latency_ms: f64,
    pub crit_latency_ms: f64,
    pub warn_loss_percent: Option<f64>,
    pub crit_loss_percent: Option<f64>,
}

impl From<&SpeedtestConfig> for SpeedThresholds {
    fn from(cfg: &SpeedtestConfig) -> Self {
        Self {
            expected_download_mbps: cfg.expected_download_mbps,
            expected_upload_mbps: cfg.expected_upload_mbps,
            warn_ratio: cfg.warn_ratio,
            crit_ratio: cfg.crit_ratio,
            warn_latency_ms: cfg.warn_latency_ms,
            crit_latency_ms: cfg.crit_latency_ms,
            warn_loss_percent: cfg.warn_loss_percent,
            crit_loss_percent: cfg.crit_loss_percent,
        }
    }
}

// Loss only counts when a loss threshold is configured.
pub fn classify_speed(
    download_mbps: f64,
    upload_mbps: f64,
    latency_ms: f64,
    loss_percent: f64,
    t: &SpeedThresholds,
) -> Severity {
    let down_ratio = download_mbps / t.expected_download_mbps;
    let up_ratio = upload_mbps / t.expected_upload_mbps;
    let loss_over = |limit: Option<f64>| limit.is_some_and(|l| loss_percent > l);

    if down_ratio < t.crit_ratio
        || up_ratio < t.crit_ratio
        || latency_ms > t.crit_latency_ms
        || loss_over(t.crit_loss_percent)
    {
        return Severity::Critical;
    }
    if down_ratio < t.warn_ratio
        || up_ratio < t.warn_ratio
        || latency_ms > t.warn_latency_ms
        || loss_over(t.warn_loss_percent)
    {
        return Severity::Warning;
    }
    Severity::Ok
}
