use crate::config::{Config, DiskTargetConfig, SPEEDTEST_COMMAND};
use crate::gate::Rejection;
use crate::metrics::Metrics;
use crate::probes::disk::{self, DiskProbeError, DF_PROGRAM, DF_TIMEOUT};
use crate::probes::speedtest::{self, SpeedProvider, SpeedtestLimits};
use crate::runner::{Admission, JobRunner};
use crate::severity::{classify_disk, classify_speed, SpeedThresholds};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type ProbeFuture = Pin<Box<dyn Future<Output = String> + Send>>;

#[derive(Debug, Clone)]
pub enum Measurement {
    Disk(DiskTargetConfig),
    Speedtest,
}

#[derive(Debug, Error, PartialEq)]
pub enum LaunchError {
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error(transparent)]
    Rejected(#[from] Rejection),
}

pub struct Jobs {
    runner: JobRunner,
    disk_targets: Vec<DiskTargetConfig>,
    speedtest_enabled: bool,
    thresholds: SpeedThresholds,
    limits: SpeedtestLimits,
    provider: Arc<dyn SpeedProvider>,
    metrics: Arc<Metrics>,
    df_program: String,
}

pub struct Admitted {
    admission: Admission,
    probe: ProbeFuture,
}

impl Admitted {
    pub fn command(&self) -> &str {
        self.admission.command()
    }

    pub async fn run(self) {
        self.admission.run(self.probe).await;
    }

    pub fn spawn(self) -> JoinHandle<()> {
        debug!(command = %self.command(), "measurement spawned");
        tokio::spawn(self.run())
    }
}

impl Jobs {
    pub fn new(
        runner: JobRunner,
        cfg: &Config,
        provider: Arc<dyn SpeedProvider>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            runner,
            disk_targets: cfg.disk_targets.clone(),
            speedtest_enabled: cfg.speedtest.enabled,
            thresholds: SpeedThresholds::from(&cfg.speedtest),
            limits: SpeedtestLimits::from(&cfg.speedtest),
            provider,
            metrics,
            df_program: DF_PROGRAM.to_string(),
        })
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    pub fn disk_targets(&self) -> &[DiskTargetConfig] {
        &self.disk_targets
    }

    pub fn speedtest_enabled(&self) -> bool {
        self.speedtest_enabled
    }

    pub fn describe(&self) -> Vec<(String, String)> {
        let mut out = self
            .disk_targets
            .iter()
            .map(|t| {
                (
                    t.command(),
                    format!("Check {} disk usage", t.display_label()),
                )
            })
            .collect::<Vec<_>>();
        if self.speedtest_enabled {
            out.push((
                SPEEDTEST_COMMAND.to_string(),
                "Run an internet speed test".to_string(),
            ));
        }
        out
    }

    pub fn command_names(&self) -> Vec<String> {
        self.describe().into_iter().map(|(name, _)| name).collect()
    }

    pub fn lookup(&self, command: &str) -> Option<Measurement> {
        if command == SPEEDTEST_COMMAND {
            return self.speedtest_enabled.then_some(Measurement::Speedtest);
        }
        self.disk_targets
            .iter()
            .find(|t| t.command() == command)
            .cloned()
            .map(Measurement::Disk)
    }

    // by short name: `plex`, not `plex_disk_usage`
    pub fn disk_target(&self, name: &str) -> Option<&DiskTargetConfig> {
        self.disk_targets.iter().find(|t| t.name == name)
    }

    pub fn admit(self: &Arc<Self>, command: &str) -> Result<Admitted, LaunchError> {
        let measurement = self
            .lookup(command)
            .ok_or_else(|| LaunchError::Unknown(command.to_string()))?;
        let admission = self
            .runner
            .admit(command)
            .map_err(|rejection| self.rejected(command, rejection))?;
        Ok(Admitted {
            admission,
            probe: self.probe(measurement),
        })
    }

    /// Admits and runs in the caller's task.
    pub async fn execute(self: &Arc<Self>, command: &str) -> Result<(), LaunchError> {
        let measurement = self
            .lookup(command)
            .ok_or_else(|| LaunchError::Unknown(command.to_string()))?;
        self.runner
            .execute(command, || self.probe(measurement))
            .await
            .map_err(|rejection| self.rejected(command, rejection))
    }

    fn rejected(&self, command: &str, rejection: Rejection) -> LaunchError {
        self.metrics.inc_rejection(command);
        info!(command = %command, reason = %rejection, "command rejected");
        LaunchError::Rejected(rejection)
    }

    pub fn probe(self: &Arc<Self>, measurement: Measurement) -> ProbeFuture {
        let jobs = Arc::clone(self);
        match measurement {
            Measurement::Disk(target) => Box::pin(async move { jobs.disk_message(&target).await }),
            Measurement::Speedtest => Box::pin(async move { jobs.speedtest_message().await }),
        }
    }

    async fn disk_message(&self, target: &DiskTargetConfig) -> String {
        let command = target.command();
        let label = target.display_label();
        match disk::probe_disk(&self.df_program, &target.path, DF_TIMEOUT).await {
            Ok(usage) => {
                self.metrics.record_disk(&target.name, &target.path, &usage);
                self.metrics.inc_job_run(&command, true);
                let severity = classify_disk(usage.percent);
                info!(
                    command = %command,
                    path = %target.path,
                    percent = usage.percent,
                    severity = ?severity,
                    "disk usage measured"
                );
                disk::format_disk_usage(&label, &usage, severity.disk_label())
            }
            Err(err) => {
                self.metrics.inc_job_run(&command, false);
                warn!(command = %command, path = %target.path, error = %err, "disk probe failed");
                disk_failure_message(&label, &err)
            }
        }
    }

    async fn speedtest_message(&self) -> String {
        match speedtest::run_speedtest(self.provider.as_ref(), self.limits).await {
            Ok(result) => {
                self.metrics.record_speedtest(&result);
                self.metrics.inc_job_run(SPEEDTEST_COMMAND, true);
                let severity = classify_speed(
                    result.download_mbps,
                    result.upload_mbps,
                    result.latency_ms,
                    0.0,
                    &self.thresholds,
                );
                info!(
                    download_mbps = result.download_mbps,
                    upload_mbps = result.upload_mbps,
                    latency_ms = result.latency_ms,
                    severity = ?severity,
                    "speedtest finished"
                );
                speedtest::format_speedtest(&result, severity.speed_label())
            }
            Err(err) => {
                self.metrics.inc_job_run(SPEEDTEST_COMMAND, false);
                warn!(error = %err, "speedtest failed");
                err.user_message().to_string()
            }
        }
    }
}

fn disk_failure_message(label: &str, err: &DiskProbeError) -> String {
    match err {
        DiskProbeError::InvalidPath(_) => format!("⚠️ {label}: invalid disk path provided"),
        e if e.is_parse_failure() => format!("⚠️ {label}: could not parse disk usage data"),
        _ => format!("⚠️ {label}: failed to check disk usage"),
    }
}
