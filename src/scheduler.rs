use crate::config::SPEEDTEST_COMMAND;
use crate::jobs::{Jobs, LaunchError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub fn schedules(jobs: &Jobs, speedtest_interval: Option<Duration>) -> Vec<(String, Duration)> {
    let mut out = jobs
        .disk_targets()
        .iter()
        .filter_map(|t| t.interval.map(|every| (t.command(), every)))
        .collect::<Vec<_>>();
    if jobs.speedtest_enabled() {
        if let Some(every) = speedtest_interval {
            out.push((SPEEDTEST_COMMAND.to_string(), every));
        }
    }
    out
}

pub fn spawn_schedules(
    jobs: Arc<Jobs>,
    schedules: Vec<(String, Duration)>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    schedules
        .into_iter()
        .map(|(command, every)| {
            info!(command = %command, every = %humantime::format_duration(every), "schedule registered");
            tokio::spawn(run_schedule(jobs.clone(), command, every, shutdown.clone()))
        })
        .collect()
}

// first tick fires one period after start
async fn run_schedule(
    jobs: Arc<Jobs>,
    command: String,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                debug!(command = %command, "schedule stopped");
                return;
            }
        }

        match jobs.execute(&command).await {
            Ok(()) => {}
            Err(LaunchError::Rejected(rejection)) => {
                info!(command = %command, reason = %rejection, "scheduled run skipped");
            }
            Err(err) => {
                warn!(command = %command, error = %err, "scheduled command is not runnable");
                return;
            }
        }
    }
}
