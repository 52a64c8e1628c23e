use crate::metrics::Metrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const POLL_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCommand {
    pub name: String,
    pub args: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("transient source error: {0}")]
    Transient(String),
    #[error("permanent source error: {0}")]
    Permanent(String),
    #[error("throttled by the source for {0:?}")]
    Throttled(Duration),
}

impl SourceError {
    fn class(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
            Self::Throttled(_) => "throttled",
        }
    }
}

#[async_trait]
pub trait CommandSource: Send {
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<IncomingCommand>, SourceError>;
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: IncomingCommand);
}

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Returns the delay to wait now and grows the next one.
    pub fn next_transient(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    Polling,
    ProcessingBatch(Vec<IncomingCommand>),
    Backoff(Duration),
    Stopped,
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub poll_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub retry_delay: Duration,
}

impl From<&crate::config::TelegramConfig> for IngestSettings {
    fn from(cfg: &crate::config::TelegramConfig) -> Self {
        Self {
            poll_timeout: Duration::from_secs(cfg.poll_timeout_secs as u64),
            backoff_base: Duration::from_secs(cfg.backoff_base_secs),
            backoff_max: Duration::from_secs(cfg.backoff_max_secs),
            retry_delay: Duration::from_secs(cfg.retry_delay_secs),
        }
    }
}

pub struct IngestLoop<S> {
    source: S,
    handler: Arc<dyn CommandHandler>,
    settings: IngestSettings,
    backoff: Backoff,
    metrics: Arc<Metrics>,
    state: LoopState,
}

impl<S: CommandSource> IngestLoop<S> {
    pub fn new(
        source: S,
        handler: Arc<dyn CommandHandler>,
        settings: IngestSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        let backoff = Backoff::new(settings.backoff_base, settings.backoff_max);
        Self {
            source,
            handler,
            settings,
            backoff,
            metrics,
            state: LoopState::Polling,
        }
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_timeout_secs = self.settings.poll_timeout.as_secs(),
            "command ingestion started"
        );
        while self.state != LoopState::Stopped {
            self.step(&mut shutdown).await;
        }
        info!("command ingestion stopped");
    }

    pub async fn step(&mut self, shutdown: &mut watch::Receiver<bool>) {
        if *shutdown.borrow() {
            self.state = LoopState::Stopped;
            return;
        }

        let state = std::mem::replace(&mut self.state, LoopState::Stopped);
        self.state = match state {
            LoopState::Polling => self.poll_once(shutdown).await,
            LoopState::ProcessingBatch(batch) => self.process(batch, shutdown).await,
            LoopState::Backoff(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => LoopState::Polling,
                    _ = shutdown.changed() => LoopState::Stopped,
                }
            }
            LoopState::Stopped => LoopState::Stopped,
        };
    }

    async fn poll_once(&mut self, shutdown: &mut watch::Receiver<bool>) -> LoopState {
        let per_call = self.settings.poll_timeout + POLL_SLACK;
        let poll_timeout = self.settings.poll_timeout;
        let result = tokio::select! {
            res = tokio::time::timeout(per_call, self.source.poll(poll_timeout)) => {
                res.unwrap_or_else(|_elapsed| {
                    Err(SourceError::Transient(format!("poll exceeded {per_call:?}")))
                })
            }
            _ = shutdown.changed() => return LoopState::Stopped,
        };

        match result {
            Ok(batch) => {
                self.backoff.reset();
                self.metrics.set_backoff(0.0);
                if batch.is_empty() {
                    LoopState::Polling
                } else {
                    debug!(count = batch.len(), "received commands");
                    LoopState::ProcessingBatch(batch)
                }
            }
            Err(err) => {
                self.metrics.inc_poll_error(err.class());
                let delay = match &err {
                    SourceError::Transient(_) => self.backoff.next_transient(),
                    SourceError::Permanent(_) => {
                        self.backoff.reset();
                        self.settings.retry_delay
                    }
                    SourceError::Throttled(wait) => *wait,
                };
                self.metrics.set_backoff(delay.as_secs_f64());
                warn!(error = %err, delay_secs = delay.as_secs(), "command poll failed");
                LoopState::Backoff(delay)
            }
        }
    }

    async fn process(
        &mut self,
        batch: Vec<IncomingCommand>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> LoopState {
        for command in batch {
            if *shutdown.borrow() {
                return LoopState::Stopped;
            }
            self.handler.handle(command).await;
        }
        LoopState::Polling
    }
}
