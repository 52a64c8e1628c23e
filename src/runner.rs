use crate::gate::{CommandGate, GatePermit, Rejection};
use crate::notify::Notifier;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct JobRunner {
    gate: Arc<CommandGate>,
    notifier: Arc<dyn Notifier>,
}

pub struct Admission {
    permit: GatePermit,
    notifier: Arc<dyn Notifier>,
}

impl JobRunner {
    pub fn new(gate: Arc<CommandGate>, notifier: Arc<dyn Notifier>) -> Self {
        Self { gate, notifier }
    }

    pub fn gate(&self) -> &Arc<CommandGate> {
        &self.gate
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn admit(&self, name: &str) -> Result<Admission, Rejection> {
        let permit = self.gate.try_acquire(name)?;
        debug!(command = %name, "admitted");
        Ok(Admission {
            permit,
            notifier: self.notifier.clone(),
        })
    }

    pub async fn execute<F, Fut>(&self, name: &str, probe: F) -> Result<(), Rejection>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = String>,
    {
        let admission = self.admit(name)?;
        admission.run(probe()).await;
        Ok(())
    }
}

impl Admission {
    pub fn command(&self) -> &str {
        self.permit.name()
    }

    pub async fn run<Fut>(self, probe: Fut)
    where
        Fut: Future<Output = String>,
    {
        let Admission { permit, notifier } = self;
        let message = probe.await;
        debug!(command = %permit.name(), "finished");
        drop(permit);
        notifier.send(&message).await;
    }
}
