use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct CooldownTable {
    default: Duration,
    per_command: HashMap<String, Duration>,
}

impl CooldownTable {
    pub fn new(default: Duration, per_command: HashMap<String, Duration>) -> Self {
        Self {
            default,
            per_command,
        }
    }

    pub fn get(&self, name: &str) -> Duration {
        self.per_command.get(name).copied().unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionState {
    pub running: bool,
    pub last_started: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("command is already running")]
    AlreadyRunning,
    #[error("command is cooling down, retry in {}s", remaining.as_secs().max(1))]
    CoolingDown { remaining: Duration },
}

#[derive(Debug)]
pub struct CommandGate {
    cooldowns: CooldownTable,
    lanes: RwLock<HashMap<String, Arc<Mutex<ExecutionState>>>>,
}

/// Dropping it marks the command as finished.
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<CommandGate>,
    name: String,
}

impl GatePermit {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.finish(&self.name);
    }
}

impl CommandGate {
    pub fn new(cooldowns: CooldownTable) -> Arc<Self> {
        Arc::new(Self {
            cooldowns,
            lanes: RwLock::new(HashMap::new()),
        })
    }

    pub fn cooldown(&self, name: &str) -> Duration {
        self.cooldowns.get(name)
    }

    pub fn check(&self, name: &str) -> Result<(), Rejection> {
        self.check_at(name, Instant::now())
    }

    pub fn check_at(&self, name: &str, now: Instant) -> Result<(), Rejection> {
        let Some(lane) = self.existing_lane(name) else {
            return Ok(());
        };
        let state = lane.lock().unwrap_or_else(PoisonError::into_inner);
        admissible(&state, self.cooldowns.get(name), now)
    }

    pub fn try_acquire(self: &Arc<Self>, name: &str) -> Result<GatePermit, Rejection> {
        self.try_acquire_at(name, Instant::now())
    }

    /// Checks and marks the command as started inside one critical section.
    pub fn try_acquire_at(
        self: &Arc<Self>,
        name: &str,
        now: Instant,
    ) -> Result<GatePermit, Rejection> {
        let lane = self.lane(name);
        let mut state = lane.lock().unwrap_or_else(PoisonError::into_inner);
        admissible(&state, self.cooldowns.get(name), now)?;
        state.running = true;
        state.last_started = Some(now);
        drop(state);

        Ok(GatePermit {
            gate: Arc::clone(self),
            name: name.to_string(),
        })
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state(name).running
    }

    pub fn state(&self, name: &str) -> ExecutionState {
        self.existing_lane(name)
            .map(|lane| *lane.lock().unwrap_or_else(PoisonError::into_inner))
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<(String, ExecutionState)> {
        let lanes = self.lanes.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = lanes
            .iter()
            .map(|(name, lane)| {
                let state = *lane.lock().unwrap_or_else(PoisonError::into_inner);
                (name.clone(), state)
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn finish(&self, name: &str) {
        if let Some(lane) = self.existing_lane(name) {
            let mut state = lane.lock().unwrap_or_else(PoisonError::into_inner);
            state.running = false;
        }
    }

    fn existing_lane(&self, name: &str) -> Option<Arc<Mutex<ExecutionState>>> {
        let lanes = self.lanes.read().unwrap_or_else(PoisonError::into_inner);
        lanes.get(name).cloned()
    }

    fn lane(&self, name: &str) -> Arc<Mutex<ExecutionState>> {
        if let Some(lane) = self.existing_lane(name) {
            return lane;
        }
        let mut lanes = self.lanes.write().unwrap_or_else(PoisonError::into_inner);
        lanes.entry(name.to_string()).or_default().clone()
    }
}

fn admissible(state: &ExecutionState, cooldown: Duration, now: Instant) -> Result<(), Rejection> {
    if state.running {
        return Err(Rejection::AlreadyRunning);
    }
    if let Some(started) = state.last_started {
        let elapsed = now.saturating_duration_since(started);
        if elapsed < cooldown {
            return Err(Rejection::CoolingDown {
                remaining: cooldown - elapsed,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    fn gate() -> Arc<CommandGate> {
        let mut per_command = HashMap::new();
        per_command.insert("speedtest".to_string(), Duration::from_secs(30));
        CommandGate::new(CooldownTable::new(Duration::from_secs(10), per_command))
    }

    #[test]
    fn second_admission_while_running_is_rejected() {
        let gate = gate();
        let permit = gate.try_acquire("server_disk_usage").expect("first admission");
        assert_eq!(
            gate.try_acquire("server_disk_usage").unwrap_err(),
            Rejection::AlreadyRunning
        );
        assert!(gate.is_running("server_disk_usage"));
        drop(permit);
        assert!(!gate.is_running("server_disk_usage"));
    }

    #[test]
    fn concurrent_admissions_admit_exactly_one() {
        let gate = gate();
        let barrier = Arc::new(Barrier::new(8));
        let handles = (0..8)
            .map(|_| {
                let gate = gate.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    gate.try_acquire("speedtest").ok()
                })
            })
            .collect::<Vec<_>>();

        let permits = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(permits.len(), 1);
    }

    #[test]
    fn cooldown_applies_from_last_start() {
        let gate = gate();
        let t0 = Instant::now();
        let permit = gate.try_acquire_at("server_disk_usage", t0).unwrap();
        drop(permit);

        let cooldown = gate.cooldown("server_disk_usage");
        let eps = Duration::from_millis(1);
        assert!(matches!(
            gate.try_acquire_at("server_disk_usage", t0 + cooldown - eps),
            Err(Rejection::CoolingDown { .. })
        ));
        assert!(gate
            .try_acquire_at("server_disk_usage", t0 + cooldown + eps)
            .is_ok());
    }

    #[test]
    fn finishing_keeps_last_started() {
        let gate = gate();
        let t0 = Instant::now();
        drop(gate.try_acquire_at("speedtest", t0).unwrap());
        let state = gate.state("speedtest");
        assert!(!state.running);
        assert_eq!(state.last_started, Some(t0));
    }

    #[test]
    fn lanes_are_independent() {
        let gate = gate();
        let _speed = gate.try_acquire("speedtest").unwrap();
        assert!(gate.check("server_disk_usage").is_ok());
        assert!(gate.try_acquire("server_disk_usage").is_ok());
    }

    #[test]
    fn check_does_not_mark_running() {
        let gate = gate();
        assert!(gate.check("speedtest").is_ok());
        assert!(gate.check("speedtest").is_ok());
        assert!(!gate.is_running("speedtest"));
        assert!(gate.snapshot().is_empty());
    }

    #[test]
    fn cooldown_table_falls_back_to_default() {
        let gate = gate();
        assert_eq!(gate.cooldown("speedtest"), Duration::from_secs(30));
        assert_eq!(gate.cooldown("plex_disk_usage"), Duration::from_secs(10));
    }

    #[test]
    fn cooling_down_reports_remaining_time() {
        let gate = gate();
        let t0 = Instant::now();
        drop(gate.try_acquire_at("speedtest", t0).unwrap());
        let err = gate
            .try_acquire_at("speedtest", t0 + Duration::from_secs(12))
            .unwrap_err();
        assert_eq!(
            err,
            Rejection::CoolingDown {
                remaining: Duration::from_secs(18)
            }
        );
    }
}
