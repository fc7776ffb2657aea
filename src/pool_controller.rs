use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Duration;

use crate::hosted_ci::Observation;
use crate::runner::Runner;
use crate::vm_type::VmType;

/// One per `VmType`: a read/decide view over the shared runner registry,
/// filtered to this pool's tags. Holds no side-effecting handles (no
/// `Factory`, no `Store`) -- every method here is pure, so the decision
/// policy can be unit-tested without a runtime.
pub struct PoolController {
    vm_type: VmType,
    runners: Arc<Mutex<HashMap<String, Runner>>>,
}

impl PoolController {
    pub fn new(vm_type: VmType, runners: Arc<Mutex<HashMap<String, Runner>>>) -> Self {
        Self { vm_type, runners }
    }

    pub fn vm_type(&self) -> &VmType {
        &self.vm_type
    }

    pub fn runners(&self) -> Vec<Runner> {
        self.filter(|_| true)
    }

    pub fn filter(&self, pred: impl Fn(&Runner) -> bool) -> Vec<Runner> {
        self.runners
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.vm_type == self.vm_type && pred(r))
            .cloned()
            .collect()
    }

    pub fn min_runner_number(&self) -> u32 {
        self.vm_type.quantity.min
    }

    pub fn max_runner_number(&self) -> u32 {
        self.vm_type.quantity.max
    }

    pub fn insert(&self, runner: Runner) {
        self.runners.lock().unwrap().insert(runner.name.clone(), runner);
    }

    /// Applies each observation to its named runner if that runner belongs
    /// to this pool. Runners absent from `observations` are left untouched
    /// -- absence isn't a deletion signal, since a VM can exist before it
    /// registers.
    pub fn update(&self, observations: &[Observation]) {
        let mut runners = self.runners.lock().unwrap();
        for obs in observations {
            if let Some(runner) = runners.get_mut(&obs.name) {
                if runner.vm_type == self.vm_type {
                    runner.ingest_observation(obs.status, obs.busy, obs.id);
                }
            }
        }
    }

    /// `count(¬has_run ∧ ¬is_running) < min ∧ count(is_running) + count(¬has_run ∧ ¬is_running) < max`
    pub fn need_new_runner(&self) -> bool {
        let warm = self.filter(|r| !r.has_run() && !r.is_running()).len() as u32;
        let running = self.filter(|r| r.is_running()).len() as u32;
        warm < self.min_runner_number() && running + warm < self.max_runner_number()
    }

    /// Step 1: one-shot runners that have completed their job.
    pub fn consumed(&self) -> Vec<Runner> {
        self.filter(|r| r.has_run())
    }

    /// Step 3: created but never registered, past the timeout.
    pub fn stragglers(&self, timeout_runner_timer: Duration) -> Vec<Runner> {
        self.filter(|r| r.is_offline() && !r.has_run() && r.time_since_created() > timeout_runner_timer)
    }

    /// Step 4: idle-online past the extra-runner timer, keeping `min` of them.
    pub fn surplus(&self, extra_runner_online_timer: Duration) -> Vec<Runner> {
        let mut idle: Vec<Runner> = self.filter(|r| {
            r.is_online()
                && !r.has_run()
                && r.time_online()
                    .map(|t| t > extra_runner_online_timer)
                    .unwrap_or(false)
        });
        let keep = self.min_runner_number() as usize;
        if idle.len() > keep {
            idle.split_off(keep)
        } else {
            Vec::new()
        }
    }
}
