use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Duration;
use futures::stream::{self, StreamExt};
use tracing::instrument;

use crate::factory::Factory;
use crate::hosted_ci::HostedCiClient;
use crate::pool_controller::PoolController;
use crate::runner::{Runner, Status};
use crate::store::Store;
use crate::vm_type::VmType;

/// Bounded worker pool for per-tick mutation fan-out (deletes/respawns), so a
/// tick with many pending actions doesn't flood the cloud/hosted-CI APIs with
/// simultaneous requests.
const MAX_CONCURRENT_TICK_OPS: usize = 4;

/// Holds a name in the in-flight set for the lifetime of the guard, releasing
/// it on drop (including on panic/early return) so a crashed mutation never
/// permanently wedges that name.
struct Claim<'a> {
    inflight: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.inflight.lock().unwrap().remove(&self.name);
    }
}

/// Orchestrates the whole runner pool: one [`PoolController`] per configured
/// `VmType`, sharing a single runner registry and a single in-flight name
/// claim set so at most one mutation (respawn/delete) runs per runner name
/// at a time. `Factory` already guarantees this for creation, since a
/// newly-generated name can't collide with an in-flight mutation.
pub struct Reconciler {
    runners: Arc<Mutex<HashMap<String, Runner>>>,
    controllers: Vec<PoolController>,
    factory: Arc<Factory>,
    store: Arc<dyn Store>,
    hosted_ci: Arc<dyn HostedCiClient>,
    inflight: Mutex<HashSet<String>>,
    extra_runner_timer: Duration,
    timeout_runner_timer: Duration,
}

impl Reconciler {
    pub fn new(
        vm_types: Vec<VmType>,
        factory: Arc<Factory>,
        store: Arc<dyn Store>,
        hosted_ci: Arc<dyn HostedCiClient>,
        extra_runner_timer: Duration,
        timeout_runner_timer: Duration,
    ) -> Self {
        let runners = Arc::new(Mutex::new(HashMap::new()));
        let controllers = vm_types
            .into_iter()
            .map(|vt| PoolController::new(vt, Arc::clone(&runners)))
            .collect();
        Self {
            runners,
            controllers,
            factory,
            store,
            hosted_ci,
            inflight: Mutex::new(HashSet::new()),
            extra_runner_timer,
            timeout_runner_timer,
        }
    }

    /// Loads every persisted runner into the shared registry. Runners whose
    /// tags don't match any configured pool are kept in the registry (so
    /// `list`/metrics still see them) but no controller will ever act on them.
    #[instrument(skip(self))]
    pub async fn seed(&self) -> Result<(), crate::store::StoreError> {
        let persisted = self.store.list().await?;
        let mut runners = self.runners.lock().unwrap();
        for runner in persisted {
            runners.insert(runner.name.clone(), runner);
        }
        Ok(())
    }

    fn try_claim(&self, name: &str) -> Option<Claim<'_>> {
        let mut inflight = self.inflight.lock().unwrap();
        if inflight.insert(name.to_string()) {
            Some(Claim {
                inflight: &self.inflight,
                name: name.to_string(),
            })
        } else {
            None
        }
    }

    fn lookup(&self, name: &str) -> Option<Runner> {
        self.runners.lock().unwrap().get(name).cloned()
    }

    fn forget(&self, name: &str) {
        self.runners.lock().unwrap().remove(name);
    }

    /// Pulls the hosted-CI service's current view of every runner and merges
    /// it into each pool's registry entries.
    #[instrument(skip(self))]
    pub async fn refresh_observations(&self) -> Result<(), crate::hosted_ci::HostedCiError> {
        let observations = self.hosted_ci.list_runners().await?;
        for controller in &self.controllers {
            controller.update(&observations);
        }
        Ok(())
    }

    async fn remove_runner(&self, name: &str) {
        let Some(_claim) = self.try_claim(name) else {
            tracing::debug!(runner = %name, "skipping removal, already in flight");
            return;
        };
        let Some(mut runner) = self.lookup(name) else {
            return;
        };
        runner.update_status(Status::Deleting);
        self.factory.delete_runner(&runner).await;
        if let Err(e) = self.store.delete(name).await {
            tracing::warn!(runner = %name, error = %e, "failed to remove runner from store");
        }
        self.forget(name);
    }

    async fn respawn_runner(&self, name: &str) {
        let Some(_claim) = self.try_claim(name) else {
            tracing::debug!(runner = %name, "skipping respawn, already in flight");
            return;
        };
        let Some(runner) = self.lookup(name) else {
            return;
        };
        let updated = self.factory.respawn_replace(runner).await;
        self.runners
            .lock()
            .unwrap()
            .insert(updated.name.clone(), updated);
    }

    /// Runs the four-step decision policy for a single pool: replace consumed
    /// runners, backfill to the minimum, replace timeout stragglers, then shed
    /// surplus. Order matters -- availability-preserving steps run before
    /// anything that removes capacity.
    async fn reconcile_controller(&self, controller: &PoolController) {
        // Step 1: replace consumed runners -- a one-shot worker that has run is spent.
        let consumed: Vec<String> = controller.consumed().into_iter().map(|r| r.name).collect();
        stream::iter(consumed)
            .for_each_concurrent(MAX_CONCURRENT_TICK_OPS, |name| async move {
                self.respawn_runner(&name).await;
            })
            .await;

        // Step 2: backfill the pool up to its minimum before touching anything else.
        while controller.need_new_runner() {
            match self.factory.create_runner(controller.vm_type().clone()).await {
                Ok(runner) => controller.insert(runner),
                Err(e) => {
                    tracing::error!(error = %e, tags = ?controller.vm_type().tags(), "failed to create runner");
                    break;
                }
            }
        }

        // Step 3: replace runners created but never registered within the timeout.
        let stragglers: Vec<String> = controller
            .stragglers(self.timeout_runner_timer)
            .into_iter()
            .map(|r| r.name)
            .collect();
        stream::iter(stragglers)
            .for_each_concurrent(MAX_CONCURRENT_TICK_OPS, |name| async move {
                self.respawn_runner(&name).await;
            })
            .await;

        // Step 4: shed idle runners beyond the minimum, keeping the pool's floor warm.
        let surplus: Vec<String> = controller
            .surplus(self.extra_runner_timer)
            .into_iter()
            .map(|r| r.name)
            .collect();
        stream::iter(surplus)
            .for_each_concurrent(MAX_CONCURRENT_TICK_OPS, |name| async move {
                self.remove_runner(&name).await;
            })
            .await;
    }

    /// One reconciliation pass over every pool: sheds consumed and stale
    /// runners, tops up every pool below its minimum. Safe to call
    /// concurrently with itself or with webhook-driven observation pushes --
    /// every mutation is guarded by the in-flight claim set.
    #[instrument(skip(self))]
    pub async fn tick(&self) {
        if let Err(e) = self.refresh_observations().await {
            tracing::warn!(error = %e, "failed to refresh observations from hosted CI, proceeding with stale data");
        }

        for controller in &self.controllers {
            self.reconcile_controller(controller).await;
        }
    }

    /// Applies a single out-of-band observation (e.g. from a webhook) to
    /// whichever pool matches its labels, then immediately re-runs that
    /// pool's decision policy instead of waiting for the next tick. Logs and
    /// drops the observation if no configured pool's tags match its labels.
    #[instrument(skip(self, observation), fields(runner = %observation.name))]
    pub async fn push_observation(&self, observation: crate::hosted_ci::Observation) {
        let mut labels = observation.labels.clone();
        labels.sort();
        let Some(controller) = self.controllers.iter().find(|c| c.vm_type().tags() == labels) else {
            tracing::info!(labels = ?labels, "dropping observation, no pool matches its labels");
            return;
        };
        controller.update(std::slice::from_ref(&observation));
        self.reconcile_controller(controller).await;
    }

    /// Gracefully empties every pool: stops new creation and tears down every
    /// runner currently tracked, regardless of status. Idempotent -- calling
    /// it again after a partial failure only touches what's left.
    #[instrument(skip(self))]
    pub async fn drain(&self) {
        if let Err(e) = self.store.set_manager_running(false).await {
            tracing::warn!(error = %e, "failed to flip manager_running off during drain");
        }

        let names: Vec<String> = self.runners.lock().unwrap().keys().cloned().collect();
        stream::iter(names)
            .for_each_concurrent(MAX_CONCURRENT_TICK_OPS, |name| async move {
                self.remove_runner(&name).await;
            })
            .await;
    }

    pub fn runner_count(&self) -> usize {
        self.runners.lock().unwrap().len()
    }

    /// Used by the readiness probe: the store is reachable iff a read against
    /// it succeeds, regardless of what `manager_running` actually says.
    pub async fn healthcheck(&self) -> bool {
        self.store.manager_running().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::fake::FakeCloudClient;
    use crate::hosted_ci::fake::FakeHostedCiClient;
    use crate::hosted_ci::Observation;
    use crate::runner::{ObservedStatus, Status};
    use crate::store::InMemoryStore;
    use crate::vm_type::{CloudConfig, Quantity};

    fn vm_type(tags: Vec<&str>, min: u32, max: u32) -> VmType {
        VmType::new(
            tags.into_iter().map(String::from).collect(),
            CloudConfig {
                image: "img".into(),
                flavor: "flv".into(),
                network: "net".into(),
                key_name: "key".into(),
                runner_user: "runner".into(),
                runner_group: "runner".into(),
            },
            Quantity { min, max },
        )
    }

    fn reconciler(vm_types: Vec<VmType>, observations: Vec<Observation>) -> Reconciler {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let cloud = Arc::new(FakeCloudClient::new());
        let hosted_ci: Arc<dyn HostedCiClient> = Arc::new(FakeHostedCiClient::new(observations));
        let factory = Arc::new(Factory::new(
            Arc::clone(&store),
            cloud,
            Arc::clone(&hosted_ci),
            "openstack",
            "acme",
        ));
        Reconciler::new(
            vm_types,
            factory,
            store,
            hosted_ci,
            Duration::hours(2),
            Duration::minutes(10),
        )
    }

    #[tokio::test]
    async fn s1_cold_start_creates_up_to_min() {
        let r = reconciler(vec![vm_type(vec!["small"], 2, 4)], vec![]);
        r.tick().await;
        assert_eq!(r.runner_count(), 2);
    }

    #[tokio::test]
    async fn s6_repeated_ticks_do_not_exceed_min_when_idle() {
        let r = reconciler(vec![vm_type(vec!["small"], 2, 4)], vec![]);
        r.tick().await;
        r.tick().await;
        r.tick().await;
        assert_eq!(r.runner_count(), 2);
    }

    #[tokio::test]
    async fn s5_surplus_idle_runners_are_shed_down_to_min() {
        let r = reconciler(vec![vm_type(vec!["small"], 1, 5)], vec![]);
        for i in 0..3 {
            let mut runner = Runner::new(format!("runner-openstack-acme-x-{i}"), r.controllers[0].vm_type().clone());
            runner.status = Status::Online;
            runner.started_at = Some(chrono::Utc::now() - Duration::hours(3));
            r.controllers[0].insert(runner);
        }
        assert_eq!(r.runner_count(), 3);

        r.tick().await;
        assert_eq!(r.runner_count(), 1);
    }

    #[tokio::test]
    async fn consumed_runner_is_respawned_in_place_not_deleted() {
        let r = reconciler(vec![vm_type(vec!["small"], 1, 2)], vec![]);
        let mut runner = Runner::new("runner-openstack-acme-x-0".into(), r.controllers[0].vm_type().clone());
        runner.status = Status::Offline;
        runner.status_history = vec![Status::Creating, Status::Online, Status::Running];
        r.store.put(&runner).await.unwrap();
        r.controllers[0].insert(runner);

        r.tick().await;

        let respawned = r.lookup("runner-openstack-acme-x-0").expect("respawned in place, same name");
        assert_eq!(respawned.status, Status::Respawning);
        assert!(respawned.status_history.is_empty());
        assert_eq!(r.runner_count(), 1);
    }

    #[tokio::test]
    async fn draining_tears_down_every_tracked_runner_and_stops_manager() {
        let r = reconciler(vec![vm_type(vec!["small"], 2, 4)], vec![]);
        r.tick().await;
        assert_eq!(r.runner_count(), 2);

        r.drain().await;

        assert_eq!(r.runner_count(), 0);
        assert!(!r.store.manager_running().await.unwrap());
    }

    #[tokio::test]
    async fn draining_twice_is_idempotent() {
        let r = reconciler(vec![vm_type(vec!["small"], 1, 2)], vec![]);
        r.tick().await;
        r.drain().await;
        r.drain().await;
        assert_eq!(r.runner_count(), 0);
    }

    #[tokio::test]
    async fn push_observation_updates_matching_pool_outside_of_tick() {
        let r = reconciler(vec![vm_type(vec!["small"], 1, 2)], vec![]);
        let mut runner = Runner::new("runner-openstack-acme-x-0".into(), r.controllers[0].vm_type().clone());
        runner.status = Status::Offline;
        r.controllers[0].insert(runner);

        r.push_observation(Observation {
            name: "runner-openstack-acme-x-0".into(),
            id: 5,
            status: ObservedStatus::Online,
            busy: false,
            labels: vec!["small".into()],
        })
        .await;

        let updated = r.lookup("runner-openstack-acme-x-0").unwrap();
        assert_eq!(updated.status, Status::Online);
        assert_eq!(updated.action_id, Some(5));
    }

    #[tokio::test]
    async fn push_observation_backfills_the_matched_pool_immediately() {
        let r = reconciler(vec![vm_type(vec!["small"], 2, 4)], vec![]);

        r.push_observation(Observation {
            name: "whatever".into(),
            id: 1,
            status: ObservedStatus::Offline,
            busy: false,
            labels: vec!["small".into()],
        })
        .await;

        assert_eq!(r.runner_count(), 2);
    }

    #[tokio::test]
    async fn push_observation_with_no_matching_pool_is_dropped() {
        let r = reconciler(vec![vm_type(vec!["small"], 1, 2)], vec![]);

        r.push_observation(Observation {
            name: "runner-openstack-acme-x-0".into(),
            id: 1,
            status: ObservedStatus::Online,
            busy: false,
            labels: vec!["does-not-exist".into()],
        })
        .await;

        assert_eq!(r.runner_count(), 0);
    }
}
