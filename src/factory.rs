use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake256;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::instrument;

use crate::cloud::CloudClient;
use crate::hosted_ci::HostedCiClient;
use crate::runner::{Runner, Status};
use crate::store::{Store, StoreError};
use crate::vm_type::VmType;

/// Caps concurrent provisioning/teardown tasks so a burst of pool scale-up
/// or scale-down can't open an unbounded number of simultaneous requests
/// against the cloud and hosted-CI APIs.
const MAX_CONCURRENT_MUTATIONS: usize = 4;

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// First 10 hex chars of a SHAKE-256 digest of the sorted, concatenated tags
/// -- short enough to fit cloud/hosted-CI name-length limits, stable across
/// runs so the same pool always hashes to the same prefix.
pub fn tags_hash(tags: &[String]) -> String {
    let mut hasher = Shake256::default();
    hasher.update(tags.concat().as_bytes());
    let mut reader = hasher.finalize_xof();
    let mut buf = [0u8; 5];
    reader.read(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

/// Creates, replaces, and deletes runners: owns name generation and the
/// background VM provisioning/teardown pool. Every Store mutation for a
/// given runner name happens inside one of these three operations, never
/// from elsewhere, so that "at most one writer per name" reduces to "at
/// most one of these three in flight per name" (enforced by the Reconciler's
/// in-flight set, not by the Factory itself).
pub struct Factory {
    store: Arc<dyn Store>,
    cloud: Arc<dyn CloudClient>,
    hosted_ci: Arc<dyn HostedCiClient>,
    github_organization: String,
    name_prefix: String,
    counter: AtomicU64,
    semaphore: Arc<Semaphore>,
}

impl Factory {
    pub fn new(
        store: Arc<dyn Store>,
        cloud: Arc<dyn CloudClient>,
        hosted_ci: Arc<dyn HostedCiClient>,
        cloud_name: &str,
        github_organization: &str,
    ) -> Self {
        Self {
            store,
            cloud,
            hosted_ci,
            github_organization: github_organization.to_string(),
            name_prefix: format!("runner-{cloud_name}-{github_organization}"),
            counter: AtomicU64::new(0),
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_MUTATIONS)),
        }
    }

    #[instrument(skip(self, vm_type), fields(tags = ?vm_type.tags()))]
    async fn generate_runner_name(&self, vm_type: &VmType) -> Result<String, FactoryError> {
        let hash = tags_hash(vm_type.tags());
        loop {
            let index = self.counter.fetch_add(1, Ordering::SeqCst);
            let name = format!("{}-{hash}-{index}", self.name_prefix);
            if self.store.get(&name).await?.is_none() {
                return Ok(name);
            }
        }
    }

    /// Allocates a name, persists a fresh `creating` record, and schedules
    /// background provisioning. Returns immediately -- the caller gets a
    /// partially-constructed `Runner` it can track while the VM boots.
    #[instrument(skip(self, vm_type), fields(tags = ?vm_type.tags()))]
    pub async fn create_runner(self: &Arc<Self>, vm_type: VmType) -> Result<Runner, FactoryError> {
        let name = self.generate_runner_name(&vm_type).await?;
        let runner = Runner::new(name, vm_type);

        if let Err(e) = self.store.put(&runner).await {
            tracing::warn!(runner = %runner.name, error = %e, "failed to persist newly created runner");
        }

        self.spawn_provision(runner.clone());
        Ok(runner)
    }

    /// Tears down the old VM, resets the runner's lifecycle fields in place,
    /// and schedules a fresh provision under the same name. `action_id` is
    /// cleared -- the hosted service issues a fresh id on re-registration.
    #[instrument(skip(self, runner), fields(runner = %runner.name))]
    pub async fn respawn_replace(self: &Arc<Self>, mut runner: Runner) -> Runner {
        if let Some(vm_id) = runner.vm_id.take() {
            if let Err(e) = self.cloud.delete_vm(&vm_id, Some(&runner.vm_type.config.image)).await {
                tracing::warn!(runner = %runner.name, error = %e, "failed to delete vm during respawn");
            }
        }

        runner.status_history.clear();
        runner.action_id = None;
        runner.created_at = Utc::now();
        runner.status = Status::Respawning;

        if let Err(e) = self.store.put(&runner).await {
            tracing::warn!(runner = %runner.name, error = %e, "failed to persist respawned runner");
        }

        self.spawn_provision(runner.clone());
        runner
    }

    /// Force-deregisters from the hosted-CI service and deletes the VM,
    /// swallowing and logging API errors from either. Deliberately does not
    /// touch the Store -- the caller (Reconciler) owns removing the entry,
    /// since it's the one holding the in-flight claim on this name.
    #[instrument(skip(self, runner), fields(runner = %runner.name))]
    pub async fn delete_runner(&self, runner: &Runner) {
        if let Some(action_id) = runner.action_id {
            if let Err(e) = self.hosted_ci.force_delete(action_id).await {
                tracing::info!(runner = %runner.name, error = %e, "ignoring error deregistering runner");
            }
        }
        if let Some(vm_id) = &runner.vm_id {
            if let Err(e) = self.cloud.delete_vm(vm_id, Some(&runner.vm_type.config.image)).await {
                tracing::info!(runner = %runner.name, error = %e, "ignoring error deleting vm");
            }
        }
    }

    fn spawn_provision(self: &Arc<Self>, runner: Runner) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = this
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("factory semaphore never closes");
            this.provision(runner).await;
        });
    }

    #[instrument(skip(self, runner), fields(runner = %runner.name))]
    async fn provision(&self, runner: Runner) {
        match self.store.manager_running().await {
            Ok(false) => {
                tracing::info!(runner = %runner.name, "manager draining, not allowed to spawn VM");
                self.abort(runner).await;
                return;
            }
            Err(e) => {
                tracing::warn!(runner = %runner.name, error = %e, "failed to check manager_running, proceeding optimistically");
            }
            Ok(true) => {}
        }

        let installer = match self.hosted_ci.download_link("x64").await {
            Ok(link) => link,
            Err(e) => {
                tracing::error!(runner = %runner.name, error = %e, "failed to locate runner installer");
                self.abort(runner).await;
                return;
            }
        };

        let token = match self.hosted_ci.mint_registration_token().await {
            Ok(token) => token,
            Err(e) => {
                tracing::error!(runner = %runner.name, error = %e, "failed to mint registration token");
                self.abort(runner).await;
                return;
            }
        };

        match self
            .cloud
            .create_vm(&runner, &token, &self.github_organization, &installer)
            .await
        {
            Ok(vm_id) => self.finish_provision(runner, vm_id).await,
            Err(e) => {
                tracing::error!(runner = %runner.name, error = %e, "vm creation failed after retries");
                metrics::counter!(
                    "runner_pool_creation_failures_total",
                    "tags" => runner.vm_type.tags().join(","),
                )
                .increment(1);
                self.abort(runner).await;
            }
        }
    }

    /// If a newer record for this name was persisted while we were
    /// provisioning (a concurrent respawn, say), that record wins and only
    /// gets the freshly assigned `vm_id` merged in.
    async fn finish_provision(&self, mut runner: Runner, vm_id: String) {
        match self.store.get(&runner.name).await {
            Ok(Some(mut persisted)) => {
                persisted.vm_id = Some(vm_id);
                if let Err(e) = self.store.put(&persisted).await {
                    tracing::warn!(runner = %persisted.name, error = %e, "failed to persist provisioned runner");
                }
            }
            _ => {
                runner.vm_id = Some(vm_id);
                if let Err(e) = self.store.put(&runner).await {
                    tracing::warn!(runner = %runner.name, error = %e, "failed to persist provisioned runner");
                }
            }
        }
        metrics::counter!("runner_pool_creations_total").increment(1);
        tracing::info!(runner = %runner.name, "vm provisioned");
    }

    async fn abort(&self, mut runner: Runner) {
        runner.update_status(Status::Deleting);
        if let Err(e) = self.store.delete(&runner.name).await {
            tracing::warn!(runner = %runner.name, error = %e, "failed to remove aborted runner from store");
        }
    }
}
