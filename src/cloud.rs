use std::borrow::Cow;

use async_trait::async_trait;
use base64::prelude::*;
use chrono::{DateTime, TimeDelta, Utc};
use openstack_sdk::{
    AsyncOpenStack,
    api::{
        self, QueryAsync,
        compute::v2::server::{create_20, delete, list_detailed},
    },
    auth::AuthState,
    config::ConfigFile,
    types::ServiceType,
};
use openstack_types::compute::v2::server::response::{
    create::ServerResponse as CreateServerResponse, list_detailed::ServerResponse as ListServerResponse,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Duration as TokioDuration, sleep};
use tracing::instrument;

use crate::cloud_config;
use crate::runner::Runner;

const MAX_CREATE_ATTEMPTS: u32 = 5;
const POLL_INTERVAL: TokioDuration = TokioDuration::from_secs(3);

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("transient network error: {0}")]
    Transient(String),

    #[error("cloud API error: {0}")]
    Api(String),
}

/// A VM as observed by the cloud provider, for reconciliation/GC of orphans.
#[derive(Clone, Debug)]
pub struct CloudVm {
    pub id: String,
    pub name: String,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Polymorphic interface over a cloud provider's VM lifecycle. Concrete
/// implementations (one per cloud) are constructed directly by `main`; there
/// is exactly one in this codebase (OpenStack) but the trait keeps Factory
/// decoupled from it.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Provisions a VM whose user-data registers `runner`, blocking until it
    /// reaches a terminal state. Retries internally up to 5 attempts on
    /// `ERROR`, deleting the failed VM between attempts.
    async fn create_vm(
        &self,
        runner: &Runner,
        token: &str,
        org: &str,
        installer: &str,
    ) -> Result<String, CloudError>;

    /// Idempotent. `image_hint` is reserved for implementations that need to
    /// special-case deletion by image (e.g. a shelve-then-delete sequence for
    /// images requiring a clean unsubscribe); the OpenStack implementation
    /// below ignores it and always issues a plain delete.
    async fn delete_vm(&self, vm_id: &str, image_hint: Option<&str>) -> Result<(), CloudError>;

    async fn list_vms(&self, name_prefix: &str) -> Result<Vec<CloudVm>, CloudError>;
}

/// OpenStack-backed `CloudClient`, following the same session/auth-refresh
/// pattern as a plain Nova client: a single `AsyncOpenStack` session behind a
/// mutex (auth renewal takes `&mut self`), re-authorized lazily when close to
/// expiry.
pub struct OpenStackCloudClient {
    session: Mutex<AsyncOpenStack>,
}

impl OpenStackCloudClient {
    #[instrument(skip(cloud))]
    pub async fn connect(cloud: &str) -> Result<Self, CloudError> {
        let profile = ConfigFile::new()
            .map_err(|e| CloudError::Api(e.to_string()))?
            .get_cloud_config(cloud)
            .map_err(|e| CloudError::Api(e.to_string()))?
            .ok_or_else(|| CloudError::Api(format!("openstack profile not found: {cloud}")))?;

        let mut session = AsyncOpenStack::new(&profile)
            .await
            .map_err(|e| CloudError::Api(e.to_string()))?;
        session
            .discover_service_endpoint(&ServiceType::Compute)
            .await
            .map_err(|e| CloudError::Api(e.to_string()))?;

        Ok(Self {
            session: Mutex::new(session),
        })
    }

    async fn ensure_authorized(
        &self,
        session: &mut AsyncOpenStack,
    ) -> Result<(), CloudError> {
        match session.get_auth_state(Some(TimeDelta::seconds(10))) {
            Some(AuthState::Expired) | Some(AuthState::AboutToExpire) => {
                session
                    .authorize(None, false, true)
                    .await
                    .map_err(|e| CloudError::Api(e.to_string()))?;
                session
                    .discover_service_endpoint(&ServiceType::Compute)
                    .await
                    .map_err(|e| CloudError::Api(e.to_string()))?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn try_create_vm(
        &self,
        runner: &Runner,
        token: &str,
        org: &str,
        installer: &str,
    ) -> Result<String, CloudError> {
        let mut session = self.session.lock().await;
        self.ensure_authorized(&mut session).await?;

        let cloud_init = cloud_config::Data::from_registration(runner, token, org, installer);
        let user_data = cloud_init
            .to_user_data()
            .map_err(|e| CloudError::Api(e.to_string()))?;

        let cfg = &runner.vm_type.config;
        let ep = create_20::Request::builder()
            .server(
                create_20::ServerBuilder::default()
                    .name(&runner.name)
                    .image_ref(&cfg.image)
                    .flavor_ref(&cfg.flavor)
                    .networks(vec![
                        create_20::NetworksBuilder::default()
                            .uuid(&cfg.network)
                            .build()
                            .map_err(|e| CloudError::Api(e.to_string()))?,
                    ])
                    .key_name(&cfg.key_name)
                    .user_data(Some(Cow::Owned(BASE64_STANDARD.encode(user_data))))
                    .build()
                    .map_err(|e| CloudError::Api(e.to_string()))?,
            )
            .build()
            .map_err(|e| CloudError::Api(e.to_string()))?;

        let created: CreateServerResponse = ep
            .query_async(&*session)
            .await
            .map_err(|e| CloudError::Api(e.to_string()))?;

        let vm_id = created.id.clone();
        drop(session);

        self.wait_until_terminal(&vm_id).await?;
        Ok(vm_id)
    }

    async fn wait_until_terminal(&self, vm_id: &str) -> Result<(), CloudError> {
        loop {
            let session = self.session.lock().await;
            let ep = list_detailed::Request::builder()
                .build()
                .map_err(|e| CloudError::Api(e.to_string()))?;
            let servers: Vec<ListServerResponse> = ep
                .query_async(&*session)
                .await
                .map_err(|e| CloudError::Api(e.to_string()))?;
            drop(session);

            let Some(server) = servers.into_iter().find(|s| s.id == vm_id) else {
                return Err(CloudError::Api(format!("vm {vm_id} disappeared while booting")));
            };

            match server.status.as_deref() {
                Some("ACTIVE") => return Ok(()),
                Some("ERROR") => {
                    self.delete_vm(vm_id, None).await?;
                    return Err(CloudError::Api(format!("vm {vm_id} entered ERROR state")));
                }
                _ => sleep(POLL_INTERVAL).await,
            }
        }
    }
}

#[async_trait]
impl CloudClient for OpenStackCloudClient {
    #[instrument(skip(self, runner, token, installer), fields(runner = %runner.name, org = %org))]
    async fn create_vm(
        &self,
        runner: &Runner,
        token: &str,
        org: &str,
        installer: &str,
    ) -> Result<String, CloudError> {
        let mut last_err = None;
        for attempt in 1..=MAX_CREATE_ATTEMPTS {
            match self.try_create_vm(runner, token, org, installer).await {
                Ok(id) => return Ok(id),
                Err(e) => {
                    tracing::warn!(runner = %runner.name, attempt, error = %e, "vm creation attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| CloudError::Api("exhausted retries".into())))
    }

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    async fn delete_vm(&self, vm_id: &str, _image_hint: Option<&str>) -> Result<(), CloudError> {
        let mut session = self.session.lock().await;
        self.ensure_authorized(&mut session).await?;

        let ep = delete::Request::builder()
            .id(vm_id)
            .build()
            .map_err(|e| CloudError::Api(e.to_string()))?;

        match api::ignore(ep).query_async(&*session).await {
            Ok(_) => Ok(()),
            Err(e) => Err(CloudError::Api(e.to_string())),
        }
    }

    #[instrument(skip(self))]
    async fn list_vms(&self, name_prefix: &str) -> Result<Vec<CloudVm>, CloudError> {
        let mut session = self.session.lock().await;
        self.ensure_authorized(&mut session).await?;

        let ep = list_detailed::Request::builder()
            .build()
            .map_err(|e| CloudError::Api(e.to_string()))?;
        let servers: Vec<ListServerResponse> = ep
            .query_async(&*session)
            .await
            .map_err(|e| CloudError::Api(e.to_string()))?;

        Ok(servers
            .into_iter()
            .filter(|s| s.name.starts_with(name_prefix))
            .map(|s| CloudVm {
                id: s.id,
                name: s.name,
                status: s.status.unwrap_or_default(),
                created_at: s
                    .created
                    .as_deref()
                    .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
                    .map(|dt| dt.with_timezone(&Utc)),
            })
            .collect())
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// In-memory `CloudClient` used by reconciler tests. Every `create_vm`
    /// call succeeds immediately with a synthetic vm id unless configured to
    /// fail via `fail_creates`.
    #[derive(Default)]
    pub struct FakeCloudClient {
        pub created: StdMutex<Vec<String>>,
        pub deleted: StdMutex<Vec<String>>,
        pub fail_creates: std::sync::atomic::AtomicBool,
    }

    impl FakeCloudClient {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl CloudClient for FakeCloudClient {
        async fn create_vm(
            &self,
            runner: &Runner,
            _token: &str,
            _org: &str,
            _installer: &str,
        ) -> Result<String, CloudError> {
            if self.fail_creates.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(CloudError::Api("synthetic failure".into()));
            }
            let id = format!("vm-{}", runner.name);
            self.created.lock().unwrap().push(id.clone());
            Ok(id)
        }

        async fn delete_vm(&self, vm_id: &str, _image_hint: Option<&str>) -> Result<(), CloudError> {
            self.deleted.lock().unwrap().push(vm_id.to_string());
            Ok(())
        }

        async fn list_vms(&self, _name_prefix: &str) -> Result<Vec<CloudVm>, CloudError> {
            Ok(Vec::new())
        }
    }
}
