use async_trait::async_trait;
use octocrab::Octocrab;
use thiserror::Error;
use tracing::instrument;

use crate::runner::ObservedStatus;

#[derive(Debug, Error)]
pub enum HostedCiError {
    #[error("transient network error: {0}")]
    Transient(String),

    #[error("hosted-CI API error: {0}")]
    Api(String),
}

/// A single runner as reported by the hosted-CI service's runner listing.
#[derive(Clone, Debug)]
pub struct Observation {
    pub name: String,
    pub id: i64,
    pub status: ObservedStatus,
    pub busy: bool,
    pub labels: Vec<String>,
}

/// Polymorphic interface over the hosted-CI service. The only concrete
/// implementation shipped is GitHub Actions, via `octocrab`.
#[async_trait]
pub trait HostedCiClient: Send + Sync {
    async fn download_link(&self, arch: &str) -> Result<String, HostedCiError>;

    /// Short-lived (~1h) token used as the runner's registration argument.
    async fn mint_registration_token(&self) -> Result<String, HostedCiError>;

    async fn list_runners(&self) -> Result<Vec<Observation>, HostedCiError>;

    /// Idempotent on absence; fails with an API error otherwise.
    async fn force_delete(&self, action_id: i64) -> Result<(), HostedCiError>;
}

pub struct GitHubHostedCiClient {
    org: String,
    token: String,
}

impl GitHubHostedCiClient {
    pub fn new(org: String, token: String) -> Self {
        Self { org, token }
    }

    fn client(&self) -> Result<Octocrab, HostedCiError> {
        Octocrab::builder()
            .personal_token(self.token.clone())
            .build()
            .map_err(|e| HostedCiError::Api(e.to_string()))
    }
}

#[async_trait]
impl HostedCiClient for GitHubHostedCiClient {
    #[instrument(skip(self), fields(org = %self.org, arch = %arch))]
    async fn download_link(&self, arch: &str) -> Result<String, HostedCiError> {
        let octocrab = self.client()?;
        let path = format!("/orgs/{}/actions/runners/downloads", self.org);
        let assets: Vec<serde_json::Value> = octocrab
            .get(path, None::<&()>)
            .await
            .map_err(|e| HostedCiError::Api(e.to_string()))?;

        assets
            .into_iter()
            .find(|asset| {
                asset.get("os").and_then(|v| v.as_str()) == Some("linux")
                    && asset.get("architecture").and_then(|v| v.as_str()) == Some(arch)
            })
            .and_then(|asset| asset.get("download_url").and_then(|v| v.as_str()).map(String::from))
            .ok_or_else(|| HostedCiError::Api("no matching installer asset".into()))
    }

    #[instrument(skip(self), fields(org = %self.org))]
    async fn mint_registration_token(&self) -> Result<String, HostedCiError> {
        let octocrab = self.client()?;
        let path = format!("/orgs/{}/actions/runners/registration-token", self.org);
        let response: serde_json::Value = octocrab
            .post(path, None::<&()>)
            .await
            .map_err(|e| HostedCiError::Api(e.to_string()))?;

        response
            .get("token")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| HostedCiError::Api("registration-token response missing token field".into()))
    }

    #[instrument(skip(self), fields(org = %self.org))]
    async fn list_runners(&self) -> Result<Vec<Observation>, HostedCiError> {
        let octocrab = self.client()?;
        let mut observations = Vec::new();

        let mut page = octocrab
            .actions()
            .list_org_self_hosted_runners(&self.org)
            .send()
            .await
            .map_err(|e| HostedCiError::Api(e.to_string()))?;

        loop {
            for runner in &page.items {
                let status = match runner.status.as_str() {
                    "online" => ObservedStatus::Online,
                    _ => ObservedStatus::Offline,
                };
                observations.push(Observation {
                    name: runner.name.clone(),
                    id: runner.id.0 as i64,
                    status,
                    busy: runner.busy,
                    labels: runner.labels.iter().map(|l| l.name.clone()).collect(),
                });
            }

            page = match octocrab
                .get_page(&page.next)
                .await
                .map_err(|e| HostedCiError::Api(e.to_string()))?
            {
                Some(next_page) => next_page,
                None => break,
            };
        }

        Ok(observations)
    }

    #[instrument(skip(self), fields(org = %self.org, action_id = action_id))]
    async fn force_delete(&self, action_id: i64) -> Result<(), HostedCiError> {
        let octocrab = self.client()?;
        match octocrab
            .actions()
            .delete_org_runner(&self.org, octocrab::models::RunnerId(action_id as u64))
            .await
        {
            Ok(_) => Ok(()),
            Err(octocrab::Error::GitHub { source, .. }) if source.status_code.as_u16() == 404 => {
                Ok(())
            }
            Err(e) => Err(HostedCiError::Api(e.to_string())),
        }
    }
}
