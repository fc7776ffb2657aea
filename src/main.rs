mod cloud;
mod cloud_config;
mod config;
mod factory;
mod hosted_ci;
mod metrics_exporter;
mod pool_controller;
mod reconciler;
mod runner;
mod store;
mod vm_type;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use axum_github_hooks::GithubWebhook;
use metrics_exporter_prometheus::PrometheusHandle;
use octocrab::models::webhook_events::{WebhookEvent, WebhookEventPayload};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cloud::{CloudClient, OpenStackCloudClient};
use crate::config::Config;
use crate::factory::Factory;
use crate::hosted_ci::{GitHubHostedCiClient, HostedCiClient, Observation};
use crate::reconciler::Reconciler;
use crate::runner::ObservedStatus;
use crate::store::{RedisStore, Store};

#[derive(Clone)]
struct AppState {
    reconciler: Arc<Reconciler>,
    metrics_handle: PrometheusHandle,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(EnvFilter::from_default_env())
        .init();

    let metrics_handle = metrics_exporter::install().context("failed to install metrics recorder")?;

    let config = Config::load().context("failed to load configuration")?;

    let store: Arc<dyn Store> = Arc::new(
        RedisStore::connect(&config.redis_url)
            .await
            .context("failed to connect to redis store")?,
    );
    let cloud: Arc<dyn CloudClient> = Arc::new(
        OpenStackCloudClient::connect(&config.cloud)
            .await
            .context("failed to establish openstack session")?,
    );
    let hosted_ci: Arc<dyn HostedCiClient> = Arc::new(GitHubHostedCiClient::new(
        config.github_organization.clone(),
        config.github_token.clone(),
    ));

    let vm_types = config.runner_pool.iter().cloned().map(Into::into).collect();

    let factory = Arc::new(Factory::new(
        Arc::clone(&store),
        Arc::clone(&cloud),
        Arc::clone(&hosted_ci),
        &config.cloud,
        &config.github_organization,
    ));

    let reconciler = Arc::new(Reconciler::new(
        vm_types,
        factory,
        Arc::clone(&store),
        Arc::clone(&hosted_ci),
        config.extra_runner_timer.to_duration(),
        config.timeout_runner_timer.to_duration(),
    ));

    reconciler
        .seed()
        .await
        .context("failed to seed runner registry from store")?;

    {
        let reconciler = Arc::clone(&reconciler);
        let tick_interval = std::time::Duration::from_secs(config.tick_interval_secs);
        tokio::spawn(async move {
            loop {
                reconciler.tick().await;
                tokio::time::sleep(tick_interval).await;
            }
        });
    }

    let state = AppState {
        reconciler: Arc::clone(&reconciler),
        metrics_handle,
    };

    let app = Router::new()
        .route("/webhook", post(webhook))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.http_bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind_addr))?;

    tracing::info!(addr = %config.http_bind_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutdown signal received, draining runner pool");
    reconciler.drain().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Turns a `workflow_job` delivery into a single-runner [`Observation`] and
/// pushes it straight to the matching pool instead of waiting out the rest of
/// the poll interval. Deliveries that aren't actionable (no runner assigned
/// yet, or an event type other than `workflow_job`) are logged and ignored.
async fn webhook(State(state): State<AppState>, GithubWebhook(event): GithubWebhook) -> impl IntoResponse {
    match observation_from_workflow_job(&event) {
        Some(observation) => {
            let reconciler = Arc::clone(&state.reconciler);
            tokio::spawn(async move {
                reconciler.push_observation(observation).await;
            });
        }
        None => {
            tracing::debug!(?event, "ignoring webhook delivery with no actionable runner observation");
        }
    }
    StatusCode::OK
}

/// Maps a `workflow_job` webhook's runner fields onto this pool's runner
/// observation shape. `workflow_job` doesn't carry a `busy` flag the way the
/// runner-listing API does, so it's derived from `status`: a job that just
/// started running means its runner is busy, one that just finished means
/// it's idle again. A `queued` job has no runner assigned yet and yields no
/// observation.
fn observation_from_workflow_job(event: &WebhookEvent) -> Option<Observation> {
    let WebhookEventPayload::WorkflowJob(payload) = &event.specific else {
        return None;
    };
    let job = &payload.workflow_job;
    let name = job.runner_name.clone()?;
    let id = job.runner_id?;
    let (status, busy) = match job.status.to_string().as_str() {
        "in_progress" => (ObservedStatus::Online, true),
        "completed" => (ObservedStatus::Offline, false),
        _ => return None,
    };

    Some(Observation {
        name,
        id,
        status,
        busy,
        labels: job.labels.clone(),
    })
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.reconciler.healthcheck().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics_handle.render(),
    )
}
