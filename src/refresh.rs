//! Rolling refresh of the replica fleet via the orchestrator.
//!
//! The task definition is unchanged; a forced new deployment makes every
//! replica restart and re-read `sqlconf.php` from the shared mount.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_ecs::error::{DisplayErrorContext, SdkError};
use aws_sdk_ecs::types::DeploymentRolloutState;
use aws_sdk_ecs::Client;

use crate::errors::RotateError;
use crate::retry::with_backoff;

const POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Identifies one rolling deployment started by [`ServiceRefresher::refresh`].
#[derive(Debug, Clone)]
pub struct DeploymentHandle {
    pub deployment_id: String,
}

#[async_trait]
pub trait ServiceRefresher: Send + Sync {
    /// Start a rolling redeploy of the replica service.
    async fn refresh(&self) -> Result<DeploymentHandle, RotateError>;

    /// Block until the deployment reaches steady state with all tasks
    /// healthy, or fail with [`RotateError::DeploymentTimeout`].
    async fn wait_stable(
        &self,
        handle: &DeploymentHandle,
        timeout: Duration,
    ) -> Result<(), RotateError>;
}

pub struct EcsRefresher {
    client: Client,
    cluster: String,
    service: String,
}

impl EcsRefresher {
    pub fn new(sdk_config: &aws_config::SdkConfig, cluster: &str, service: &str) -> Self {
        Self {
            client: Client::new(sdk_config),
            cluster: cluster.to_owned(),
            service: service.to_owned(),
        }
    }

    /// One stability poll. `Ok(true)` when the target deployment is PRIMARY,
    /// fully rolled out and the service is at its desired count.
    async fn poll_stable(&self, deployment_id: &str) -> Result<bool, RotateError> {
        let out = with_backoff("ecs.describe_services", || async {
            self.client
                .describe_services()
                .cluster(&self.cluster)
                .services(&self.service)
                .send()
                .await
                .map_err(|e| classify("describe ECS service", e))
        })
        .await?;

        let Some(service) = out.services().first() else {
            return Err(RotateError::TransientIo(format!(
                "ECS service {} not found in cluster {}",
                self.service, self.cluster
            )));
        };

        let Some(deployment) = service
            .deployments()
            .iter()
            .find(|d| d.id() == Some(deployment_id))
        else {
            // Our deployment has been superseded; treat as not-yet-stable
            // and let the timeout decide.
            tracing::warn!(deployment_id, "deployment no longer reported by ECS");
            return Ok(false);
        };

        let settled = match deployment.rollout_state() {
            Some(DeploymentRolloutState::Completed) => true,
            Some(DeploymentRolloutState::Failed) => {
                return Err(RotateError::ValidationFailed(format!(
                    "ECS reports deployment {deployment_id} failed: {}",
                    deployment.rollout_state_reason().unwrap_or("no reason given")
                )));
            }
            // Circuit breaker disabled: fall back to task counts.
            _ => {
                service.deployments().len() == 1
                    && deployment.running_count() == deployment.desired_count()
                    && deployment.failed_tasks() == 0
            }
        };

        let at_capacity = service.running_count() == service.desired_count();
        tracing::debug!(
            deployment_id,
            running = service.running_count(),
            desired = service.desired_count(),
            settled,
            "stability poll"
        );
        Ok(settled && at_capacity)
    }
}

#[async_trait]
impl ServiceRefresher for EcsRefresher {
    async fn refresh(&self) -> Result<DeploymentHandle, RotateError> {
        let out = with_backoff("ecs.update_service", || async {
            self.client
                .update_service()
                .cluster(&self.cluster)
                .service(&self.service)
                .force_new_deployment(true)
                .send()
                .await
                .map_err(|e| classify("force new ECS deployment", e))
        })
        .await?;

        let deployment_id = out
            .service()
            .and_then(|s| s.deployments().first())
            .and_then(|d| d.id())
            .ok_or_else(|| {
                RotateError::TransientIo(
                    "ECS accepted the update but returned no deployment id".into(),
                )
            })?
            .to_owned();

        tracing::info!(
            cluster = %self.cluster,
            service = %self.service,
            deployment_id = %deployment_id,
            "rolling deployment started"
        );
        Ok(DeploymentHandle { deployment_id })
    }

    async fn wait_stable(
        &self,
        handle: &DeploymentHandle,
        timeout: Duration,
    ) -> Result<(), RotateError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.poll_stable(&handle.deployment_id).await? {
                tracing::info!(deployment_id = %handle.deployment_id, "service stable");
                return Ok(());
            }
            if tokio::time::Instant::now() + POLL_INTERVAL > deadline {
                return Err(RotateError::DeploymentTimeout(timeout));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn classify<E, R>(context: &str, err: SdkError<E, R>) -> RotateError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    RotateError::TransientIo(format!("{context}: {}", DisplayErrorContext(&err)))
}
