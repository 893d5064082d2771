//! Post-refresh validation: DB reachability per slot and an optional
//! application probe over HTTPS.

use std::time::Duration;

use crate::db::DbAdmin;
use crate::errors::RotateError;
use crate::secrets::SlotCredentials;

const APP_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HealthValidator {
    http: reqwest::Client,
    app_url: Option<String>,
}

impl HealthValidator {
    pub fn new(app_url: Option<String>) -> Self {
        // Redirects are not followed: the application answers a healthy
        // probe with a 302 to its login page, and that must count as up.
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(APP_PROBE_TIMEOUT)
            .connect_timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("failed to build HTTP client");
        Self { http, app_url }
    }

    /// End-to-end DB check with one slot's credentials.
    pub async fn validate_db_as(
        &self,
        db: &dyn DbAdmin,
        creds: &SlotCredentials,
    ) -> Result<bool, RotateError> {
        let healthy = db.healthcheck(creds).await?;
        tracing::info!(user = %creds.username, healthy, "database validation");
        Ok(healthy)
    }

    /// Single GET against the configured health URL; 2xx and 3xx are
    /// healthy. Returns `Ok(true)` when no URL is configured.
    pub async fn validate_app(&self) -> Result<bool, RotateError> {
        let Some(url) = &self.app_url else {
            tracing::info!("no healthcheck URL configured, skipping app probe");
            return Ok(true);
        };

        let status = match self.http.get(url).send().await {
            Ok(resp) => resp.status(),
            Err(e) => {
                tracing::warn!(url = %url, "app probe failed to connect: {}", e);
                return Ok(false);
            }
        };
        let healthy = status.is_success() || status.is_redirection();
        tracing::info!(url = %url, status = status.as_u16(), healthy, "application validation");
        Ok(healthy)
    }
}
