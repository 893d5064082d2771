//! AWS Secrets Manager implementation of [`SecretStore`].
//!
//! Each get records the version id it observed; a later put re-reads the
//! current version and refuses to write over a version it did not read.
//! The launcher-level task lock is the primary guard against concurrent
//! rotations; this check is the secondary defense.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_secretsmanager::error::{DisplayErrorContext, SdkError};
use aws_sdk_secretsmanager::operation::get_secret_value::GetSecretValueOutput;
use aws_sdk_secretsmanager::Client;

use super::{AdminSecret, SecretStore, SlotSecret};
use crate::errors::RotateError;
use crate::retry::with_backoff;

const SECRET_OP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SecretsManagerStore {
    client: Client,
    slot_secret_id: String,
    admin_secret_id: String,
    slot_version: Mutex<Option<String>>,
    admin_version: Mutex<Option<String>>,
}

impl SecretsManagerStore {
    pub fn new(sdk_config: &aws_config::SdkConfig, slot_secret_id: &str, admin_secret_id: &str) -> Self {
        Self {
            client: Client::new(sdk_config),
            slot_secret_id: slot_secret_id.to_owned(),
            admin_secret_id: admin_secret_id.to_owned(),
            slot_version: Mutex::new(None),
            admin_version: Mutex::new(None),
        }
    }

    async fn fetch(&self, id: &str) -> Result<GetSecretValueOutput, RotateError> {
        with_backoff("secretsmanager.get", || async {
            let fut = self.client.get_secret_value().secret_id(id).send();
            match tokio::time::timeout(SECRET_OP_TIMEOUT, fut).await {
                Ok(Ok(out)) => Ok(out),
                Ok(Err(e)) => Err(classify("get secret value", e)),
                Err(_) => Err(RotateError::TransientIo(
                    "secret store request timed out".into(),
                )),
            }
        })
        .await
    }

    /// Version-checked write. The pre-write read catches a concurrent
    /// writer; the put itself is durable on return (write-through).
    async fn put(
        &self,
        id: &str,
        body: String,
        version: &Mutex<Option<String>>,
    ) -> Result<(), RotateError> {
        let expected = version.lock().expect("version lock poisoned").clone();
        if let Some(expected) = &expected {
            let current = self.fetch(id).await?;
            if current.version_id() != Some(expected.as_str()) {
                return Err(RotateError::Conflict(format!(
                    "secret {id} was written by another actor since this run read it"
                )));
            }
        }

        let out = with_backoff("secretsmanager.put", || {
            let body = body.clone();
            async move {
                let fut = self
                    .client
                    .put_secret_value()
                    .secret_id(id)
                    .secret_string(body)
                    .send();
                match tokio::time::timeout(SECRET_OP_TIMEOUT, fut).await {
                    Ok(Ok(out)) => Ok(out),
                    Ok(Err(e)) => Err(classify("put secret value", e)),
                    Err(_) => Err(RotateError::TransientIo(
                        "secret store request timed out".into(),
                    )),
                }
            }
        })
        .await?;

        *version.lock().expect("version lock poisoned") = out.version_id().map(str::to_owned);
        Ok(())
    }
}

#[async_trait]
impl SecretStore for SecretsManagerStore {
    async fn get_slot_secret(&self) -> Result<SlotSecret, RotateError> {
        let out = self.fetch(&self.slot_secret_id).await?;
        *self.slot_version.lock().expect("version lock poisoned") =
            out.version_id().map(str::to_owned);
        let body = out.secret_string().ok_or_else(|| {
            RotateError::SecretUnavailable("slot secret has no string payload".into())
        })?;
        let doc: SlotSecret = serde_json::from_str(body)?;
        Ok(doc)
    }

    async fn put_slot_secret(&self, doc: &SlotSecret) -> Result<(), RotateError> {
        let body = serde_json::to_string(doc)?;
        self.put(&self.slot_secret_id, body, &self.slot_version).await
    }

    async fn get_admin_secret(&self) -> Result<AdminSecret, RotateError> {
        let out = self.fetch(&self.admin_secret_id).await?;
        *self.admin_version.lock().expect("version lock poisoned") =
            out.version_id().map(str::to_owned);
        let body = out.secret_string().ok_or_else(|| {
            RotateError::SecretUnavailable("admin secret has no string payload".into())
        })?;
        let doc: AdminSecret = serde_json::from_str(body)?;
        Ok(doc)
    }

    async fn put_admin_secret(&self, doc: &AdminSecret) -> Result<(), RotateError> {
        let body = serde_json::to_string(doc)?;
        self.put(&self.admin_secret_id, body, &self.admin_version)
            .await
    }
}

/// Network-shaped SDK failures are retryable; service-level failures
/// (missing secret, denied access) are not.
fn classify<E, R>(context: &str, err: SdkError<E, R>) -> RotateError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let detail = format!("{context}: {}", DisplayErrorContext(&err));
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            RotateError::TransientIo(detail)
        }
        _ => RotateError::SecretUnavailable(detail),
    }
}
