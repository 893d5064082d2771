use std::path::PathBuf;
use std::time::Duration;

use crate::errors::RotateError;

/// Runtime configuration, read from the environment before any side effect.
#[derive(Debug, Clone)]
pub struct Config {
    /// Secrets Manager id of the dual-slot secret document.
    pub slot_secret_id: String,
    /// Secrets Manager id of the DB admin secret.
    pub admin_secret_id: String,
    /// Mount root of the shared sites volume; the config file lives at
    /// `<root>/default/sqlconf.php`.
    pub sites_mount_root: PathBuf,
    /// ECS cluster and service to roll after a flip.
    pub ecs_cluster: String,
    pub ecs_service: String,
    /// Optional post-refresh application probe.
    pub healthcheck_url: Option<String>,
    /// Region override; when unset the SDK default chain decides.
    pub aws_region: Option<String>,
    /// Ownership to enforce on the config file. When unset only the mode
    /// is enforced, which lets non-root operators and the test suite run
    /// the same code path.
    pub file_uid: Option<u32>,
    pub file_gid: Option<u32>,
    /// How long to wait for the service to stabilize after a refresh.
    pub deploy_timeout: Duration,
}

impl Config {
    pub fn sqlconf_path(&self) -> PathBuf {
        self.sites_mount_root.join("default").join("sqlconf.php")
    }
}

pub fn load() -> Result<Config, RotateError> {
    dotenvy::dotenv().ok();

    Ok(Config {
        slot_secret_id: required("RDS_SLOT_SECRET_ID")?,
        admin_secret_id: required("RDS_ADMIN_SECRET_ID")?,
        sites_mount_root: PathBuf::from(required("OPENEMR_SITES_MOUNT_ROOT")?),
        ecs_cluster: required("OPENEMR_ECS_CLUSTER")?,
        ecs_service: required("OPENEMR_ECS_SERVICE")?,
        healthcheck_url: optional("OPENEMR_HEALTHCHECK_URL"),
        aws_region: optional("AWS_REGION"),
        file_uid: parse_optional("OPENEMR_FILE_UID")?,
        file_gid: parse_optional("OPENEMR_FILE_GID")?,
        deploy_timeout: Duration::from_secs(
            parse_optional("ROTATE_DEPLOY_TIMEOUT_SECS")?.unwrap_or(1200),
        ),
    })
}

fn required(name: &str) -> Result<String, RotateError> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(RotateError::Usage(format!(
            "required environment variable {name} is not set"
        ))),
    }
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_optional<T: std::str::FromStr>(name: &str) -> Result<Option<T>, RotateError> {
    match optional(name) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| {
            RotateError::Usage(format!("environment variable {name} has invalid value: {raw}"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_required_var_is_usage_error() {
        // Env-var tests share a process; use a name nothing else reads.
        std::env::remove_var("RDS_SLOT_SECRET_ID_TEST_PROBE");
        let err = required("RDS_SLOT_SECRET_ID_TEST_PROBE").unwrap_err();
        assert!(matches!(err, RotateError::Usage(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn numeric_vars_reject_garbage() {
        std::env::set_var("CREDROTATE_TEST_UID", "not-a-number");
        let err = parse_optional::<u32>("CREDROTATE_TEST_UID").unwrap_err();
        assert!(matches!(err, RotateError::Usage(_)));
        std::env::remove_var("CREDROTATE_TEST_UID");
    }

    #[test]
    fn sqlconf_path_is_under_default_site() {
        let cfg = Config {
            slot_secret_id: "s".into(),
            admin_secret_id: "a".into(),
            sites_mount_root: PathBuf::from("/mnt/sites"),
            ecs_cluster: "c".into(),
            ecs_service: "svc".into(),
            healthcheck_url: None,
            aws_region: None,
            file_uid: None,
            file_gid: None,
            deploy_timeout: Duration::from_secs(1200),
        };
        assert_eq!(
            cfg.sqlconf_path(),
            PathBuf::from("/mnt/sites/default/sqlconf.php")
        );
    }
}
