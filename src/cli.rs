use clap::Parser;

/// credrotate — dual-slot DB credential rotation for OpenEMR on ECS
///
/// Runs as a one-off task: reconciles drift, flips the shared sqlconf.php
/// to the standby slot, rolls the service, then rotates the retired slot
/// and the admin password. All connection parameters come from the
/// environment (see README / task definition).
#[derive(Parser, Debug)]
#[command(name = "credrotate", version, about)]
pub struct Cli {
    /// Walk the state machine up to validation without mutating anything;
    /// the service refresh is skipped entirely.
    #[arg(long)]
    pub dry_run: bool,

    /// Emit structured JSON log records to stdout.
    #[arg(long)]
    pub log_json: bool,

    /// Only reconcile DB users against the secret (bootstrap missing slot
    /// users, repair drifted passwords) and exit. No flip, no refresh.
    #[arg(long, conflicts_with = "fix_permissions")]
    pub sync_db_users: bool,

    /// Only repair ownership/mode of the shared config file and exit.
    #[arg(long, conflicts_with = "sync_db_users")]
    pub fix_permissions: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_invocation_is_full_rotation() {
        let cli = Cli::parse_from(["credrotate"]);
        assert!(!cli.dry_run);
        assert!(!cli.sync_db_users);
        assert!(!cli.fix_permissions);
    }

    #[test]
    fn maintenance_modes_are_mutually_exclusive() {
        let err = Cli::try_parse_from(["credrotate", "--sync-db-users", "--fix-permissions"]);
        assert!(err.is_err());
    }

    #[test]
    fn dry_run_combines_with_json_logging() {
        let cli = Cli::parse_from(["credrotate", "--dry-run", "--log-json"]);
        assert!(cli.dry_run);
        assert!(cli.log_json);
    }
}
