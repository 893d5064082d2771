//! Startup drift repair across the four authorities: secret store, live DB
//! users, shared config file, and (implicitly) the running fleet.
//!
//! The reconciler runs before every rotation and may mutate any authority.
//! After it returns, the canonical invariant holds: `active_slot` names the
//! slot the config file points at, and both slots' stored passwords
//! authenticate their DB users. The main algorithm never has to ask "what
//! state am I in?".

use std::fmt;

use crate::configfile::SqlConf;
use crate::db::DbAdmin;
use crate::errors::RotateError;
use crate::secrets::{AdminSecret, SecretStore, Slot, SlotSecret};

/// Canonical state established by [`DriftReconciler::reconcile`].
pub struct Reconciled {
    /// Admin credentials known to authenticate (possibly adopted).
    pub admin: AdminSecret,
    /// Slot document with `active_slot` aligned to the config file.
    pub slot: SlotSecret,
    /// Human-readable record of every repair performed, for logging and
    /// for idempotence assertions in tests.
    pub repairs: Vec<String>,
}

impl fmt::Debug for Reconciled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciled")
            .field("admin", &self.admin)
            .field("slot", &self.slot)
            .field("repairs", &self.repairs)
            .finish()
    }
}

pub struct DriftReconciler<'a> {
    secrets: &'a dyn SecretStore,
    db: &'a dyn DbAdmin,
    conf: &'a SqlConf,
    dry_run: bool,
}

impl<'a> DriftReconciler<'a> {
    pub fn new(
        secrets: &'a dyn SecretStore,
        db: &'a dyn DbAdmin,
        conf: &'a SqlConf,
        dry_run: bool,
    ) -> Self {
        Self {
            secrets,
            db,
            conf,
            dry_run,
        }
    }

    /// Full reconcile: admin adoption, slot bootstrap/repair, then
    /// `active_slot` alignment against the config file.
    pub async fn reconcile(&self) -> Result<Reconciled, RotateError> {
        let mut r = self.sync_users().await?;

        // The file reflects what the replicas are actually using; when the
        // marker disagrees, the marker is the stale party. The file itself
        // is never touched here.
        let doc = self.conf.read()?;
        let file_user = doc.user()?;
        let file_slot = r.slot.slot_for_username(&file_user).ok_or_else(|| {
            RotateError::ConfigCorrupt(format!(
                "config file user {file_user} matches neither slot username"
            ))
        })?;
        if file_slot != r.slot.active_slot {
            tracing::warn!(
                event = "reconcile.active_slot",
                slot_from = %r.slot.active_slot,
                slot_to = %file_slot,
                dry_run = self.dry_run,
                "active_slot marker disagrees with config file, adopting file"
            );
            r.slot.active_slot = file_slot;
            if !self.dry_run {
                self.secrets.put_slot_secret(&r.slot).await?;
            }
            r.repairs
                .push(format!("active_slot aligned to config file ({file_slot})"));
        }

        Ok(r)
    }

    /// Steps 1–3 only: admin-password drift, slot-user bootstrap, and
    /// slot-password drift. This is the whole of `--sync-db-users`.
    pub async fn sync_users(&self) -> Result<Reconciled, RotateError> {
        let mut admin = self.secrets.get_admin_secret().await?;
        let slot = self.secrets.get_slot_secret().await?;
        slot.validate()?;

        let mut repairs = Vec::new();

        // 1. Admin-password drift. A prior run may have altered the admin
        //    in the DB and crashed before persisting the secret; the slot
        //    passwords are the only durable candidates for what it chose.
        if !self.db.probe_auth(&admin.username, &admin.password).await? {
            tracing::warn!(
                event = "reconcile.admin_drift",
                user = %admin.username,
                "stored admin password refused, probing slot passwords as candidates"
            );
            let mut adopted = None;
            for s in [Slot::A, Slot::B] {
                let candidate = &slot.slot(s).password;
                if self.db.probe_auth(&admin.username, candidate).await? {
                    adopted = Some((s, candidate.clone()));
                    break;
                }
            }
            let Some((from, password)) = adopted else {
                return Err(RotateError::AdminCredentialsLost(
                    "stored admin password does not authenticate and neither slot \
                     password works for the admin user; manual repair required"
                        .into(),
                ));
            };
            admin.password = password;
            if !self.dry_run {
                self.secrets.put_admin_secret(&admin).await?;
            }
            tracing::info!(
                event = "reconcile.admin_adopted",
                slot_from = %from,
                dry_run = self.dry_run,
                "adopted working admin password"
            );
            repairs.push(format!("admin password adopted from slot {from}"));
        }

        // 2 + 3. Slot-user bootstrap and slot-password drift. The secret is
        //    the source of truth between runs: the DB is made to match it.
        for s in [Slot::A, Slot::B] {
            let creds = slot.slot(s);
            if !self.db.slot_user_exists(&admin, &creds.username).await? {
                tracing::info!(
                    event = "reconcile.bootstrap",
                    slot = %s,
                    user = %creds.username,
                    dry_run = self.dry_run,
                    "slot user missing, creating"
                );
                if !self.dry_run {
                    self.db
                        .ensure_slot_user(&admin, &creds.username, &creds.password)
                        .await?;
                }
                repairs.push(format!("slot {s} user {} created", creds.username));
            } else if !self.db.probe_auth(&creds.username, &creds.password).await? {
                tracing::warn!(
                    event = "reconcile.slot_drift",
                    slot = %s,
                    user = %creds.username,
                    dry_run = self.dry_run,
                    "stored password refused by DB, repairing user to match secret"
                );
                if !self.dry_run {
                    self.db
                        .ensure_slot_user(&admin, &creds.username, &creds.password)
                        .await?;
                }
                repairs.push(format!("slot {s} password repaired to match secret"));
            }
        }

        Ok(Reconciled {
            admin,
            slot,
            repairs,
        })
    }
}
