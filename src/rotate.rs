//! The rotation state machine.
//!
//! ```text
//! START -> RECONCILED -> FLIPPED -> REFRESHED -> VALIDATED -> OLD_ROTATED
//!       -> FINALIZED -> ADMIN_ROTATED -> DONE
//!
//! refresh/validation failure -> ROLLBACK (restore file, refresh, verify) -> FAILED
//! ```
//!
//! Mutations follow a strict order so a crash at any point leaves a state
//! the next run's reconciler can repair: the config file flips first, the
//! secret's passwords are persisted before `active_slot` moves, and the
//! admin is rotated only after everything else is durable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::configfile::SqlConf;
use crate::db::DbAdmin;
use crate::errors::RotateError;
use crate::health::HealthValidator;
use crate::reconcile::DriftReconciler;
use crate::refresh::ServiceRefresher;
use crate::secrets::{generate_password, AdminSecret, SecretStore, Slot, SlotSecret};

/// States of a rotation run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Start,
    Reconciled,
    Flipped,
    Refreshed,
    Validated,
    OldRotated,
    Finalized,
    AdminRotated,
    Done,
    Rollback,
    Failed,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            State::Start => "START",
            State::Reconciled => "RECONCILED",
            State::Flipped => "FLIPPED",
            State::Refreshed => "REFRESHED",
            State::Validated => "VALIDATED",
            State::OldRotated => "OLD_ROTATED",
            State::Finalized => "FINALIZED",
            State::AdminRotated => "ADMIN_ROTATED",
            State::Done => "DONE",
            State::Rollback => "ROLLBACK",
            State::Failed => "FAILED",
        })
    }
}

#[derive(Debug, Clone)]
pub struct RotateOptions {
    pub dry_run: bool,
    pub deploy_timeout: Duration,
}

/// Ephemeral record of one run. Never persisted; destroyed on exit.
#[derive(Debug)]
pub struct RotationRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub active_slot: Option<Slot>,
    pub standby_slot: Option<Slot>,
    pub steps: Vec<StepRecord>,
}

#[derive(Debug)]
pub struct StepRecord {
    pub state: State,
    pub outcome: String,
    pub duration: Duration,
}

impl RotationRun {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            active_slot: None,
            standby_slot: None,
            steps: Vec::new(),
        }
    }

    fn slot_from(&self) -> &'static str {
        self.active_slot.map(Slot::as_str).unwrap_or("-")
    }

    fn slot_to(&self) -> &'static str {
        self.standby_slot.map(Slot::as_str).unwrap_or("-")
    }
}

/// What the run ended as; the binary turns this into the terminal status
/// line and the process exit code.
#[derive(Debug)]
pub struct RotationOutcome {
    pub run: RotationRun,
    pub final_state: State,
    pub active_slot_at_exit: Option<Slot>,
    pub failed_step: Option<State>,
    pub error: Option<RotateError>,
    pub dry_run: bool,
    pub cancelled: bool,
}

impl RotationOutcome {
    pub fn exit_code(&self) -> u8 {
        match (&self.error, self.cancelled) {
            (Some(e), _) => e.exit_code(),
            // Cancelled before the flip: nothing this run did needs undoing.
            (None, true) => {
                if matches!(self.final_state, State::Reconciled) {
                    0
                } else {
                    1
                }
            }
            (None, false) => 0,
        }
    }

    pub fn status_line(&self) -> String {
        let slot = self
            .active_slot_at_exit
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".into());
        if let Some(e) = &self.error {
            let step = self
                .failed_step
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".into());
            format!("rotation FAILED at {step}: {e}; active slot {slot}")
        } else if self.cancelled {
            format!(
                "rotation cancelled at {}; active slot {slot}",
                self.final_state
            )
        } else if self.dry_run {
            format!("dry run OK; active slot {slot}; no mutations performed")
        } else {
            format!("rotation complete; active slot {slot}")
        }
    }
}

pub struct Rotator<'a> {
    secrets: &'a dyn SecretStore,
    db: &'a dyn DbAdmin,
    conf: &'a SqlConf,
    refresher: &'a dyn ServiceRefresher,
    health: &'a HealthValidator,
    opts: RotateOptions,
    shutdown: Arc<AtomicBool>,
}

impl<'a> Rotator<'a> {
    pub fn new(
        secrets: &'a dyn SecretStore,
        db: &'a dyn DbAdmin,
        conf: &'a SqlConf,
        refresher: &'a dyn ServiceRefresher,
        health: &'a HealthValidator,
        opts: RotateOptions,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            secrets,
            db,
            conf,
            refresher,
            health,
            opts,
            shutdown,
        }
    }

    pub async fn run(&self) -> RotationOutcome {
        let mut run = RotationRun::new();
        tracing::info!(
            event = %State::Start,
            run_id = %run.run_id,
            dry_run = self.opts.dry_run,
            "rotation run starting"
        );

        // RECONCILED
        let t = Instant::now();
        let reconciled = match DriftReconciler::new(
            self.secrets,
            self.db,
            self.conf,
            self.opts.dry_run,
        )
        .reconcile()
        .await
        {
            Ok(r) => {
                self.record(&mut run, State::Reconciled, t, "ok");
                r
            }
            Err(e) => {
                self.record(&mut run, State::Reconciled, t, "failed");
                return self.finish_failed(run, State::Reconciled, e, None);
            }
        };

        let active = reconciled.slot.active_slot;
        let standby = active.other();
        run.active_slot = Some(active);
        run.standby_slot = Some(standby);
        tracing::info!(
            event = "plan",
            slot_from = %active,
            slot_to = %standby,
            repairs = reconciled.repairs.len(),
            "canonical state established, flipping to standby"
        );

        let mut secret = reconciled.slot;
        let mut admin = reconciled.admin;

        // SIGTERM before the flip: nothing to undo, leave quietly.
        if self.cancelled() {
            return self.finish_cancelled(run, State::Reconciled, active);
        }

        // FLIPPED
        let t = Instant::now();
        if let Err(e) = self.flip(&secret, standby) {
            self.record(&mut run, State::Flipped, t, "failed");
            // The write is atomic: the file is either fully replaced or
            // untouched, so there is nothing to roll back.
            return self.finish_failed(run, State::Flipped, e, Some(active));
        }
        self.record(&mut run, State::Flipped, t, "ok");

        // REFRESHED
        let t = Instant::now();
        if self.opts.dry_run {
            self.record(&mut run, State::Refreshed, t, "skipped");
        } else {
            if let Err(e) = self.refresh_and_wait().await {
                self.record(&mut run, State::Refreshed, t, "failed");
                return self.rollback(run, State::Refreshed, e, &secret, active).await;
            }
            self.record(&mut run, State::Refreshed, t, "ok");
        }

        // VALIDATED
        let t = Instant::now();
        if let Err(e) = self.validate(&secret, standby).await {
            self.record(&mut run, State::Validated, t, "failed");
            if self.opts.dry_run {
                // Nothing was mutated; report the broken wiring directly.
                return self.finish_failed(run, State::Validated, e, Some(active));
            }
            return self.rollback(run, State::Validated, e, &secret, active).await;
        }
        self.record(&mut run, State::Validated, t, "ok");

        if self.opts.dry_run {
            tracing::info!(
                event = %State::Done,
                run_id = %run.run_id,
                slot_from = %active,
                slot_to = %standby,
                duration_ms = self.elapsed_ms(&run),
                outcome = "ok",
                dry_run = true,
                "dry run complete"
            );
            return RotationOutcome {
                run,
                final_state: State::Validated,
                active_slot_at_exit: Some(active),
                failed_step: None,
                error: None,
                dry_run: true,
                cancelled: false,
            };
        }

        if self.cancelled() {
            return self.finish_cancelled(run, State::Validated, standby);
        }

        // OLD_ROTATED. The retiring slot gets a fresh password, persisted
        // immediately while active_slot still names the old value.
        let fresh = generate_password();
        let t = Instant::now();
        if let Err(e) = self.rotate_old(&mut secret, active, &fresh, &admin).await {
            self.record(&mut run, State::OldRotated, t, "failed");
            return self.finish_failed(run, State::OldRotated, e, Some(standby));
        }
        self.record(&mut run, State::OldRotated, t, "ok");

        if self.cancelled() {
            return self.finish_cancelled(run, State::OldRotated, standby);
        }

        // FINALIZED
        let t = Instant::now();
        secret.active_slot = standby;
        if let Err(e) = self.secrets.put_slot_secret(&secret).await {
            self.record(&mut run, State::Finalized, t, "failed");
            return self.finish_failed(run, State::Finalized, e, Some(standby));
        }
        if let Err(e) = self.conf.remove_backup() {
            // The rotation itself is complete and consistent; a stale .bak
            // only wastes a few bytes on the mount.
            tracing::warn!(error = %e, "could not remove config backup");
        }
        self.record(&mut run, State::Finalized, t, "ok");

        if self.cancelled() {
            return self.finish_cancelled(run, State::Finalized, standby);
        }

        // ADMIN_ROTATED. The admin adopts the same fresh password that was
        // persisted for the retiring slot at OLD_ROTATED: if the put below
        // is lost, the next run's reconciler finds the working password by
        // probing the slot document (admin drift repair).
        let t = Instant::now();
        if let Err(e) = self.db.rotate_admin(&admin, &fresh).await {
            self.record(&mut run, State::AdminRotated, t, "failed");
            return self.finish_failed(run, State::AdminRotated, e, Some(standby));
        }
        admin.password = fresh;
        if let Err(e) = self.secrets.put_admin_secret(&admin).await {
            self.record(&mut run, State::AdminRotated, t, "failed");
            return self.finish_failed(run, State::AdminRotated, e, Some(standby));
        }
        self.record(&mut run, State::AdminRotated, t, "ok");

        tracing::info!(
            event = %State::Done,
            run_id = %run.run_id,
            slot_from = %active,
            slot_to = %standby,
            duration_ms = self.elapsed_ms(&run),
            outcome = "ok",
            "rotation complete"
        );
        RotationOutcome {
            run,
            final_state: State::Done,
            active_slot_at_exit: Some(standby),
            failed_step: None,
            error: None,
            dry_run: false,
            cancelled: false,
        }
    }

    // -- Steps --

    fn flip(&self, secret: &SlotSecret, standby: Slot) -> Result<(), RotateError> {
        let creds = secret.slot(standby);
        if self.opts.dry_run {
            tracing::info!(
                event = %State::Flipped,
                user = %creds.username,
                dry_run = true,
                "would rewrite config file for standby slot"
            );
            return Ok(());
        }
        let mut doc = self.conf.read()?;
        doc.apply_slot(creds)?;
        self.conf.write(&doc)?;
        Ok(())
    }

    async fn refresh_and_wait(&self) -> Result<(), RotateError> {
        let handle = self.refresher.refresh().await?;
        self.refresher
            .wait_stable(&handle, self.opts.deploy_timeout)
            .await
    }

    async fn validate(&self, secret: &SlotSecret, standby: Slot) -> Result<(), RotateError> {
        if !self
            .health
            .validate_db_as(self.db, secret.slot(standby))
            .await?
        {
            return Err(RotateError::ValidationFailed(format!(
                "database refused slot {standby} credentials after refresh"
            )));
        }
        if !self.health.validate_app().await? {
            return Err(RotateError::ValidationFailed(
                "application health probe failed after refresh".into(),
            ));
        }
        Ok(())
    }

    async fn rotate_old(
        &self,
        secret: &mut SlotSecret,
        old: Slot,
        fresh: &str,
        admin: &AdminSecret,
    ) -> Result<(), RotateError> {
        let username = secret.slot(old).username.clone();
        self.db.ensure_slot_user(admin, &username, fresh).await?;
        if !self.db.probe_auth(&username, fresh).await? {
            return Err(RotateError::AuthFailure(format!(
                "slot {old} user did not accept its freshly set password"
            )));
        }
        secret.slot_mut(old).password = fresh.to_owned();
        self.secrets.put_slot_secret(secret).await?;
        Ok(())
    }

    /// Undo the flip: restore the pre-run file, roll the fleet back onto
    /// it, and confirm the old slot still serves. No secret has been
    /// mutated when rollback is reachable, so this returns the system to
    /// its pre-run state.
    async fn rollback(
        &self,
        mut run: RotationRun,
        failed_step: State,
        error: RotateError,
        secret: &SlotSecret,
        active: Slot,
    ) -> RotationOutcome {
        tracing::warn!(
            event = %State::Rollback,
            step = %failed_step,
            slot_from = run.slot_from(),
            slot_to = run.slot_to(),
            "rolling back to pre-run config"
        );

        let t = Instant::now();
        let mut outcome = "ok";
        if let Err(e) = self.conf.restore_from_backup() {
            tracing::error!(error = %e, "rollback could not restore config from backup");
            outcome = "restore_failed";
        } else {
            if let Err(e) = self.refresh_and_wait().await {
                tracing::error!(error = %e, "rollback refresh did not stabilize");
                outcome = "refresh_failed";
            }
            match self.health.validate_db_as(self.db, secret.slot(active)).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::error!("rollback validation: old slot credentials refused");
                    outcome = "validate_failed";
                }
                Err(e) => {
                    tracing::error!(error = %e, "rollback validation errored");
                    outcome = "validate_failed";
                }
            }
        }
        self.record(&mut run, State::Rollback, t, outcome);
        self.finish_failed(run, failed_step, error, Some(active))
    }

    // -- Bookkeeping --

    fn cancelled(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn elapsed_ms(&self, run: &RotationRun) -> i64 {
        (Utc::now() - run.started_at).num_milliseconds()
    }

    fn record(&self, run: &mut RotationRun, state: State, started: Instant, outcome: &str) {
        let duration = started.elapsed();
        tracing::info!(
            event = %state,
            run_id = %run.run_id,
            slot_from = run.slot_from(),
            slot_to = run.slot_to(),
            duration_ms = duration.as_millis() as u64,
            outcome,
            dry_run = self.opts.dry_run,
            "state transition"
        );
        run.steps.push(StepRecord {
            state,
            outcome: outcome.to_owned(),
            duration,
        });
    }

    fn finish_failed(
        &self,
        run: RotationRun,
        failed_step: State,
        error: RotateError,
        active_slot_at_exit: Option<Slot>,
    ) -> RotationOutcome {
        tracing::error!(
            event = %State::Failed,
            run_id = %run.run_id,
            step = %failed_step,
            duration_ms = self.elapsed_ms(&run),
            error = %error,
            "rotation failed"
        );
        RotationOutcome {
            run,
            final_state: State::Failed,
            active_slot_at_exit,
            failed_step: Some(failed_step),
            error: Some(error),
            dry_run: self.opts.dry_run,
            cancelled: false,
        }
    }

    fn finish_cancelled(
        &self,
        run: RotationRun,
        state: State,
        active_slot_at_exit: Slot,
    ) -> RotationOutcome {
        tracing::warn!(
            event = "cancelled",
            run_id = %run.run_id,
            state = %state,
            "termination signal received, stopping at step boundary"
        );
        RotationOutcome {
            run,
            final_state: state,
            active_slot_at_exit: Some(active_slot_at_exit),
            failed_step: None,
            error: None,
            dry_run: self.opts.dry_run,
            cancelled: true,
        }
    }
}
