//! In-process fakes for the rotation scenario tests: a secret store, a
//! MySQL server's view of its users, and an orchestrator. Each records the
//! calls the engine makes so tests can assert on write counts and ordering.

// Shared by several test crates; not every crate uses every fake.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use credrotate::db::DbAdmin;
use credrotate::errors::RotateError;
use credrotate::refresh::{DeploymentHandle, ServiceRefresher};
use credrotate::secrets::{AdminSecret, SecretStore, Slot, SlotCredentials, SlotSecret};

pub const DB_HOST: &str = "db.test.internal";
pub const ADMIN_USER: &str = "dbadmin";

pub fn creds(username: &str, password: &str) -> SlotCredentials {
    SlotCredentials {
        username: username.into(),
        password: password.into(),
        host: DB_HOST.into(),
        port: "3306".into(),
        dbname: "openemr".into(),
    }
}

pub fn slot_secret(active: Slot, pw_a: &str, pw_b: &str) -> SlotSecret {
    SlotSecret {
        active_slot: active,
        slot_a: creds("openemr_a", pw_a),
        slot_b: creds("openemr_b", pw_b),
    }
}

pub fn admin_secret(password: &str) -> AdminSecret {
    AdminSecret {
        username: ADMIN_USER.into(),
        password: password.into(),
        host: DB_HOST.into(),
    }
}

pub fn sqlconf_text(user: &str, password: &str) -> String {
    format!(
        "<?php\n\
         //  OpenEMR MySQL connection settings\n\
         $host\t= '{DB_HOST}';\n\
         $port\t= '3306';\n\
         $login\t= '{user}';\n\
         $pass\t= '{password}';\n\
         $dbase\t= 'openemr';\n\
         $config = 1;\n\
         ?>\n"
    )
}

// -- Secret store fake --

pub struct FakeStore {
    slot: Mutex<SlotSecret>,
    admin: Mutex<AdminSecret>,
    pub slot_puts: AtomicU32,
    pub admin_puts: AtomicU32,
    /// Simulates the "admin ALTER succeeded but the secret put was lost"
    /// crash window.
    pub fail_admin_put: AtomicBool,
}

impl FakeStore {
    pub fn new(slot: SlotSecret, admin: AdminSecret) -> Self {
        Self {
            slot: Mutex::new(slot),
            admin: Mutex::new(admin),
            slot_puts: AtomicU32::new(0),
            admin_puts: AtomicU32::new(0),
            fail_admin_put: AtomicBool::new(false),
        }
    }

    pub fn slot_doc(&self) -> SlotSecret {
        self.slot.lock().unwrap().clone()
    }

    pub fn admin_doc(&self) -> AdminSecret {
        self.admin.lock().unwrap().clone()
    }
}

#[async_trait]
impl SecretStore for FakeStore {
    async fn get_slot_secret(&self) -> Result<SlotSecret, RotateError> {
        Ok(self.slot.lock().unwrap().clone())
    }

    async fn put_slot_secret(&self, doc: &SlotSecret) -> Result<(), RotateError> {
        self.slot_puts.fetch_add(1, Ordering::SeqCst);
        *self.slot.lock().unwrap() = doc.clone();
        Ok(())
    }

    async fn get_admin_secret(&self) -> Result<AdminSecret, RotateError> {
        Ok(self.admin.lock().unwrap().clone())
    }

    async fn put_admin_secret(&self, doc: &AdminSecret) -> Result<(), RotateError> {
        if self.fail_admin_put.load(Ordering::SeqCst) {
            return Err(RotateError::TransientIo("secret store write lost".into()));
        }
        self.admin_puts.fetch_add(1, Ordering::SeqCst);
        *self.admin.lock().unwrap() = doc.clone();
        Ok(())
    }
}

// -- MySQL fake: a user table plus auth checks --

pub struct FakeDb {
    /// username -> accepted password, admin included.
    pub users: Mutex<HashMap<String, String>>,
    pub ensure_calls: Mutex<Vec<(String, String)>>,
    pub admin_rotations: AtomicU32,
}

impl FakeDb {
    pub fn new(users: &[(&str, &str)]) -> Self {
        Self {
            users: Mutex::new(
                users
                    .iter()
                    .map(|(u, p)| (u.to_string(), p.to_string()))
                    .collect(),
            ),
            ensure_calls: Mutex::new(Vec::new()),
            admin_rotations: AtomicU32::new(0),
        }
    }

    pub fn password_of(&self, username: &str) -> Option<String> {
        self.users.lock().unwrap().get(username).cloned()
    }

    fn check_admin(&self, admin: &AdminSecret) -> Result<(), RotateError> {
        let users = self.users.lock().unwrap();
        if users.get(&admin.username) == Some(&admin.password) {
            Ok(())
        } else {
            Err(RotateError::AuthFailure(format!(
                "admin user {} was refused by the database",
                admin.username
            )))
        }
    }
}

#[async_trait]
impl DbAdmin for FakeDb {
    async fn probe_auth(&self, username: &str, password: &str) -> Result<bool, RotateError> {
        let users = self.users.lock().unwrap();
        Ok(users.get(username).map(String::as_str) == Some(password))
    }

    async fn slot_user_exists(
        &self,
        admin: &AdminSecret,
        username: &str,
    ) -> Result<bool, RotateError> {
        self.check_admin(admin)?;
        Ok(self.users.lock().unwrap().contains_key(username))
    }

    async fn ensure_slot_user(
        &self,
        admin: &AdminSecret,
        username: &str,
        password: &str,
    ) -> Result<(), RotateError> {
        self.check_admin(admin)?;
        self.users
            .lock()
            .unwrap()
            .insert(username.to_owned(), password.to_owned());
        self.ensure_calls
            .lock()
            .unwrap()
            .push((username.to_owned(), password.to_owned()));
        Ok(())
    }

    async fn rotate_admin(
        &self,
        admin: &AdminSecret,
        new_password: &str,
    ) -> Result<(), RotateError> {
        self.check_admin(admin)?;
        self.users
            .lock()
            .unwrap()
            .insert(admin.username.clone(), new_password.to_owned());
        self.admin_rotations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn healthcheck(&self, slot: &SlotCredentials) -> Result<bool, RotateError> {
        self.probe_auth(&slot.username, &slot.password).await
    }
}

// -- Orchestrator fake --

pub struct FakeRefresher {
    pub refreshes: AtomicU32,
    pub fail_wait: AtomicBool,
}

impl FakeRefresher {
    pub fn new() -> Self {
        Self {
            refreshes: AtomicU32::new(0),
            fail_wait: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ServiceRefresher for FakeRefresher {
    async fn refresh(&self) -> Result<DeploymentHandle, RotateError> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(DeploymentHandle {
            deployment_id: format!("ecs-svc/deployment-{n}"),
        })
    }

    async fn wait_stable(
        &self,
        _handle: &DeploymentHandle,
        timeout: Duration,
    ) -> Result<(), RotateError> {
        if self.fail_wait.load(Ordering::SeqCst) {
            Err(RotateError::DeploymentTimeout(timeout))
        } else {
            Ok(())
        }
    }
}
