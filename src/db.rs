//! MySQL administration: auth probes, slot-user management, admin rotation.
//!
//! Every operation opens its own short-lived connection; the engine is a
//! one-shot batch task and never holds a pool. `CREATE USER`/`ALTER USER`
//! cannot take bind parameters, so DDL is built from escaped literals.
//! Statement logging is disabled on every connection so password-bearing
//! DDL can never reach the log stream.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlSslMode};
use sqlx::{ConnectOptions, Connection};

use crate::errors::RotateError;
use crate::retry::with_backoff;
use crate::secrets::{AdminSecret, SlotCredentials};

const DB_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Slot users authenticate from anywhere inside the VPC.
const SLOT_USER_HOST: &str = "%";

/// Administrative operations against the cluster endpoint.
///
/// Methods that act as the DBA take the admin credentials explicitly; the
/// adapter itself holds only the endpoint, so the reconciler can adopt a
/// different working admin password mid-run without mutable state here.
#[async_trait]
pub trait DbAdmin: Send + Sync {
    /// `SELECT 1` as the given user. `Ok(false)` means the server refused
    /// the password — a drift signal, not an error.
    async fn probe_auth(&self, username: &str, password: &str) -> Result<bool, RotateError>;

    async fn slot_user_exists(
        &self,
        admin: &AdminSecret,
        username: &str,
    ) -> Result<bool, RotateError>;

    /// Idempotently create-or-alter the slot user so the given password is
    /// the only one accepted, and grant it the application schema.
    async fn ensure_slot_user(
        &self,
        admin: &AdminSecret,
        username: &str,
        password: &str,
    ) -> Result<(), RotateError>;

    /// `ALTER USER` the admin itself, then verify the new password works.
    async fn rotate_admin(&self, admin: &AdminSecret, new_password: &str)
        -> Result<(), RotateError>;

    /// Lightweight end-to-end read as a slot user against the app schema.
    async fn healthcheck(&self, creds: &SlotCredentials) -> Result<bool, RotateError>;
}

/// [`DbAdmin`] over the real MySQL endpoint.
pub struct MySqlAdmin {
    host: String,
    port: u16,
    dbname: String,
}

impl MySqlAdmin {
    pub fn new(host: &str, port: u16, dbname: &str) -> Self {
        Self {
            host: host.to_owned(),
            port,
            dbname: dbname.to_owned(),
        }
    }

    /// Endpoint parameters come from the slot secret; both slots and the
    /// admin talk to the same cluster endpoint.
    pub fn for_endpoint(creds: &SlotCredentials) -> Result<Self, RotateError> {
        let port: u16 = creds.port.parse().map_err(|_| {
            RotateError::SecretUnavailable(format!(
                "slot secret has a non-numeric port: {}",
                creds.port
            ))
        })?;
        Ok(Self::new(&creds.host, port, &creds.dbname))
    }

    fn options(&self, username: &str, password: &str, with_db: bool) -> MySqlConnectOptions {
        let mut opts = MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(username)
            .password(password)
            .ssl_mode(MySqlSslMode::Preferred)
            .disable_statement_logging();
        if with_db {
            opts = opts.database(&self.dbname);
        }
        opts
    }

    /// Open a connection, distinguishing refused passwords from transport
    /// trouble. `Ok(None)` is an authentication failure.
    async fn try_connect(
        &self,
        username: &str,
        password: &str,
        with_db: bool,
    ) -> Result<Option<MySqlConnection>, RotateError> {
        let opts = self.options(username, password, with_db);
        let fut = opts.connect();
        match tokio::time::timeout(DB_OP_TIMEOUT, fut).await {
            Ok(Ok(conn)) => Ok(Some(conn)),
            Ok(Err(e)) if is_access_denied(&e) => Ok(None),
            Ok(Err(e)) => Err(RotateError::TransientIo(format!(
                "connect to {}:{} failed: {e}",
                self.host, self.port
            ))),
            Err(_) => Err(RotateError::TransientIo(format!(
                "connect to {}:{} timed out",
                self.host, self.port
            ))),
        }
    }

    /// Connect as the admin or fail; used by operations that cannot
    /// proceed without DBA privileges.
    async fn admin_conn(&self, admin: &AdminSecret) -> Result<MySqlConnection, RotateError> {
        match self.try_connect(&admin.username, &admin.password, false).await? {
            Some(conn) => Ok(conn),
            None => Err(RotateError::AuthFailure(format!(
                "admin user {} was refused by the database",
                admin.username
            ))),
        }
    }

    async fn exec_ddl(
        &self,
        conn: &mut MySqlConnection,
        sql: String,
        what: &str,
    ) -> Result<(), RotateError> {
        let fut = sqlx::query(&sql).execute(&mut *conn);
        match tokio::time::timeout(DB_OP_TIMEOUT, fut).await {
            Ok(Ok(_)) => Ok(()),
            // Authorization failures on DDL mean the admin lacks grants;
            // retrying cannot fix that.
            Ok(Err(e)) if is_access_denied(&e) => Err(RotateError::AuthFailure(format!(
                "{what} was denied: {e}"
            ))),
            Ok(Err(e)) => Err(RotateError::TransientIo(format!("{what} failed: {e}"))),
            Err(_) => Err(RotateError::TransientIo(format!("{what} timed out"))),
        }
    }
}

#[async_trait]
impl DbAdmin for MySqlAdmin {
    async fn probe_auth(&self, username: &str, password: &str) -> Result<bool, RotateError> {
        with_backoff("db.probe_auth", || async {
            let Some(mut conn) = self.try_connect(username, password, false).await? else {
                return Ok(false);
            };
            let fut = sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&mut conn);
            let probed = match tokio::time::timeout(DB_OP_TIMEOUT, fut).await {
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    return Err(RotateError::TransientIo(format!("probe query failed: {e}")))
                }
                Err(_) => return Err(RotateError::TransientIo("probe query timed out".into())),
            };
            conn.close().await.ok();
            Ok(probed)
        })
        .await
    }

    async fn slot_user_exists(
        &self,
        admin: &AdminSecret,
        username: &str,
    ) -> Result<bool, RotateError> {
        with_backoff("db.slot_user_exists", || async {
            let mut conn = self.admin_conn(admin).await?;
            let fut = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM mysql.user WHERE user = ? AND host = ?",
            )
            .bind(username)
            .bind(SLOT_USER_HOST)
            .fetch_one(&mut conn);
            let count = match tokio::time::timeout(DB_OP_TIMEOUT, fut).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    return Err(RotateError::TransientIo(format!(
                        "mysql.user lookup failed: {e}"
                    )))
                }
                Err(_) => {
                    return Err(RotateError::TransientIo("mysql.user lookup timed out".into()))
                }
            };
            conn.close().await.ok();
            Ok(count > 0)
        })
        .await
    }

    async fn ensure_slot_user(
        &self,
        admin: &AdminSecret,
        username: &str,
        password: &str,
    ) -> Result<(), RotateError> {
        with_backoff("db.ensure_slot_user", || async {
            let mut conn = self.admin_conn(admin).await?;

            let user = format!("'{}'@'{}'", escape_literal(username), SLOT_USER_HOST);

            // CREATE ... IF NOT EXISTS followed by ALTER is idempotent: the
            // pair converges on "user exists with exactly this password"
            // whether the user was absent, present with an old password, or
            // already rotated by an interrupted prior run.
            self.exec_ddl(
                &mut conn,
                format!(
                    "CREATE USER IF NOT EXISTS {user} IDENTIFIED BY '{}'",
                    escape_literal(password)
                ),
                "create slot user",
            )
            .await?;
            self.exec_ddl(
                &mut conn,
                format!(
                    "ALTER USER {user} IDENTIFIED BY '{}'",
                    escape_literal(password)
                ),
                "alter slot user",
            )
            .await?;
            self.exec_ddl(
                &mut conn,
                format!(
                    "GRANT ALL PRIVILEGES ON {}.* TO {user}",
                    quote_ident(&self.dbname)
                ),
                "grant schema privileges",
            )
            .await?;

            conn.close().await.ok();
            Ok(())
        })
        .await
    }

    async fn rotate_admin(
        &self,
        admin: &AdminSecret,
        new_password: &str,
    ) -> Result<(), RotateError> {
        with_backoff("db.rotate_admin", || async {
            let mut conn = self.admin_conn(admin).await?;
            self.exec_ddl(
                &mut conn,
                format!(
                    "ALTER USER '{}'@'%' IDENTIFIED BY '{}'",
                    escape_literal(&admin.username),
                    escape_literal(new_password)
                ),
                "alter admin user",
            )
            .await?;
            conn.close().await.ok();
            Ok(())
        })
        .await?;

        // Validate before the caller persists anything.
        if !self.probe_auth(&admin.username, new_password).await? {
            return Err(RotateError::AuthFailure(
                "admin password was altered but the new password does not authenticate".into(),
            ));
        }
        Ok(())
    }

    async fn healthcheck(&self, creds: &SlotCredentials) -> Result<bool, RotateError> {
        with_backoff("db.healthcheck", || async {
            let Some(mut conn) = self
                .try_connect(&creds.username, &creds.password, true)
                .await?
            else {
                return Ok(false);
            };
            let fut = sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&mut conn);
            let healthy = matches!(tokio::time::timeout(DB_OP_TIMEOUT, fut).await, Ok(Ok(_)));
            conn.close().await.ok();
            Ok(healthy)
        })
        .await
    }
}

/// MySQL reports refused credentials as SQLSTATE 28000 (ER_ACCESS_DENIED).
fn is_access_denied(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("28000")
                || db.message().contains("Access denied")
        }
        _ => false,
    }
}

fn escape_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out
}

fn quote_ident(s: &str) -> String {
    format!("`{}`", s.replace('`', "``"))
}
