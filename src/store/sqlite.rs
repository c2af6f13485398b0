//! SQLite-backed device-record store.
//!
//! Schema: one `yubi_users` table, uniquely indexed on `public`. Secrets
//! are stored encrypted through the [`SecretCodec`]; timestamps are RFC 3339
//! text.

use std::path::Path;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};

use crate::status::{AuthError, Result, Status};
use crate::store::{KeyProvider, SecretCodec, UserStore, YubiUser};

/// Durable [`UserStore`] over an embedded SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    codec: Mutex<Option<SecretCodec>>,
}

impl SqliteStore {
    /// Open (or create) the device database at the given path and run the
    /// table migration.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(AuthError::backend)?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(AuthError::backend)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS yubi_users (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                email       TEXT NOT NULL DEFAULT '',
                is_enabled  INTEGER NOT NULL DEFAULT 0,
                is_admin    INTEGER NOT NULL DEFAULT 0,
                counter     INTEGER NOT NULL DEFAULT 0,
                session     INTEGER NOT NULL DEFAULT 0,
                public      TEXT NOT NULL UNIQUE,
                secret      TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT ''
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_yubi_users_public ON yubi_users(public);",
        )
        .map_err(AuthError::backend)?;

        Ok(Self {
            conn: Mutex::new(conn),
            codec: Mutex::new(None),
        })
    }

    fn encode_secret(&self, secret: &str) -> Result<String> {
        if secret.is_empty() {
            return Ok(String::new());
        }
        let codec = self.codec.lock();
        match codec.as_ref() {
            Some(codec) => codec.encrypt(secret.as_bytes()),
            None => Err(AuthError::backend(anyhow!(
                "secret key provider not installed"
            ))),
        }
    }

    fn decode_secret(&self, stored: &str) -> Result<String> {
        if stored.is_empty() {
            return Ok(String::new());
        }
        let codec = self.codec.lock();
        let codec = codec.as_ref().ok_or_else(|| {
            AuthError::backend(anyhow!("secret key provider not installed"))
        })?;
        let plain = codec.decrypt(stored)?;
        String::from_utf8(plain)
            .map_err(|e| AuthError::backend(anyhow!("decrypted secret is not UTF-8: {e}")))
    }
}

const USER_COLUMNS: &str = "id, created_at, updated_at, email, is_enabled, is_admin, \
                            counter, session, public, secret, description";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<YubiUser> {
    Ok(YubiUser {
        id: row.get(0)?,
        created_at: parse_ts(&row.get::<_, String>(1)?),
        updated_at: parse_ts(&row.get::<_, String>(2)?),
        email: row.get(3)?,
        is_enabled: row.get(4)?,
        is_admin: row.get(5)?,
        counter: row.get(6)?,
        session: row.get(7)?,
        public: row.get(8)?,
        secret: row.get(9)?,
        description: row.get(10)?,
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl UserStore for SqliteStore {
    fn add(&self, user: &YubiUser) -> Result<()> {
        let secret = self.encode_secret(&user.secret)?;
        let now = Utc::now().to_rfc3339();

        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO yubi_users
                 (created_at, updated_at, email, is_enabled, is_admin,
                  counter, session, public, secret, description)
             VALUES (?1, ?1, ?2, ?3, ?4, 0, 0, ?5, ?6, ?7)",
            params![
                now,
                user.email,
                user.is_enabled,
                user.is_admin,
                user.public,
                secret,
                user.description,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(AuthError::backend(anyhow!(
                    "yubikey '{}' is already registered",
                    user.public
                )))
            }
            Err(e) => Err(AuthError::backend(e)),
        }
    }

    fn get(&self, public_id: &str) -> Result<Option<YubiUser>> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!("SELECT {USER_COLUMNS} FROM yubi_users WHERE public = ?1"),
                params![public_id],
                user_from_row,
            )
        };

        match row {
            Ok(mut user) => {
                user.secret = self.decode_secret(&user.secret)?;
                Ok(Some(user))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(AuthError::backend(e)),
        }
    }

    fn list(&self) -> Result<Vec<YubiUser>> {
        let users = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {USER_COLUMNS} FROM yubi_users ORDER BY id"
                ))
                .map_err(AuthError::backend)?;
            let rows = stmt
                .query_map([], user_from_row)
                .map_err(AuthError::backend)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(AuthError::backend)?;
            rows
        };

        users
            .into_iter()
            .map(|mut user| {
                user.secret = self.decode_secret(&user.secret)?;
                Ok(user)
            })
            .collect()
    }

    fn update_counts(&self, user: &YubiUser) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE yubi_users SET counter = ?1, session = ?2, updated_at = ?3
                 WHERE public = ?4
                   AND (counter < ?1 OR (counter = ?1 AND session < ?2))",
                params![user.counter, user.session, now, user.public],
            )
            .map_err(AuthError::backend)?;

        if changed == 0 {
            let known: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM yubi_users WHERE public = ?1)",
                    params![user.public],
                    |row| row.get(0),
                )
                .map_err(AuthError::backend)?;
            if !known {
                return Err(AuthError::backend(anyhow!(
                    "unknown yubikey '{}'",
                    user.public
                )));
            }
            // another writer already advanced past these counters
            tracing::warn!(public = %user.public, "counter update lost to a concurrent accept");
            return Err(Status::ReplayedOtp.into());
        }
        Ok(())
    }

    fn update_user(&self, user: &YubiUser) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE yubi_users
                 SET email = ?1, is_admin = ?2, is_enabled = ?3, description = ?4,
                     updated_at = ?5
                 WHERE public = ?6",
                params![
                    user.email,
                    user.is_admin,
                    user.is_enabled,
                    user.description,
                    now,
                    user.public,
                ],
            )
            .map_err(AuthError::backend)?;

        if changed == 0 {
            return Err(AuthError::backend(anyhow!(
                "unknown yubikey '{}'",
                user.public
            )));
        }
        Ok(())
    }

    fn set_secret_key_provider(&self, provider: KeyProvider) {
        *self.codec.lock() = Some(SecretCodec::new(provider));
    }
}
