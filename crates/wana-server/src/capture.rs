//! Credential capture.
//!
//! Every password and public key a peer offers is recorded before anything
//! else looks at it. [`CaptureDb`] keeps them in SQLite.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, Row, params};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to create {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type CaptureResult<T> = Result<T, CaptureError>;

/// One password attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PasswordAttempt {
    pub ip_address: String,
    pub username: String,
    pub password: String,
    pub created_at: DateTime<Utc>,
}

impl PasswordAttempt {
    pub fn new(ip_address: &str, username: &str, password: &str) -> Self {
        Self {
            ip_address: ip_address.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// One offered public key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyAttempt {
    pub ip_address: String,
    pub username: String,
    /// OpenSSH public key line.
    pub key: String,
    /// `SHA256:...`
    pub key_fingerprint: String,
    pub key_type: String,
    pub created_at: DateTime<Utc>,
}

/// A stored attempt with its row id.
#[derive(Debug, Clone, Serialize)]
pub struct Record<T> {
    pub id: i64,
    #[serde(flatten)]
    pub attempt: T,
}

/// Where captured credentials go.
pub trait CaptureSink: Send + Sync {
    fn record_password(&self, attempt: &PasswordAttempt) -> CaptureResult<()>;

    fn record_key(&self, attempt: &KeyAttempt) -> CaptureResult<()>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS password_attempts (
    id INTEGER PRIMARY KEY,
    ip_address TEXT NOT NULL,
    username TEXT NOT NULL,
    password TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (unixepoch())
);
CREATE INDEX IF NOT EXISTS idx_password_attempts_ip ON password_attempts(ip_address);
CREATE INDEX IF NOT EXISTS idx_password_attempts_user ON password_attempts(username);

CREATE TABLE IF NOT EXISTS key_attempts (
    id INTEGER PRIMARY KEY,
    ip_address TEXT NOT NULL,
    username TEXT NOT NULL,
    key TEXT NOT NULL,
    key_fingerprint TEXT NOT NULL,
    key_type TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (unixepoch())
);
CREATE INDEX IF NOT EXISTS idx_key_attempts_ip ON key_attempts(ip_address);
CREATE INDEX IF NOT EXISTS idx_key_attempts_fingerprint ON key_attempts(key_fingerprint);
"#;

/// SQLite-backed capture store.
pub struct CaptureDb {
    conn: Mutex<Connection>,
}

impl CaptureDb {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> CaptureResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| CaptureError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(path = %path.display(), "capture database open");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> CaptureResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Most recent password attempts first.
    pub fn list_passwords(&self, limit: usize) -> CaptureResult<Vec<Record<PasswordAttempt>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, ip_address, username, password, created_at
             FROM password_attempts ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(Record {
                id: row.get(0)?,
                attempt: PasswordAttempt {
                    ip_address: row.get(1)?,
                    username: row.get(2)?,
                    password: row.get(3)?,
                    created_at: timestamp(row, 4)?,
                },
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Most recent key attempts first.
    pub fn list_keys(&self, limit: usize) -> CaptureResult<Vec<Record<KeyAttempt>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, ip_address, username, key, key_fingerprint, key_type, created_at
             FROM key_attempts ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(Record {
                id: row.get(0)?,
                attempt: KeyAttempt {
                    ip_address: row.get(1)?,
                    username: row.get(2)?,
                    key: row.get(3)?,
                    key_fingerprint: row.get(4)?,
                    key_type: row.get(5)?,
                    created_at: timestamp(row, 6)?,
                },
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Attempts per username, busiest first.
    pub fn top_usernames(&self, limit: usize) -> CaptureResult<Vec<(String, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT username, COUNT(*) AS n FROM password_attempts
             GROUP BY username ORDER BY n DESC, username LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let secs: i64 = row.get(idx)?;
    DateTime::from_timestamp(secs, 0).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs))
}

impl CaptureSink for CaptureDb {
    #[tracing::instrument(skip_all, name = "capture.password", fields(ip = %attempt.ip_address, user = %attempt.username))]
    fn record_password(&self, attempt: &PasswordAttempt) -> CaptureResult<()> {
        self.conn.lock().execute(
            "INSERT INTO password_attempts (ip_address, username, password, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                attempt.ip_address,
                attempt.username,
                attempt.password,
                attempt.created_at.timestamp()
            ],
        )?;
        Ok(())
    }

    #[tracing::instrument(skip_all, name = "capture.key", fields(ip = %attempt.ip_address, user = %attempt.username))]
    fn record_key(&self, attempt: &KeyAttempt) -> CaptureResult<()> {
        self.conn.lock().execute(
            "INSERT INTO key_attempts
             (ip_address, username, key, key_fingerprint, key_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                attempt.ip_address,
                attempt.username,
                attempt.key,
                attempt.key_fingerprint,
                attempt.key_type,
                attempt.created_at.timestamp()
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(ip: &str, fingerprint: &str) -> KeyAttempt {
        KeyAttempt {
            ip_address: ip.into(),
            username: "root".into(),
            key: "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl".into(),
            key_fingerprint: fingerprint.into(),
            key_type: "ssh-ed25519".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_passwords_newest_first() {
        let db = CaptureDb::in_memory().unwrap();
        db.record_password(&PasswordAttempt::new("203.0.113.7", "root", "123456"))
            .unwrap();
        db.record_password(&PasswordAttempt::new("203.0.113.7", "admin", "admin"))
            .unwrap();
        db.record_password(&PasswordAttempt::new("198.51.100.2", "root", "toor"))
            .unwrap();

        let rows = db.list_passwords(10).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].attempt.password, "toor");
        assert_eq!(rows[2].attempt.password, "123456");
        assert!(rows[0].id > rows[2].id);

        assert_eq!(db.list_passwords(1).unwrap().len(), 1);
        assert_eq!(
            db.top_usernames(5).unwrap(),
            vec![("root".to_string(), 2), ("admin".to_string(), 1)]
        );
    }

    #[test]
    fn test_keys_roundtrip_fields() {
        let db = CaptureDb::in_memory().unwrap();
        let attempt = key("203.0.113.7", "SHA256:abc");
        db.record_key(&attempt).unwrap();

        let rows = db.list_keys(10).unwrap();
        assert_eq!(rows.len(), 1);
        let stored = &rows[0].attempt;
        assert_eq!(stored.key, attempt.key);
        assert_eq!(stored.key_fingerprint, "SHA256:abc");
        assert_eq!(stored.created_at.timestamp(), attempt.created_at.timestamp());
    }

    #[test]
    fn test_reopen_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/capture.db");
        {
            let db = CaptureDb::open(&path).unwrap();
            db.record_password(&PasswordAttempt::new("192.0.2.1", "pi", "raspberry"))
                .unwrap();
        }
        let db = CaptureDb::open(&path).unwrap();
        assert_eq!(db.list_passwords(10).unwrap()[0].attempt.username, "pi");
    }

    #[test]
    fn test_record_serializes_flat() {
        let record = Record {
            id: 7,
            attempt: PasswordAttempt::new("192.0.2.1", "pi", "raspberry"),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["username"], "pi");
        assert!(json["created_at"].is_string());
    }
}
