//! Credential verification.
//!
//! The API resolves an opaque bearer credential to a subject id before any
//! pipeline work starts. Two schemes are supported:
//! - server-side sessions stored in SQLite, with expiry enforced on lookup
//! - static tokens configured as SHA-256 digests, so plaintext never sits in config
//!
//! Issuing credentials is out of scope; sessions are created by whatever owns the
//! user accounts.

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Mutex;

use crate::error::AuthError;
use crate::log::open_db_connection;

/// Authenticated caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subject {
    pub id: String,
}

pub trait CredentialVerifier: Send + Sync {
    fn scheme(&self) -> &'static str;

    fn resolve(&self, credential: &str) -> Result<Subject, AuthError>;
}

/// Extract the token from an `Authorization` header value.
pub fn parse_bearer(header: Option<&str>) -> Result<&str, AuthError> {
    let value = header.ok_or(AuthError::Missing)?;
    let mut parts = value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::Missing)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::BadScheme);
    }
    let token = parts.next().ok_or(AuthError::Missing)?;
    if parts.next().is_some() {
        return Err(AuthError::BadScheme);
    }
    Ok(token)
}

/// Session lookup against a `sessions(id, subject_id, expires_at)` table.
pub struct SessionTokenVerifier {
    conn: Mutex<Connection>,
}

impl SessionTokenVerifier {
    pub fn open(db_path: &str) -> anyhow::Result<Self> {
        let conn = open_db_connection(db_path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
              id TEXT PRIMARY KEY,
              subject_id TEXT NOT NULL,
              expires_at TEXT NOT NULL
            );
            "#,
        )
        .context("create sessions table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lookup(&self, token: &str, now: DateTime<Utc>) -> anyhow::Result<Result<Subject, AuthError>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("session store lock poisoned"))?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT subject_id, expires_at FROM sessions WHERE id = ?1",
                params![token],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((subject_id, expires_at)) = row else {
            return Ok(Err(AuthError::Unknown));
        };
        let expires_at = DateTime::parse_from_rfc3339(&expires_at)
            .context("parse session expiry")?
            .with_timezone(&Utc);
        if expires_at <= now {
            conn.execute("DELETE FROM sessions WHERE id = ?1", params![token])?;
            log::info!("removed expired session for subject {}", subject_id);
            return Ok(Err(AuthError::Expired));
        }
        Ok(Ok(Subject { id: subject_id }))
    }
}

impl CredentialVerifier for SessionTokenVerifier {
    fn scheme(&self) -> &'static str {
        "session"
    }

    fn resolve(&self, credential: &str) -> Result<Subject, AuthError> {
        self.lookup(credential, Utc::now())
            .map_err(AuthError::Backend)?
    }
}

/// Bearer tokens whose SHA-256 digest appears in the configured set.
#[derive(Clone, Debug, Default)]
pub struct StaticTokenVerifier {
    digests: HashSet<[u8; 32]>,
}

impl StaticTokenVerifier {
    pub fn from_hex_digests<I, S>(digests: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = HashSet::new();
        for digest in digests {
            set.insert(parse_digest(digest.as_ref())?);
        }
        Ok(Self { digests: set })
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

impl CredentialVerifier for StaticTokenVerifier {
    fn scheme(&self) -> &'static str {
        "static"
    }

    fn resolve(&self, credential: &str) -> Result<Subject, AuthError> {
        let digest: [u8; 32] = Sha256::digest(credential.as_bytes()).into();
        if !self.digests.contains(&digest) {
            return Err(AuthError::Unknown);
        }
        Ok(Subject {
            id: format!("token:{}", &hex::encode(digest)[..12]),
        })
    }
}

/// SHA-256 hex digest of a token, as written into config.
pub fn token_digest_hex(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn parse_digest(value: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(value.trim()).context("token digest must be hex")?;
    bytes
        .try_into()
        .map_err(|_| anyhow!("token digest must be 32 bytes"))
}
