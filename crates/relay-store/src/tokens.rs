use chrono::{DateTime, Duration, Utc};
use rusqlite::OptionalExtension;
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;

/// Login tokens checked by the fan-out service on client admission.
pub struct TokenRepo {
    db: Database,
}

impl TokenRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Issue a fresh random token for `user_id`, valid for `ttl`.
    #[instrument(skip(self))]
    pub fn issue(&self, user_id: &str, ttl: Duration) -> Result<String, StoreError> {
        let key = uuid::Uuid::now_v7().simple().to_string();
        let now = Utc::now();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO auth_tokens (key, user_id, expires, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![key, user_id, (now + ttl).to_rfc3339(), now.to_rfc3339()],
            )?;
            Ok(())
        })?;
        Ok(key)
    }

    #[instrument(skip(self, key))]
    pub fn revoke(&self, key: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let updated = conn.execute("UPDATE auth_tokens SET revoked = 1 WHERE key = ?1", [key])?;
            if updated == 0 {
                return Err(StoreError::NotFound("auth token".into()));
            }
            Ok(())
        })
    }

    /// A token is valid when it exists, is not revoked and has not expired.
    pub fn is_valid(&self, key: &str) -> Result<bool, StoreError> {
        self.is_valid_at(key, Utc::now())
    }

    fn is_valid_at(&self, key: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let row: Option<(String, bool)> = conn
                .query_row(
                    "SELECT expires, revoked FROM auth_tokens WHERE key = ?1",
                    [key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((expires, revoked)) = row else {
                return Ok(false);
            };
            let expires = DateTime::parse_from_rfc3339(&expires).map_err(|e| StoreError::CorruptRow {
                table: "auth_tokens",
                column: "expires",
                detail: e.to_string(),
            })?;
            Ok(!revoked && expires.with_timezone(&Utc) > now)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_is_valid_until_revoked() {
        let repo = TokenRepo::new(Database::in_memory().unwrap());
        let key = repo.issue("alice", Duration::hours(1)).unwrap();
        assert!(repo.is_valid(&key).unwrap());

        repo.revoke(&key).unwrap();
        assert!(!repo.is_valid(&key).unwrap());
    }

    #[test]
    fn expired_and_unknown_tokens_are_invalid() {
        let repo = TokenRepo::new(Database::in_memory().unwrap());
        let key = repo.issue("bob", Duration::minutes(5)).unwrap();
        assert!(!repo.is_valid_at(&key, Utc::now() + Duration::minutes(10)).unwrap());
        assert!(!repo.is_valid("nope").unwrap());
    }

    #[test]
    fn revoking_unknown_token_fails() {
        let repo = TokenRepo::new(Database::in_memory().unwrap());
        assert!(matches!(repo.revoke("missing"), Err(StoreError::NotFound(_))));
    }
}
