// SPDX-License-Identifier: MPL-2.0

use crate::store::{StateDb, StoreError, CACHE_TTL_SECS};
use rusqlite::params;

/// Cached identity material for a publisher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedIdentity {
    /// Multibase signing key string from the publisher's DID document
    pub signing_key: String,
    /// Labeler service endpoint URL, empty if the document declared none
    pub endpoint: String,
}

/// Store operations for the identity cache
pub struct IdentityStore<'a> {
    db: &'a StateDb,
}

impl<'a> IdentityStore<'a> {
    pub fn new(db: &'a StateDb) -> Self {
        Self { db }
    }

    /// Get a cached identity. Entries past the TTL are deleted and read as a miss.
    pub fn get(&self, did: &str) -> Result<Option<CachedIdentity>, StoreError> {
        let conn = self.db.conn();

        let mut stmt = conn.prepare(
            "SELECT signing_key, endpoint, cached_at FROM identity_cache WHERE did = ?",
        )?;
        let row = stmt
            .query_row([did], |row| {
                Ok((
                    CachedIdentity {
                        signing_key: row.get(0)?,
                        endpoint: row.get(1)?,
                    },
                    row.get::<_, i64>(2)?,
                ))
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let Some((identity, cached_at)) = row else {
            return Ok(None);
        };

        if StateDb::now() - cached_at > CACHE_TTL_SECS {
            conn.execute("DELETE FROM identity_cache WHERE did = ?", [did])?;
            return Ok(None);
        }

        Ok(Some(identity))
    }

    /// Cache an identity (upserts, refreshes cached_at)
    pub fn set(&self, did: &str, identity: &CachedIdentity) -> Result<(), StoreError> {
        let conn = self.db.conn();
        let now = StateDb::now();

        conn.execute(
            r#"
            INSERT INTO identity_cache (did, signing_key, endpoint, cached_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(did) DO UPDATE SET
                signing_key = excluded.signing_key,
                endpoint = excluded.endpoint,
                cached_at = excluded.cached_at
            "#,
            params![did, identity.signing_key, identity.endpoint, now],
        )?;

        Ok(())
    }
}
