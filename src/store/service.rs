// SPDX-License-Identifier: MPL-2.0

use crate::store::{StateDb, StoreError, CACHE_TTL_SECS};
use rusqlite::params;

/// Store operations for the service-policy cache (declared label values)
pub struct ServiceStore<'a> {
    db: &'a StateDb,
}

impl<'a> ServiceStore<'a> {
    pub fn new(db: &'a StateDb) -> Self {
        Self { db }
    }

    /// Get the cached declared values. Entries past the TTL (including
    /// force-expired ones at cached_at = 0) are deleted and read as a miss.
    pub fn get(&self, did: &str) -> Result<Option<Vec<String>>, StoreError> {
        let conn = self.db.conn();

        let mut stmt =
            conn.prepare("SELECT label_values, cached_at FROM service_cache WHERE did = ?")?;
        let row = stmt
            .query_row([did], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let Some((raw, cached_at)) = row else {
            return Ok(None);
        };

        if StateDb::now() - cached_at > CACHE_TTL_SECS {
            conn.execute("DELETE FROM service_cache WHERE did = ?", [did])?;
            return Ok(None);
        }

        let values: Vec<String> = serde_json::from_str(&raw)?;
        Ok(Some(values))
    }

    /// Cache the declared values (upserts, refreshes cached_at)
    pub fn set(&self, did: &str, values: &[String]) -> Result<(), StoreError> {
        let conn = self.db.conn();
        let now = StateDb::now();
        let raw = serde_json::to_string(values)?;

        conn.execute(
            r#"
            INSERT INTO service_cache (did, label_values, cached_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(did) DO UPDATE SET
                label_values = excluded.label_values,
                cached_at = excluded.cached_at
            "#,
            params![did, raw, now],
        )?;

        Ok(())
    }

    /// Force-expire an existing entry so the next read is a miss.
    /// Does not create a row for an unknown DID.
    pub fn invalidate(&self, did: &str) -> Result<(), StoreError> {
        let conn = self.db.conn();

        conn.execute(
            "UPDATE service_cache SET label_values = '[]', cached_at = 0 WHERE did = ?",
            [did],
        )?;

        Ok(())
    }
}
