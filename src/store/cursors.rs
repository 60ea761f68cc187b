// SPDX-License-Identifier: MPL-2.0

use crate::store::{StateDb, StoreError};
use rusqlite::params;

/// Store operations for per-publisher replay cursors
pub struct CursorStore<'a> {
    db: &'a StateDb,
}

impl<'a> CursorStore<'a> {
    pub fn new(db: &'a StateDb) -> Self {
        Self { db }
    }

    /// Last acknowledged sequence for a publisher, or `None` if never persisted
    pub fn get(&self, did: &str) -> Result<Option<i64>, StoreError> {
        let conn = self.db.conn();

        let mut stmt = conn.prepare("SELECT seq FROM cursors WHERE did = ?")?;
        let seq = stmt
            .query_row([did], |row| row.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        Ok(seq)
    }

    /// Persist the cursor (upserts)
    pub fn set(&self, did: &str, seq: i64) -> Result<(), StoreError> {
        let conn = self.db.conn();

        conn.execute(
            r#"
            INSERT INTO cursors (did, seq) VALUES (?1, ?2)
            ON CONFLICT(did) DO UPDATE SET seq = excluded.seq
            "#,
            params![did, seq],
        )?;

        Ok(())
    }
}
