// SPDX-License-Identifier: MPL-2.0

//! Appends validated labels to the downstream relational store.

use crate::atproto::Label;
use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One row of the downstream `label` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelRow {
    pub src: String,
    pub uri: String,
    pub cid: String,
    pub val: String,
    pub neg: bool,
    pub cts: String,
    pub exp: Option<String>,
}

impl From<&Label> for LabelRow {
    fn from(label: &Label) -> Self {
        Self {
            src: label.src.clone(),
            uri: label.uri.clone(),
            cid: label.cid.clone().unwrap_or_default(),
            val: label.val.clone(),
            neg: label.is_negation(),
            cts: label.cts.clone(),
            exp: label.exp.clone(),
        }
    }
}

/// Insert-only sink; duplicates from replay are tolerated downstream
#[async_trait]
pub trait LabelSink: Send + Sync {
    async fn insert(&self, row: &LabelRow) -> Result<(), SinkError>;
}

/// Postgres-backed sink writing to `{schema}.label`
pub struct PgLabelSink {
    pool: PgPool,
    insert_sql: String,
}

impl PgLabelSink {
    pub async fn connect(url: &str, schema: &str) -> Result<Self, SinkError> {
        let pool = PgPool::connect(url).await?;
        Ok(Self {
            pool,
            insert_sql: format!(
                "INSERT INTO {schema}.label (src, uri, cid, val, neg, cts, exp) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)"
            ),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl LabelSink for PgLabelSink {
    async fn insert(&self, row: &LabelRow) -> Result<(), SinkError> {
        sqlx::query(&self.insert_sql)
            .bind(&row.src)
            .bind(&row.uri)
            .bind(&row.cid)
            .bind(&row.val)
            .bind(row.neg)
            .bind(&row.cts)
            .bind(&row.exp)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// In-memory sink for tests
#[cfg(test)]
pub(crate) struct MemorySink {
    rows: std::sync::Mutex<Vec<LabelRow>>,
}

#[cfg(test)]
impl MemorySink {
    pub(crate) fn new() -> Self {
        Self {
            rows: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn rows(&self) -> Vec<LabelRow> {
        self.rows.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl LabelSink for MemorySink {
    async fn insert(&self, row: &LabelRow) -> Result<(), SinkError> {
        self.rows.lock().unwrap().push(row.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_mapping_defaults() {
        let label = Label {
            src: "did:plc:a".to_string(),
            uri: "at://did:plc:b/app.bsky.feed.post/1".to_string(),
            cid: None,
            val: "spam".to_string(),
            neg: None,
            cts: "2024-01-01T00:00:00Z".to_string(),
            exp: None,
            ver: Some(1),
            sig: Some(serde_bytes::ByteBuf::from(vec![0u8; 64])),
        };

        let row = LabelRow::from(&label);
        assert_eq!(row.cid, "");
        assert!(!row.neg);
        assert_eq!(row.exp, None);
        assert_eq!(row.val, "spam");
    }

    #[test]
    fn test_row_mapping_preserves_present_fields() {
        let label = Label {
            src: "did:plc:a".to_string(),
            uri: "did:plc:subject".to_string(),
            cid: Some("bafyreihc".to_string()),
            val: "spam".to_string(),
            neg: Some(true),
            cts: "2024-01-01T00:00:00Z".to_string(),
            exp: Some("2099-01-01T00:00:00Z".to_string()),
            ver: None,
            sig: None,
        };

        let row = LabelRow::from(&label);
        assert_eq!(row.cid, "bafyreihc");
        assert!(row.neg);
        assert_eq!(row.exp.as_deref(), Some("2099-01-01T00:00:00Z"));
    }
}
