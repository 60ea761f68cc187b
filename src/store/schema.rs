// SPDX-License-Identifier: MPL-2.0

/// SQL schema for the local state database
pub const SCHEMA: &str = r#"
PRAGMA user_version = 1;

-- cursors: last acknowledged sequence per publisher
CREATE TABLE IF NOT EXISTS cursors (
    did TEXT PRIMARY KEY,
    seq INTEGER NOT NULL
);

-- identity_cache: resolved signing key and service endpoint per publisher
CREATE TABLE IF NOT EXISTS identity_cache (
    did TEXT PRIMARY KEY,
    signing_key TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    cached_at INTEGER NOT NULL
);

-- service_cache: declared label values per publisher (JSON array)
CREATE TABLE IF NOT EXISTS service_cache (
    did TEXT PRIMARY KEY,
    label_values TEXT NOT NULL,
    cached_at INTEGER NOT NULL
);
"#;
