//! SQLite schema definition.

/// Version stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Complete database schema for the offline registry.
pub const SCHEMA: &str = r#"
-- ============================================================================
-- Entity Cache
-- ============================================================================

CREATE TABLE IF NOT EXISTS entity_cache (
    id TEXT PRIMARY KEY,                          -- temporary ID until synced, then server ID
    temporary_alias TEXT UNIQUE,                  -- set at reconciliation
    status TEXT NOT NULL CHECK (status IN ('pending', 'syncing', 'synced', 'failed')),
    phone TEXT NOT NULL,
    name TEXT NOT NULL,
    guardian_name TEXT,
    fields TEXT NOT NULL,                         -- JSON PatientFields
    sync_meta TEXT NOT NULL,                      -- JSON SyncMetadata
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entity_phone ON entity_cache(phone);
CREATE INDEX IF NOT EXISTS idx_entity_status ON entity_cache(status);

-- ============================================================================
-- Sync Queue
-- ============================================================================

CREATE TABLE IF NOT EXISTS sync_queue (
    id TEXT PRIMARY KEY,
    action TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    target_id TEXT NOT NULL,
    payload TEXT NOT NULL,                        -- JSON snapshot, never a reference
    payload_digest TEXT NOT NULL,
    sent_digest TEXT,                             -- digest last handed to the server
    priority TEXT NOT NULL CHECK (priority IN ('critical', 'normal')),
    status TEXT NOT NULL CHECK (status IN ('pending', 'syncing', 'synced', 'failed')),
    sequence INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    next_attempt_at TEXT,
    last_error TEXT,
    server_id TEXT,
    actor TEXT NOT NULL,                          -- JSON Actor
    enqueued_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    synced_at TEXT,
    CHECK (retry_count <= max_retries)
);

-- One queue item per target and action
CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_target_action ON sync_queue(target_id, action);
CREATE INDEX IF NOT EXISTS idx_queue_dequeue ON sync_queue(status, priority, sequence);
"#;
