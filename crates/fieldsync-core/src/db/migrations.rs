//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Ordered schema steps. A step runs once, in its own transaction, and is
/// recorded in `schema_version`.
const MIGRATIONS: &[(i32, &[&str])] = &[
    // 1: queue, watermark and local caches
    (
        1,
        &[
            // AUTOINCREMENT keeps sequences monotonic even after the tail is removed
            "CREATE TABLE IF NOT EXISTS mutation_queue (
                sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                base_updated_at INTEGER,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER NOT NULL DEFAULT 0,
                parked INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_mutation_queue_entity
                ON mutation_queue(entity_type, entity_id)",
            "CREATE TABLE IF NOT EXISTS sync_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS features (
                id TEXT PRIMARY KEY,
                layer_id TEXT NOT NULL,
                geometry TEXT NOT NULL,
                properties TEXT NOT NULL,
                status TEXT NOT NULL,
                lock_holder TEXT,
                lock_acquired_at INTEGER,
                lock_expires_at INTEGER,
                corrected_by TEXT,
                corrected_at INTEGER,
                validated_by TEXT,
                validated_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                needs_review INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE INDEX IF NOT EXISTS idx_features_layer ON features(layer_id)",
            "CREATE INDEX IF NOT EXISTS idx_features_review ON features(needs_review)",
            "CREATE TABLE IF NOT EXISTS corrections (
                id TEXT PRIMARY KEY,
                feature_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                record TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_corrections_feature
                ON corrections(feature_id, created_at)",
        ],
    ),
    // 2: parked push conflicts
    (
        2,
        &[
            "CREATE TABLE IF NOT EXISTS sync_conflicts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sequence INTEGER NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                detected_at INTEGER NOT NULL,
                resolved_at INTEGER,
                resolution TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_open
                ON sync_conflicts(resolved_at, detected_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_sequence
                ON sync_conflicts(sequence)",
        ],
    ),
];

/// Schema version after every step has run
const CURRENT_VERSION: i32 = 2;

/// Bring the schema up to `CURRENT_VERSION`.
pub async fn run(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
        (),
    )
    .await?;

    let applied = get_version(conn).await?;
    for (version, statements) in MIGRATIONS {
        if *version > applied {
            apply(conn, *version, statements).await?;
        }
    }
    Ok(())
}

async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;
    match rows.next().await? {
        Some(row) => Ok(row.get(0)?),
        None => Ok(0),
    }
}

/// Run one step's statements and record its version; nothing is kept if
/// any statement fails.
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    let outcome: std::result::Result<u64, libsql::Error> = async {
        for statement in statements {
            conn.execute(statement, ()).await?;
        }
        conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
            .await?;
        conn.execute("COMMIT", ()).await
    }
    .await;

    if let Err(error) = outcome {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(error.into());
    }

    tracing::info!(version, "Applied schema migration");
    Ok(())
}
