//! Idempotent schema migrations.
//!
//! Every statement is `CREATE ... IF NOT EXISTS`, so `llmops init` can run
//! against an existing database. JSON columns hold the persisted formats
//! (keyword table rows, segment keywords, process rules, graphs).

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS upload_files (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        name TEXT NOT NULL,
        key TEXT NOT NULL,
        size INTEGER NOT NULL,
        extension TEXT NOT NULL,
        mime_type TEXT NOT NULL,
        hash TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS datasets (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        name TEXT NOT NULL,
        icon TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dataset_queries (
        id TEXT PRIMARY KEY,
        dataset_id TEXT NOT NULL,
        query TEXT NOT NULL,
        source TEXT NOT NULL,
        source_app_id TEXT,
        created_by TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS process_rules (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        dataset_id TEXT NOT NULL,
        mode TEXT NOT NULL,
        rule_json TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        dataset_id TEXT NOT NULL,
        upload_file_id TEXT NOT NULL,
        process_rule_id TEXT NOT NULL,
        batch TEXT NOT NULL DEFAULT '',
        name TEXT NOT NULL,
        position INTEGER NOT NULL,
        character_count INTEGER NOT NULL DEFAULT 0,
        token_count INTEGER NOT NULL DEFAULT 0,
        processing_started_at INTEGER,
        parsing_completed_at INTEGER,
        splitting_completed_at INTEGER,
        indexing_completed_at INTEGER,
        completed_at INTEGER,
        stopped_at INTEGER,
        error TEXT NOT NULL DEFAULT '',
        enabled INTEGER NOT NULL DEFAULT 0,
        disabled_at INTEGER,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS segments (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        dataset_id TEXT NOT NULL,
        document_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        content TEXT NOT NULL,
        character_count INTEGER NOT NULL,
        token_count INTEGER NOT NULL,
        keywords_json TEXT NOT NULL DEFAULT '[]',
        hash TEXT NOT NULL,
        node_id TEXT NOT NULL,
        hit_count INTEGER NOT NULL DEFAULT 0,
        enabled INTEGER NOT NULL DEFAULT 0,
        disabled_at INTEGER,
        processing_started_at INTEGER,
        indexing_completed_at INTEGER,
        completed_at INTEGER,
        stopped_at INTEGER,
        error TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE(document_id, position)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS keyword_tables (
        id TEXT PRIMARY KEY,
        dataset_id TEXT NOT NULL UNIQUE,
        keyword_table_json TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        name TEXT NOT NULL,
        tool_call_name TEXT NOT NULL,
        icon TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        graph_json TEXT NOT NULL DEFAULT '{}',
        draft_graph_json TEXT NOT NULL DEFAULT '{}',
        is_debug_passed INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        published_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE(account_id, tool_call_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_results (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        workflow_id TEXT NOT NULL,
        graph_json TEXT NOT NULL,
        state_json TEXT NOT NULL DEFAULT '[]',
        latency REAL NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS apps (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        name TEXT NOT NULL,
        icon TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL,
        preset_prompt TEXT NOT NULL DEFAULT '',
        model_config_json TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS vector_points (
        node_id TEXT PRIMARY KEY,
        content TEXT NOT NULL,
        metadata_json TEXT NOT NULL,
        embedding BLOB NOT NULL,
        dims INTEGER NOT NULL,
        model TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bus_messages (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        topic TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        published_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bus_offsets (
        topic TEXT NOT NULL,
        group_name TEXT NOT NULL,
        last_seq INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (topic, group_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS locks (
        key TEXT PRIMARY KEY,
        token TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_documents_dataset ON documents(dataset_id, position)",
    "CREATE INDEX IF NOT EXISTS idx_segments_document ON segments(document_id, position)",
    "CREATE INDEX IF NOT EXISTS idx_segments_dataset ON segments(dataset_id)",
    "CREATE INDEX IF NOT EXISTS idx_dataset_queries_dataset ON dataset_queries(dataset_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_workflow_results_workflow ON workflow_results(workflow_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_apps_account ON apps(account_id)",
    "CREATE INDEX IF NOT EXISTS idx_bus_messages_topic ON bus_messages(topic, seq)",
];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index on an open pool.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    for ddl in TABLES.iter().chain(INDEXES) {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}
