//! SQLite-backed [`Store`](llmops_core::store::Store) implementation.
//!
//! Maps each repository operation onto the schema created by
//! [`migrate`](crate::migrate). JSON-valued fields (`keywords`, process
//! rules, keyword tables, graphs) are stored as TEXT columns with a
//! `_json` suffix.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use llmops_core::models::{
    App, AppStatus, Dataset, DatasetQuery, Document, DocumentStatus, KeywordTable, ProcessMode,
    ProcessRule, QuerySource, Segment, SegmentStatus, UploadFile, Workflow, WorkflowResult,
    WorkflowResultStatus, WorkflowStatus,
};
use llmops_core::store::{
    AppStore, DatasetStore, DocumentStore, KeywordTableStore, SegmentStore, WorkflowStore,
};

/// SQLite implementation of every store trait.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// `?, ?, ?` for an `IN (...)` clause of `n` items.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn parse_status<T>(raw: &str, parse: fn(&str) -> Option<T>, what: &str) -> Result<T> {
    parse(raw).ok_or_else(|| anyhow!("unknown {} status {:?}", what, raw))
}

fn row_to_dataset(row: &SqliteRow) -> Dataset {
    Dataset {
        id: row.get("id"),
        account_id: row.get("account_id"),
        name: row.get("name"),
        icon: row.get("icon"),
        description: row.get("description"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_query(row: &SqliteRow) -> Result<DatasetQuery> {
    let source: String = row.get("source");
    Ok(DatasetQuery {
        id: row.get("id"),
        dataset_id: row.get("dataset_id"),
        query: row.get("query"),
        source: parse_status(&source, QuerySource::parse, "query source")?,
        source_app_id: row.get("source_app_id"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
    })
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let status: String = row.get("status");
    let enabled: i64 = row.get("enabled");
    Ok(Document {
        id: row.get("id"),
        account_id: row.get("account_id"),
        dataset_id: row.get("dataset_id"),
        upload_file_id: row.get("upload_file_id"),
        process_rule_id: row.get("process_rule_id"),
        batch: row.get("batch"),
        name: row.get("name"),
        position: row.get("position"),
        character_count: row.get("character_count"),
        token_count: row.get("token_count"),
        processing_started_at: row.get("processing_started_at"),
        parsing_completed_at: row.get("parsing_completed_at"),
        splitting_completed_at: row.get("splitting_completed_at"),
        indexing_completed_at: row.get("indexing_completed_at"),
        completed_at: row.get("completed_at"),
        stopped_at: row.get("stopped_at"),
        error: row.get("error"),
        enabled: enabled != 0,
        disabled_at: row.get("disabled_at"),
        status: parse_status(&status, DocumentStatus::parse, "document")?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_segment(row: &SqliteRow) -> Result<Segment> {
    let status: String = row.get("status");
    let enabled: i64 = row.get("enabled");
    let keywords_json: String = row.get("keywords_json");
    Ok(Segment {
        id: row.get("id"),
        account_id: row.get("account_id"),
        dataset_id: row.get("dataset_id"),
        document_id: row.get("document_id"),
        position: row.get("position"),
        content: row.get("content"),
        character_count: row.get("character_count"),
        token_count: row.get("token_count"),
        keywords: serde_json::from_str(&keywords_json)?,
        hash: row.get("hash"),
        node_id: row.get("node_id"),
        hit_count: row.get("hit_count"),
        enabled: enabled != 0,
        disabled_at: row.get("disabled_at"),
        processing_started_at: row.get("processing_started_at"),
        indexing_completed_at: row.get("indexing_completed_at"),
        completed_at: row.get("completed_at"),
        stopped_at: row.get("stopped_at"),
        error: row.get("error"),
        status: parse_status(&status, SegmentStatus::parse, "segment")?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_keyword_table(row: &SqliteRow) -> Result<KeywordTable> {
    let json: String = row.get("keyword_table_json");
    Ok(KeywordTable {
        id: row.get("id"),
        dataset_id: row.get("dataset_id"),
        keyword_table: serde_json::from_str(&json)?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_workflow(row: &SqliteRow) -> Result<Workflow> {
    let status: String = row.get("status");
    let graph: String = row.get("graph_json");
    let draft: String = row.get("draft_graph_json");
    let passed: i64 = row.get("is_debug_passed");
    Ok(Workflow {
        id: row.get("id"),
        account_id: row.get("account_id"),
        name: row.get("name"),
        tool_call_name: row.get("tool_call_name"),
        icon: row.get("icon"),
        description: row.get("description"),
        graph: serde_json::from_str(&graph)?,
        draft_graph: serde_json::from_str(&draft)?,
        is_debug_passed: passed != 0,
        status: parse_status(&status, WorkflowStatus::parse, "workflow")?,
        published_at: row.get("published_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_workflow_result(row: &SqliteRow) -> Result<WorkflowResult> {
    let status: String = row.get("status");
    let graph: String = row.get("graph_json");
    let state: String = row.get("state_json");
    Ok(WorkflowResult {
        id: row.get("id"),
        account_id: row.get("account_id"),
        workflow_id: row.get("workflow_id"),
        graph: serde_json::from_str(&graph)?,
        state: serde_json::from_str(&state)?,
        latency: row.get("latency"),
        status: parse_status(&status, WorkflowResultStatus::parse, "workflow result")?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_app(row: &SqliteRow) -> Result<App> {
    let status: String = row.get("status");
    let model_config: String = row.get("model_config_json");
    Ok(App {
        id: row.get("id"),
        account_id: row.get("account_id"),
        name: row.get("name"),
        icon: row.get("icon"),
        description: row.get("description"),
        status: parse_status(&status, AppStatus::parse, "app")?,
        preset_prompt: row.get("preset_prompt"),
        model_config: serde_json::from_str(&model_config)?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl DatasetStore for SqliteStore {
    async fn insert_dataset(&self, dataset: &Dataset) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO datasets (id, account_id, name, icon, description, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&dataset.id)
        .bind(&dataset.account_id)
        .bind(&dataset.name)
        .bind(&dataset.icon)
        .bind(&dataset.description)
        .bind(dataset.created_at)
        .bind(dataset.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_dataset(&self, id: &str) -> Result<Option<Dataset>> {
        let row = sqlx::query("SELECT * FROM datasets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_dataset))
    }

    async fn list_owned_datasets(&self, account_id: &str, ids: &[String]) -> Result<Vec<Dataset>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT * FROM datasets WHERE account_id = ? AND id IN ({})",
            placeholders(ids.len())
        );
        let mut q = sqlx::query(&sql).bind(account_id);
        for id in ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&self.pool).await?;
        let found: Vec<Dataset> = rows.iter().map(row_to_dataset).collect();
        // Preserve caller order.
        Ok(ids
            .iter()
            .filter_map(|id| found.iter().find(|d| &d.id == id).cloned())
            .collect())
    }

    async fn delete_dataset(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM datasets WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_dataset_query(&self, query: &DatasetQuery) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dataset_queries (id, dataset_id, query, source, source_app_id, created_by, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&query.id)
        .bind(&query.dataset_id)
        .bind(&query.query)
        .bind(query.source.as_str())
        .bind(&query.source_app_id)
        .bind(&query.created_by)
        .bind(query.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_dataset_queries(
        &self,
        dataset_id: &str,
        limit: usize,
    ) -> Result<Vec<DatasetQuery>> {
        let rows = sqlx::query(
            "SELECT * FROM dataset_queries WHERE dataset_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(dataset_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_query).collect()
    }

    async fn delete_dataset_queries(&self, dataset_id: &str) -> Result<u64> {
        let res = sqlx::query("DELETE FROM dataset_queries WHERE dataset_id = ?")
            .bind(dataset_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn insert_upload_file(&self, file: &UploadFile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO upload_files (id, account_id, name, key, size, extension, mime_type, hash, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&file.id)
        .bind(&file.account_id)
        .bind(&file.name)
        .bind(&file.key)
        .bind(file.size)
        .bind(&file.extension)
        .bind(&file.mime_type)
        .bind(&file.hash)
        .bind(file.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_upload_file(&self, id: &str) -> Result<Option<UploadFile>> {
        let row = sqlx::query("SELECT * FROM upload_files WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UploadFile {
            id: r.get("id"),
            account_id: r.get("account_id"),
            name: r.get("name"),
            key: r.get("key"),
            size: r.get("size"),
            extension: r.get("extension"),
            mime_type: r.get("mime_type"),
            hash: r.get("hash"),
            created_at: r.get("created_at"),
        }))
    }

    async fn insert_process_rule(&self, rule: &ProcessRule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO process_rules (id, account_id, dataset_id, mode, rule_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.account_id)
        .bind(&rule.dataset_id)
        .bind(rule.mode.as_str())
        .bind(serde_json::to_string(&rule.rule)?)
        .bind(rule.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_process_rule(&self, id: &str) -> Result<Option<ProcessRule>> {
        let row = sqlx::query("SELECT * FROM process_rules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(r) = row else {
            return Ok(None);
        };
        let mode: String = r.get("mode");
        let rule_json: String = r.get("rule_json");
        Ok(Some(ProcessRule {
            id: r.get("id"),
            account_id: r.get("account_id"),
            dataset_id: r.get("dataset_id"),
            mode: parse_status(&mode, ProcessMode::parse, "process rule mode")?,
            rule: serde_json::from_str(&rule_json)?,
            created_at: r.get("created_at"),
        }))
    }

    async fn insert_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, account_id, dataset_id, upload_file_id, process_rule_id,
                                   batch, name, position, character_count, token_count,
                                   processing_started_at, parsing_completed_at,
                                   splitting_completed_at, indexing_completed_at, completed_at,
                                   stopped_at, error, enabled, disabled_at, status,
                                   created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.account_id)
        .bind(&doc.dataset_id)
        .bind(&doc.upload_file_id)
        .bind(&doc.process_rule_id)
        .bind(&doc.batch)
        .bind(&doc.name)
        .bind(doc.position)
        .bind(doc.character_count)
        .bind(doc.token_count)
        .bind(doc.processing_started_at)
        .bind(doc.parsing_completed_at)
        .bind(doc.splitting_completed_at)
        .bind(doc.indexing_completed_at)
        .bind(doc.completed_at)
        .bind(doc.stopped_at)
        .bind(&doc.error)
        .bind(doc.enabled as i64)
        .bind(doc.disabled_at)
        .bind(doc.status.as_str())
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_document(&self, doc: &Document) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE documents SET
                batch = ?, name = ?, position = ?, character_count = ?, token_count = ?,
                processing_started_at = ?, parsing_completed_at = ?, splitting_completed_at = ?,
                indexing_completed_at = ?, completed_at = ?, stopped_at = ?, error = ?,
                enabled = ?, disabled_at = ?, status = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&doc.batch)
        .bind(&doc.name)
        .bind(doc.position)
        .bind(doc.character_count)
        .bind(doc.token_count)
        .bind(doc.processing_started_at)
        .bind(doc.parsing_completed_at)
        .bind(doc.splitting_completed_at)
        .bind(doc.indexing_completed_at)
        .bind(doc.completed_at)
        .bind(doc.stopped_at)
        .bind(&doc.error)
        .bind(doc.enabled as i64)
        .bind(doc.disabled_at)
        .bind(doc.status.as_str())
        .bind(doc.updated_at)
        .bind(&doc.id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            anyhow::bail!("document {} does not exist", doc.id);
        }
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn list_documents(&self, dataset_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents WHERE dataset_id = ? ORDER BY position ASC")
            .bind(dataset_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn max_document_position(&self, dataset_id: &str) -> Result<i64> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(position) FROM documents WHERE dataset_id = ?")
                .bind(dataset_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(max.unwrap_or(0))
    }

    async fn delete_document(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_documents_by_dataset(&self, dataset_id: &str) -> Result<u64> {
        let res = sqlx::query("DELETE FROM documents WHERE dataset_id = ?")
            .bind(dataset_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl SegmentStore for SqliteStore {
    async fn insert_segment(&self, s: &Segment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO segments (id, account_id, dataset_id, document_id, position, content,
                                  character_count, token_count, keywords_json, hash, node_id,
                                  hit_count, enabled, disabled_at, processing_started_at,
                                  indexing_completed_at, completed_at, stopped_at, error,
                                  status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&s.id)
        .bind(&s.account_id)
        .bind(&s.dataset_id)
        .bind(&s.document_id)
        .bind(s.position)
        .bind(&s.content)
        .bind(s.character_count)
        .bind(s.token_count)
        .bind(serde_json::to_string(&s.keywords)?)
        .bind(&s.hash)
        .bind(&s.node_id)
        .bind(s.hit_count)
        .bind(s.enabled as i64)
        .bind(s.disabled_at)
        .bind(s.processing_started_at)
        .bind(s.indexing_completed_at)
        .bind(s.completed_at)
        .bind(s.stopped_at)
        .bind(&s.error)
        .bind(s.status.as_str())
        .bind(s.created_at)
        .bind(s.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_segment(&self, s: &Segment) -> Result<()> {
        // hit_count is owned by increment_hit_count and never overwritten here.
        let res = sqlx::query(
            r#"
            UPDATE segments SET
                position = ?, content = ?, character_count = ?, token_count = ?,
                keywords_json = ?, hash = ?, node_id = ?, enabled = ?, disabled_at = ?,
                processing_started_at = ?, indexing_completed_at = ?, completed_at = ?,
                stopped_at = ?, error = ?, status = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(s.position)
        .bind(&s.content)
        .bind(s.character_count)
        .bind(s.token_count)
        .bind(serde_json::to_string(&s.keywords)?)
        .bind(&s.hash)
        .bind(&s.node_id)
        .bind(s.enabled as i64)
        .bind(s.disabled_at)
        .bind(s.processing_started_at)
        .bind(s.indexing_completed_at)
        .bind(s.completed_at)
        .bind(s.stopped_at)
        .bind(&s.error)
        .bind(s.status.as_str())
        .bind(s.updated_at)
        .bind(&s.id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            anyhow::bail!("segment {} does not exist", s.id);
        }
        Ok(())
    }

    async fn get_segment(&self, id: &str) -> Result<Option<Segment>> {
        let row = sqlx::query("SELECT * FROM segments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_segment).transpose()
    }

    async fn get_segment_by_position(
        &self,
        document_id: &str,
        position: i64,
    ) -> Result<Option<Segment>> {
        let row = sqlx::query("SELECT * FROM segments WHERE document_id = ? AND position = ?")
            .bind(document_id)
            .bind(position)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_segment).transpose()
    }

    async fn max_segment_position(&self, document_id: &str) -> Result<i64> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(position) FROM segments WHERE document_id = ?")
                .bind(document_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(max.unwrap_or(0))
    }

    async fn list_segments_by_document(&self, document_id: &str) -> Result<Vec<Segment>> {
        let rows =
            sqlx::query("SELECT * FROM segments WHERE document_id = ? ORDER BY position ASC")
                .bind(document_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(row_to_segment).collect()
    }

    async fn list_segments_by_ids(
        &self,
        ids: &[String],
        dataset_ids: &[String],
    ) -> Result<Vec<Segment>> {
        if ids.is_empty() || dataset_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT * FROM segments WHERE id IN ({}) AND dataset_id IN ({})",
            placeholders(ids.len()),
            placeholders(dataset_ids.len())
        );
        let mut q = sqlx::query(&sql);
        for id in ids.iter().chain(dataset_ids) {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_segment).collect()
    }

    async fn increment_hit_count(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE segments SET hit_count = hit_count + 1 WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut q = sqlx::query(&sql);
        for id in ids {
            q = q.bind(id);
        }
        q.execute(&self.pool).await?;
        Ok(())
    }

    async fn delete_segments_by_ids(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!("DELETE FROM segments WHERE id IN ({})", placeholders(ids.len()));
        let mut q = sqlx::query(&sql);
        for id in ids {
            q = q.bind(id);
        }
        Ok(q.execute(&self.pool).await?.rows_affected())
    }

    async fn delete_segments_by_document(&self, document_id: &str) -> Result<u64> {
        let res = sqlx::query("DELETE FROM segments WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn delete_segments_by_dataset(&self, dataset_id: &str) -> Result<u64> {
        let res = sqlx::query("DELETE FROM segments WHERE dataset_id = ?")
            .bind(dataset_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl KeywordTableStore for SqliteStore {
    async fn get_keyword_table(&self, dataset_id: &str) -> Result<Option<KeywordTable>> {
        let row = sqlx::query("SELECT * FROM keyword_tables WHERE dataset_id = ?")
            .bind(dataset_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_keyword_table).transpose()
    }

    async fn save_keyword_table(&self, table: &KeywordTable) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO keyword_tables (id, dataset_id, keyword_table_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(dataset_id) DO UPDATE SET
                keyword_table_json = excluded.keyword_table_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&table.id)
        .bind(&table.dataset_id)
        .bind(serde_json::to_string(&table.keyword_table)?)
        .bind(table.created_at)
        .bind(table.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_keyword_tables(&self, dataset_ids: &[String]) -> Result<Vec<KeywordTable>> {
        if dataset_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT * FROM keyword_tables WHERE dataset_id IN ({})",
            placeholders(dataset_ids.len())
        );
        let mut q = sqlx::query(&sql);
        for id in dataset_ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&self.pool).await?;
        let tables = rows
            .iter()
            .map(row_to_keyword_table)
            .collect::<Result<Vec<_>>>()?;
        Ok(dataset_ids
            .iter()
            .filter_map(|id| tables.iter().find(|t| &t.dataset_id == id).cloned())
            .collect())
    }

    async fn delete_keyword_table(&self, dataset_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM keyword_tables WHERE dataset_id = ?")
            .bind(dataset_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for SqliteStore {
    async fn insert_workflow(&self, w: &Workflow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflows (id, account_id, name, tool_call_name, icon, description,
                                   graph_json, draft_graph_json, is_debug_passed, status,
                                   published_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&w.id)
        .bind(&w.account_id)
        .bind(&w.name)
        .bind(&w.tool_call_name)
        .bind(&w.icon)
        .bind(&w.description)
        .bind(w.graph.to_string())
        .bind(w.draft_graph.to_string())
        .bind(w.is_debug_passed as i64)
        .bind(w.status.as_str())
        .bind(w.published_at)
        .bind(w.created_at)
        .bind(w.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_workflow(&self, w: &Workflow) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE workflows SET
                name = ?, tool_call_name = ?, icon = ?, description = ?, graph_json = ?,
                draft_graph_json = ?, is_debug_passed = ?, status = ?, published_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&w.name)
        .bind(&w.tool_call_name)
        .bind(&w.icon)
        .bind(&w.description)
        .bind(w.graph.to_string())
        .bind(w.draft_graph.to_string())
        .bind(w.is_debug_passed as i64)
        .bind(w.status.as_str())
        .bind(w.published_at)
        .bind(w.updated_at)
        .bind(&w.id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            anyhow::bail!("workflow {} does not exist", w.id);
        }
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_workflow).transpose()
    }

    async fn find_workflow_by_tool_call_name(
        &self,
        account_id: &str,
        tool_call_name: &str,
    ) -> Result<Option<Workflow>> {
        let row =
            sqlx::query("SELECT * FROM workflows WHERE account_id = ? AND tool_call_name = ?")
                .bind(account_id)
                .bind(tool_call_name)
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref().map(row_to_workflow).transpose()
    }

    async fn list_workflows(&self, account_id: &str) -> Result<Vec<Workflow>> {
        let rows = sqlx::query(
            "SELECT * FROM workflows WHERE account_id = ? ORDER BY created_at DESC, id ASC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_workflow).collect()
    }

    async fn delete_workflow(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_workflow_result(&self, r: &WorkflowResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_results (id, account_id, workflow_id, graph_json, state_json,
                                          latency, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&r.id)
        .bind(&r.account_id)
        .bind(&r.workflow_id)
        .bind(r.graph.to_string())
        .bind(r.state.to_string())
        .bind(r.latency)
        .bind(r.status.as_str())
        .bind(r.created_at)
        .bind(r.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_workflow_result(&self, r: &WorkflowResult) -> Result<()> {
        let res = sqlx::query(
            "UPDATE workflow_results SET state_json = ?, latency = ?, status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(r.state.to_string())
        .bind(r.latency)
        .bind(r.status.as_str())
        .bind(r.updated_at)
        .bind(&r.id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            anyhow::bail!("workflow result {} does not exist", r.id);
        }
        Ok(())
    }

    async fn list_workflow_results(&self, workflow_id: &str) -> Result<Vec<WorkflowResult>> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_results WHERE workflow_id = ? ORDER BY created_at DESC, rowid DESC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_workflow_result).collect()
    }

    async fn delete_workflow_results(&self, workflow_id: &str) -> Result<u64> {
        let res = sqlx::query("DELETE FROM workflow_results WHERE workflow_id = ?")
            .bind(workflow_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl AppStore for SqliteStore {
    async fn insert_app(&self, app: &App) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO apps (id, account_id, name, icon, description, status, preset_prompt,
                              model_config_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&app.id)
        .bind(&app.account_id)
        .bind(&app.name)
        .bind(&app.icon)
        .bind(&app.description)
        .bind(app.status.as_str())
        .bind(&app.preset_prompt)
        .bind(app.model_config.to_string())
        .bind(app.created_at)
        .bind(app.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_app(&self, id: &str) -> Result<Option<App>> {
        let row = sqlx::query("SELECT * FROM apps WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_app).transpose()
    }

    async fn list_apps(&self, account_id: &str) -> Result<Vec<App>> {
        let rows = sqlx::query("SELECT * FROM apps WHERE account_id = ? ORDER BY created_at DESC")
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_app).collect()
    }
}
