//! Core data models used throughout llmops.
//!
//! These are the rows that flow through the indexing pipeline, the
//! retrievers, and the workflow engine. Timestamps are Unix seconds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Generate a fresh UUID v4 string.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current wall-clock time as Unix seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Declares a status enum persisted as a lowercase string.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(
    /// Document lifecycle. Advances monotonically except into `Error`.
    DocumentStatus {
        Waiting => "waiting",
        Parsing => "parsing",
        Splitting => "splitting",
        Indexing => "indexing",
        Completed => "completed",
        Error => "error",
    }
);

string_enum!(
    /// Segment lifecycle.
    SegmentStatus {
        Waiting => "waiting",
        Indexing => "indexing",
        Completed => "completed",
        Error => "error",
    }
);

string_enum!(
    ProcessMode {
        Automatic => "automatic",
        Custom => "custom",
    }
);

string_enum!(
    WorkflowStatus {
        Draft => "draft",
        Published => "published",
    }
);

string_enum!(
    WorkflowResultStatus {
        Running => "running",
        Succeeded => "succeeded",
        Failed => "failed",
    }
);

string_enum!(
    AppStatus {
        Draft => "draft",
        Published => "published",
    }
);

string_enum!(
    MessageStatus {
        Normal => "normal",
        Stop => "stop",
        Timeout => "timeout",
        Error => "error",
    }
);

string_enum!(
    /// Where a dataset query originated.
    QuerySource {
        HitTesting => "hit_testing",
        App => "app",
        Workflow => "workflow",
    }
);

/// Handle to an uploaded blob in object storage. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadFile {
    pub id: String,
    pub account_id: String,
    pub name: String,
    /// Object-store key.
    pub key: String,
    pub size: i64,
    pub extension: String,
    pub mime_type: String,
    pub hash: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub icon: String,
    pub description: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Dataset {
    pub fn new(account_id: &str, name: &str) -> Self {
        let now = now_ts();
        Self {
            id: new_id(),
            account_id: account_id.to_string(),
            name: name.to_string(),
            icon: String::new(),
            description: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One logged retrieval query against a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetQuery {
    pub id: String,
    pub dataset_id: String,
    pub query: String,
    pub source: QuerySource,
    pub source_app_id: Option<String>,
    pub created_by: String,
    pub created_at: i64,
}

/// A pre-processing toggle, e.g. `remove_extra_space`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreProcessRule {
    pub id: String,
    pub enabled: bool,
}

pub const RULE_REMOVE_EXTRA_SPACE: &str = "remove_extra_space";
pub const RULE_REMOVE_URL_AND_EMAIL: &str = "remove_url_and_email";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRule {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub separators: Vec<String>,
}

/// The persisted `ProcessRule.rule` JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    #[serde(default)]
    pub pre_process_rules: Vec<PreProcessRule>,
    pub segment: SegmentRule,
}

impl RuleSpec {
    pub fn is_enabled(&self, rule_id: &str) -> bool {
        self.pre_process_rules
            .iter()
            .any(|r| r.id == rule_id && r.enabled)
    }
}

/// Split parameters and pre-processing toggles. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRule {
    pub id: String,
    pub account_id: String,
    pub dataset_id: String,
    pub mode: ProcessMode,
    pub rule: RuleSpec,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub account_id: String,
    pub dataset_id: String,
    pub upload_file_id: String,
    pub process_rule_id: String,
    pub batch: String,
    pub name: String,
    pub position: i64,
    pub character_count: i64,
    pub token_count: i64,
    pub processing_started_at: Option<i64>,
    pub parsing_completed_at: Option<i64>,
    pub splitting_completed_at: Option<i64>,
    pub indexing_completed_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub stopped_at: Option<i64>,
    pub error: String,
    pub enabled: bool,
    pub disabled_at: Option<i64>,
    pub status: DocumentStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Document {
    /// A fresh document in `waiting` state.
    pub fn new(
        account_id: &str,
        dataset_id: &str,
        upload_file_id: &str,
        process_rule_id: &str,
        name: &str,
    ) -> Self {
        let now = now_ts();
        Self {
            id: new_id(),
            account_id: account_id.to_string(),
            dataset_id: dataset_id.to_string(),
            upload_file_id: upload_file_id.to_string(),
            process_rule_id: process_rule_id.to_string(),
            batch: String::new(),
            name: name.to_string(),
            position: 1,
            character_count: 0,
            token_count: 0,
            processing_started_at: None,
            parsing_completed_at: None,
            splitting_completed_at: None,
            indexing_completed_at: None,
            completed_at: None,
            stopped_at: None,
            error: String::new(),
            enabled: false,
            disabled_at: None,
            status: DocumentStatus::Waiting,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A text chunk: the unit of retrieval and of enable toggling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    pub account_id: String,
    pub dataset_id: String,
    pub document_id: String,
    /// 1-based, unique within a document.
    pub position: i64,
    pub content: String,
    pub character_count: i64,
    pub token_count: i64,
    /// At most ten, ordered.
    pub keywords: Vec<String>,
    pub hash: String,
    /// Primary key of this segment's point in the vector store.
    pub node_id: String,
    pub hit_count: i64,
    pub enabled: bool,
    pub disabled_at: Option<i64>,
    pub processing_started_at: Option<i64>,
    pub indexing_completed_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub stopped_at: Option<i64>,
    pub error: String,
    pub status: SegmentStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Per-dataset inverted index from keyword to segment IDs.
///
/// Posting lists are conceptually sets; insertion order is preserved so
/// that full-text ordering is stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordTable {
    pub id: String,
    pub dataset_id: String,
    pub keyword_table: BTreeMap<String, Vec<String>>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl KeywordTable {
    pub fn empty(dataset_id: &str) -> Self {
        let now = now_ts();
        Self {
            id: new_id(),
            dataset_id: dataset_id.to_string(),
            keyword_table: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Ensure `segment_id` is in the posting list of every keyword.
    pub fn add(&mut self, segment_id: &str, keywords: &[String]) {
        for keyword in keywords {
            let postings = self.keyword_table.entry(keyword.clone()).or_default();
            if !postings.iter().any(|id| id == segment_id) {
                postings.push(segment_id.to_string());
            }
        }
    }

    /// Remove the given IDs from every posting list, dropping emptied keywords.
    pub fn remove(&mut self, segment_ids: &[String]) {
        if segment_ids.is_empty() {
            return;
        }
        for postings in self.keyword_table.values_mut() {
            postings.retain(|id| !segment_ids.contains(id));
        }
        self.keyword_table.retain(|_, postings| !postings.is_empty());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub account_id: String,
    pub name: String,
    /// Unique per account.
    pub tool_call_name: String,
    pub icon: String,
    pub description: String,
    pub graph: serde_json::Value,
    pub draft_graph: serde_json::Value,
    pub is_debug_passed: bool,
    pub status: WorkflowStatus,
    pub published_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// The persisted record of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub id: String,
    pub account_id: String,
    pub workflow_id: String,
    pub graph: serde_json::Value,
    /// Captured per-node state trace.
    pub state: serde_json::Value,
    /// Seconds.
    pub latency: f64,
    pub status: WorkflowResultStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub icon: String,
    pub description: String,
    pub status: AppStatus,
    pub preset_prompt: String,
    pub model_config: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub app_id: String,
    pub name: String,
    pub summary: String,
    pub created_by: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub app_id: String,
    pub conversation_id: String,
    pub query: String,
    pub answer: String,
    pub status: MessageStatus,
    pub error: String,
    pub latency: f64,
    pub created_by: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One reasoning step recorded against a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentThought {
    pub id: String,
    pub message_id: String,
    pub position: i64,
    pub event: String,
    pub thought: String,
    pub observation: String,
    pub tool: String,
    pub tool_input: serde_json::Value,
    pub latency: f64,
    pub created_at: i64,
}
