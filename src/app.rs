//! App auto-create: turn a name and description into a draft App whose
//! preset prompt is written by the language model.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use llmops_core::llm::{CompletionParams, LanguageModel};
use llmops_core::models::{new_id, now_ts, App, AppStatus};
use llmops_core::store::{AppStore, Store};
use llmops_core::{Error, Result};

const PRESET_PROMPT_TEMPLATE: &str = "You are a prompt engineer. Write the system prompt for an AI \
assistant application.\n\nApplication name: {name}\nApplication description: {description}\n\n\
The prompt should state the assistant's role, the skills it offers, and the constraints it must \
respect. Reply with the prompt only.";

pub struct AppService {
    store: Arc<dyn Store>,
    llm: Arc<dyn LanguageModel>,
}

impl AppService {
    pub fn new(store: Arc<dyn Store>, llm: Arc<dyn LanguageModel>) -> Self {
        Self { store, llm }
    }

    pub async fn auto_create(&self, account_id: &str, name: &str, description: &str) -> Result<App> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("app name must not be empty"));
        }
        if account_id.is_empty() {
            return Err(Error::validation("account_id must not be empty"));
        }

        let prompt = PRESET_PROMPT_TEMPLATE
            .replace("{name}", name)
            .replace("{description}", description);
        let params = CompletionParams {
            temperature: Some(0.8),
            ..Default::default()
        };
        let preset_prompt = self.llm.complete(&prompt, &params).await?;

        let now = now_ts();
        let app = App {
            id: new_id(),
            account_id: account_id.to_string(),
            name: name.to_string(),
            icon: String::new(),
            description: description.to_string(),
            status: AppStatus::Draft,
            preset_prompt: preset_prompt.trim().to_string(),
            model_config: json!({
                "model": self.llm.model_name(),
                "parameters": { "temperature": 0.5 },
            }),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_app(&app).await?;
        info!(app_id = %app.id, account_id, "app auto-created");
        Ok(app)
    }

    pub async fn list(&self, account_id: &str) -> Result<Vec<App>> {
        Ok(self.store.list_apps(account_id).await?)
    }
}
