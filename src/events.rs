//! Background jobs over the message bus.
//!
//! Request paths publish an [`Event`]; the [`Dispatcher`] runs one consumer
//! per topic (consumer group named after the topic) and routes each message
//! to the owning service.
//!
//! | Topic | Payload | Handler |
//! |-------|---------|---------|
//! | `document.build` | `{document_id}` | [`IndexingService::build_documents`] |
//! | `document.update_enabled` | `{document_id}` | [`IndexingService::sync_document_enabled`] |
//! | `document.delete` | `{dataset_id, document_id}` | [`IndexingService::delete_document`] |
//! | `dataset.delete` | `{dataset_id}` | [`IndexingService::delete_dataset`] |
//! | `app.auto_create` | `{name, description, account_id}` | [`AppService::auto_create`] |
//!
//! Delivery is at-least-once. Handlers locate state by primary key and
//! tolerate repeated work; a failing handler is logged and the consumer
//! moves on.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use llmops_core::{Error, Result};

use crate::app::AppService;
use crate::bus::{BusMessage, MessageBus};
use crate::indexing::IndexingService;

pub const TOPIC_DOCUMENT_BUILD: &str = "document.build";
pub const TOPIC_DOCUMENT_UPDATE_ENABLED: &str = "document.update_enabled";
pub const TOPIC_DOCUMENT_DELETE: &str = "document.delete";
pub const TOPIC_DATASET_DELETE: &str = "dataset.delete";
pub const TOPIC_APP_AUTO_CREATE: &str = "app.auto_create";

pub const TOPICS: [&str; 5] = [
    TOPIC_DOCUMENT_BUILD,
    TOPIC_DOCUMENT_UPDATE_ENABLED,
    TOPIC_DOCUMENT_DELETE,
    TOPIC_DATASET_DELETE,
    TOPIC_APP_AUTO_CREATE,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub document_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentDelete {
    pub dataset_id: String,
    pub document_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDelete {
    pub dataset_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppAutoCreate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub account_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DocumentBuild(DocumentRef),
    DocumentUpdateEnabled(DocumentRef),
    DocumentDelete(DocumentDelete),
    DatasetDelete(DatasetDelete),
    AppAutoCreate(AppAutoCreate),
}

impl Event {
    pub fn build_document(document_id: impl Into<String>) -> Self {
        Event::DocumentBuild(DocumentRef {
            document_id: document_id.into(),
        })
    }

    pub fn topic(&self) -> &'static str {
        match self {
            Event::DocumentBuild(_) => TOPIC_DOCUMENT_BUILD,
            Event::DocumentUpdateEnabled(_) => TOPIC_DOCUMENT_UPDATE_ENABLED,
            Event::DocumentDelete(_) => TOPIC_DOCUMENT_DELETE,
            Event::DatasetDelete(_) => TOPIC_DATASET_DELETE,
            Event::AppAutoCreate(_) => TOPIC_APP_AUTO_CREATE,
        }
    }

    pub fn payload(&self) -> Result<Value> {
        let value = match self {
            Event::DocumentBuild(p) | Event::DocumentUpdateEnabled(p) => serde_json::to_value(p)?,
            Event::DocumentDelete(p) => serde_json::to_value(p)?,
            Event::DatasetDelete(p) => serde_json::to_value(p)?,
            Event::AppAutoCreate(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }

    /// Rebuild an event from a bus message. Unknown topics and malformed
    /// payloads are Validation errors.
    pub fn decode(topic: &str, payload: Value) -> Result<Self> {
        let event = match topic {
            TOPIC_DOCUMENT_BUILD => Event::DocumentBuild(serde_json::from_value(payload)?),
            TOPIC_DOCUMENT_UPDATE_ENABLED => {
                Event::DocumentUpdateEnabled(serde_json::from_value(payload)?)
            }
            TOPIC_DOCUMENT_DELETE => Event::DocumentDelete(serde_json::from_value(payload)?),
            TOPIC_DATASET_DELETE => Event::DatasetDelete(serde_json::from_value(payload)?),
            TOPIC_APP_AUTO_CREATE => Event::AppAutoCreate(serde_json::from_value(payload)?),
            other => return Err(Error::validation(format!("unknown topic {:?}", other))),
        };
        Ok(event)
    }
}

pub struct Dispatcher {
    bus: Arc<dyn MessageBus>,
    indexing: Arc<IndexingService>,
    apps: Arc<AppService>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        indexing: Arc<IndexingService>,
        apps: Arc<AppService>,
    ) -> Self {
        Self {
            bus,
            indexing,
            apps,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub async fn publish(&self, event: &Event) -> Result<String> {
        let id = self.bus.publish(event.topic(), event.payload()?).await?;
        debug!(topic = event.topic(), message_id = %id, "event published");
        Ok(id)
    }

    /// Spawn one consumer task per topic. Consumers run until
    /// [`Dispatcher::shutdown`].
    pub fn start(self: &Arc<Self>) {
        for topic in TOPICS {
            let this = self.clone();
            self.tracker.spawn(async move { this.consume(topic).await });
        }
        info!(topics = TOPICS.len(), "dispatcher started");
    }

    async fn consume(&self, topic: &'static str) {
        loop {
            match self.bus.receive(topic, topic, &self.cancel).await {
                Ok(Some(message)) => self.dispatch(message).await,
                Ok(None) => break,
                Err(e) => {
                    warn!(topic, error = %e, "bus receive failed");
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
            }
        }
        debug!(topic, "consumer stopped");
    }

    async fn dispatch(&self, message: BusMessage) {
        let result = match Event::decode(&message.topic, message.payload) {
            Ok(event) => self.handle(event).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(
                topic = %message.topic,
                message_id = %message.id,
                error = %e,
                "event handler failed"
            );
        }
    }

    /// Run the handler for one event inline.
    pub async fn handle(&self, event: Event) -> Result<()> {
        match event {
            Event::DocumentBuild(p) => {
                self.indexing.build_documents(&[p.document_id]).await;
                Ok(())
            }
            Event::DocumentUpdateEnabled(p) => {
                self.indexing.sync_document_enabled(&p.document_id).await
            }
            Event::DocumentDelete(p) => {
                self.indexing
                    .delete_document(&p.dataset_id, &p.document_id)
                    .await
            }
            Event::DatasetDelete(p) => self.indexing.delete_dataset(&p.dataset_id).await,
            Event::AppAutoCreate(p) => self
                .apps
                .auto_create(&p.account_id, &p.name, &p.description)
                .await
                .map(|_| ()),
        }
    }

    /// Drain every topic once without waiting for new messages. Returns the
    /// number of messages handled.
    pub async fn process_pending(&self) -> Result<usize> {
        let mut handled = 0;
        for topic in TOPICS {
            while let Some(message) = self.bus.try_receive(topic, topic).await? {
                self.dispatch(message).await;
                handled += 1;
            }
        }
        Ok(handled)
    }

    /// Stop the consumers and wait for in-flight handlers to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("dispatcher stopped");
    }
}
