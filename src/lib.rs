//! # llmops
//!
//! Backend services for an LLM application platform: document indexing
//! into knowledge bases, full-text / semantic / hybrid retrieval, and a
//! workflow engine that runs user-authored graphs of model, tool, code,
//! HTTP, retrieval and control-flow nodes.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │ Object     │──▶│  Indexing    │──▶│ Segments         │
//! │ store      │   │ parse→split  │   │ Keyword tables   │
//! └────────────┘   │ →keywords    │   │ Vector points    │
//!                  │ →embed       │   └────────┬─────────┘
//!                  └──────▲───────┘            │
//!                         │                    ▼
//!                  ┌──────┴───────┐   ┌──────────────────┐
//!                  │  Dispatcher  │   │    Retrieval     │
//!                  │  (bus jobs)  │   │ full_text/hybrid │
//!                  └──────────────┘   └────────┬─────────┘
//!                                              ▼
//!                                     ┌──────────────────┐
//!                                     │ Workflow engine  │
//!                                     │ validate → run   │
//!                                     └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] / [`migrate`] | SQLite pool and schema |
//! | [`sqlite_store`] / [`sqlite_vector`] | Relational and vector persistence |
//! | [`object_store`] | Filesystem and S3 blob stores |
//! | [`llm`] / [`embedding`] | Model adapters |
//! | [`lua_runtime`] / [`tools`] | Code-node runner and tool registry |
//! | [`extract`] | Text extraction by file type |
//! | [`keyword_table`] | Locked keyword-table updates |
//! | [`indexing`] | Document build pipeline |
//! | [`retrieval`] | Dataset search |
//! | [`workflow`] | Graph executor and lifecycle |
//! | [`app`] | App auto-create |
//! | [`bus`] / [`events`] | Message bus and job dispatcher |
//! | [`platform`] | Service wiring |

pub mod app;
pub mod bus;
pub mod config;
pub mod db;
pub mod embedding;
pub mod events;
pub mod extract;
pub mod indexing;
pub mod keyword_table;
pub mod llm;
pub mod lock;
pub mod lua_runtime;
pub mod migrate;
pub mod object_store;
pub mod platform;
pub mod retrieval;
pub mod sqlite_store;
pub mod sqlite_vector;
pub mod tools;
pub mod workflow;
