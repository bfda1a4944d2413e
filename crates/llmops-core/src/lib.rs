//! # llmops core
//!
//! Runtime-free logic for the llmops platform backend: data models,
//! text cleaning, the recursive splitter, keyword extraction, the
//! collaborator traits consumed by the services (stores, vector store,
//! object store, locker, language model, embeddings, tools, code runner)
//! with in-memory backends, and the workflow graph model and validator.
//!
//! This crate contains no tokio, sqlx, network or filesystem I/O. The
//! `llmops` app crate supplies the concrete backends and the services.

pub mod chunk;
pub mod clean;
pub mod embedding;
pub mod error;
pub mod keyword;
pub mod llm;
pub mod lock;
pub mod models;
pub mod object_store;
pub mod search;
pub mod store;
pub mod tool;
pub mod vector;
pub mod workflow;

pub use error::{Error, ErrorKind, Result};
