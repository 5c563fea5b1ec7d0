//! mailplan: email-triggered tool orchestration.

pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod store;
pub mod tools;
pub mod webhook;
