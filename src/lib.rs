//! Autonomous research pipeline.
//!
//! Five LLM-backed stages turn a niche into a Markdown report under a shared
//! monthly credit budget. A run always produces a [`pipeline::PipelineResult`]:
//! a timeout, engine failure or panic degrades to a partial or failed result
//! that is still saved locally.

pub mod agents;
pub mod api;
pub mod budget;
pub mod config;
pub mod engine;
pub mod llm;
pub mod pipeline;
pub mod storage;

pub use config::Config;
