//! pacs-relay: a checkpointed pipeline that moves approved imaging studies
//! from a staging archive to production through a gated sequence of stages:
//! review confirmation, retrieval, de-identification, protocol verification,
//! site-specific post-processing, publication, and audit reconciliation.

pub mod audit;
pub mod config;
pub mod engine;
pub mod errors;
pub mod hooks;
pub mod pipeline;
pub mod reconcile;
pub mod repo;
pub mod run_context;
pub mod runner;
pub mod scanner;
pub mod supervisor;
