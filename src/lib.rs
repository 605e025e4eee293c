//! # Drover
//!
//! A Rust CLI tool that herds multi-step AI agent workflows: resumable runs,
//! isolated parallel branches, and retries with backoff.
//!
//! ## Usage
//!
//! ```bash
//! drover run workflow.yml [--var name=value] [--from-step "step"]
//! drover resume <run-id>
//! ```
//!
//! ## Modules
//!
//! - `condition` - Boolean expression evaluation for conditional steps
//! - `config` - Layered configuration from files and environment
//! - `engine` - Step execution engine and workflow driver
//! - `error` - Error taxonomy for definition, execution and isolation failures
//! - `events` - Append-only JSONL execution log
//! - `exec` - Agent CLI invocation layer
//! - `progress` - Run progress records with atomic JSON persistence
//! - `subprocess` - Unified subprocess abstraction layer for testing
//! - `template` - `${variable}` interpolation for prompts and commands
//! - `workflow` - Workflow definition model and YAML loader
//! - `worktree` - Git worktree management for parallel branches
pub mod condition;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod exec;
pub mod progress;
pub mod subprocess;
pub mod template;
pub mod workflow;
pub mod worktree;
