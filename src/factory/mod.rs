//! Agent factory workflow execution engine.
//!
//! ## Overview
//!
//! A project owns one workflow graph of LLM-backed agent roles (PM, SA, PG,
//! QA and plugin-provided custom roles). Starting a run compiles the graph
//! into a linear order and walks it on a worker pool: each node becomes an
//! `AgentTask`, is executed by a capability, and its result is merged into
//! the context handed to the next node. Failed tasks are retried with
//! exponential backoff; a run that still fails can be resumed by hand.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐  start_run / resume_run / retry_task
//! │  caller  │ ─────────────────────────────────────┐
//! └──────────┘                                      v
//!                 ┌──────────────────────────────────────────────┐
//!                 │  runner.rs  (RunController, walk)            │
//!                 │    │ GraphCompiler::compile (crate::dag)     │
//!                 │    │ WorkerPool::submit (pool.rs)            │
//!                 │    v                                         │
//!                 │  capability.rs  (CapabilityDispatcher)       │
//!                 │    │ plugin Capability  or  legacy LlmClient │
//!                 │    v                                         │
//!                 │  retry.rs  (RetryController, backoff)        │
//!                 │    │                                         │
//!                 │    v                                         │
//!                 │  task_store.rs  (TaskStore) ──> events.rs    │
//!                 │    │                                         │
//!                 │    v                                         │
//!                 │  db.rs  (FactoryDb, SQLite)                  │
//!                 └──────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module   | Responsibility                                              |
//! |----------|-------------------------------------------------------------|
//! | `models` | Shared types: `AgentTask`, `Run`, `WorkflowGraph`, `TaskEvent` |
//! | `db`     | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)         |
//! | `events` | `EventSink` trait + `tokio::sync::broadcast` implementation |
//! | `llm`    | `LlmClient` trait, CLI-backed client, prompt templates      |
//! | `builtin`| `BuiltinPlugin`: PM and SA capabilities shipped with the engine |
//! | `pool`   | Bounded worker pool with delayed submission                 |

pub mod builtin;
pub mod capability;
pub mod db;
pub mod events;
pub mod llm;
pub mod models;
pub mod pool;
pub mod retry;
pub mod runner;
pub mod task_store;

pub use builtin::BuiltinPlugin;
pub use capability::{CapabilityDispatcher, CapabilityRegistry, Plugin, RegistryBuilder, TaskContext};
pub use runner::{EngineOptions, ResumeOutcome, RunController};
pub use task_store::TaskStore;
