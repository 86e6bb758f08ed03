//! Workflow graph compilation.
//!
//! A workflow is authored as an arbitrary node/edge graph. Before a run can
//! start it is validated and flattened into a single execution order; runs
//! are strictly sequential, so no wave or parallel scheduling happens here.
//!
//! ## Example
//!
//! ```
//! use agent_factory::dag::GraphCompiler;
//! use agent_factory::factory::models::{AgentRole, Edge, Node};
//!
//! let nodes = vec![
//!     Node::new("qa", AgentRole::Qa, "Test"),
//!     Node::new("pm", AgentRole::Pm, "Plan"),
//!     Node::new("sa", AgentRole::Sa, "Design"),
//!     Node::new("pg", AgentRole::Pg, "Build"),
//! ];
//! let edges = vec![Edge::new("pm", "sa"), Edge::new("sa", "pg"), Edge::new("pg", "qa")];
//!
//! let order = GraphCompiler::new().compile(&nodes, &edges).unwrap();
//! let ids: Vec<&str> = order.iter().map(|n| n.id.as_str()).collect();
//! assert_eq!(ids, vec!["pm", "sa", "pg", "qa"]);
//! ```

mod compiler;

pub use compiler::GraphCompiler;
