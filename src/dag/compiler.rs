//! Graph compiler: turns a workflow graph into a linear execution order.
//!
//! Runs Kahn's algorithm over the node/edge lists. Among nodes that become
//! ready at the same time, the one inserted first wins, so the same graph
//! always compiles to the same order.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::errors::GraphValidationError;
use crate::factory::models::{AgentRole, Edge, Node, WorkflowGraph};

/// Validates workflow graphs and sorts them topologically.
#[derive(Debug, Clone)]
pub struct GraphCompiler {
    required_roles: Vec<AgentRole>,
}

impl Default for GraphCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphCompiler {
    /// Compiler requiring the built-in PM, SA, PG and QA roles.
    pub fn new() -> Self {
        Self {
            required_roles: AgentRole::required(),
        }
    }

    pub fn with_required_roles(required_roles: Vec<AgentRole>) -> Self {
        Self { required_roles }
    }

    pub fn compile_graph(&self, graph: &WorkflowGraph) -> Result<Vec<Node>, GraphValidationError> {
        self.compile(&graph.nodes, &graph.edges)
    }

    /// Validate the graph and return its nodes in execution order.
    ///
    /// Checks, in order: non-empty, unique node ids, required role coverage,
    /// acyclicity. Edges naming an unknown node are ignored.
    pub fn compile(&self, nodes: &[Node], edges: &[Edge]) -> Result<Vec<Node>, GraphValidationError> {
        if nodes.is_empty() {
            return Err(GraphValidationError::EmptyGraph);
        }

        let mut index_map: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index_map.insert(node.id.as_str(), i).is_some() {
                return Err(GraphValidationError::DuplicateNode {
                    id: node.id.clone(),
                });
            }
        }

        self.check_required_roles(nodes)?;

        let mut forward_edges: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        let mut in_degree: Vec<usize> = vec![0; nodes.len()];
        for edge in edges {
            let (Some(&from), Some(&to)) = (
                index_map.get(edge.source_id.as_str()),
                index_map.get(edge.target_id.as_str()),
            ) else {
                continue;
            };
            forward_edges[from].push(to);
            in_degree[to] += 1;
        }

        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(nodes.len());
        while let Some(index) = queue.pop_front() {
            order.push(index);
            for &next in &forward_edges[index] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() < nodes.len() {
            let cycle_nodes = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| nodes[i].id.clone())
                .collect();
            return Err(GraphValidationError::CycleDetected { nodes: cycle_nodes });
        }

        Ok(order.into_iter().map(|i| nodes[i].clone()).collect())
    }

    fn check_required_roles(&self, nodes: &[Node]) -> Result<(), GraphValidationError> {
        let present: HashSet<&AgentRole> = nodes.iter().map(|n| &n.agent_role).collect();
        let missing: Vec<String> = self
            .required_roles
            .iter()
            .filter(|role| !present.contains(role))
            .map(|role| role.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(GraphValidationError::MissingRequiredRole { roles: missing })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, role: AgentRole) -> Node {
        Node::new(id, role, &format!("Node {}", id))
    }

    fn pipeline() -> (Vec<Node>, Vec<Edge>) {
        (
            vec![
                node("pm", AgentRole::Pm),
                node("sa", AgentRole::Sa),
                node("pg", AgentRole::Pg),
                node("qa", AgentRole::Qa),
            ],
            vec![
                Edge::new("pm", "sa"),
                Edge::new("sa", "pg"),
                Edge::new("pg", "qa"),
            ],
        )
    }

    fn ids(nodes: &[Node]) -> Vec<&str> {
        nodes.iter().map(|n| n.id.as_str()).collect()
    }

    #[test]
    fn test_compile_linear_pipeline() {
        let (nodes, edges) = pipeline();
        let order = GraphCompiler::new().compile(&nodes, &edges).unwrap();
        assert_eq!(ids(&order), vec!["pm", "sa", "pg", "qa"]);
    }

    #[test]
    fn test_edges_override_insertion_order() {
        let (mut nodes, edges) = pipeline();
        nodes.reverse();
        let order = GraphCompiler::new().compile(&nodes, &edges).unwrap();
        assert_eq!(ids(&order), vec!["pm", "sa", "pg", "qa"]);
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let nodes = vec![
            node("pm", AgentRole::Pm),
            node("qa", AgentRole::Qa),
            node("sa", AgentRole::Sa),
            node("pg", AgentRole::Pg),
        ];
        let edges = vec![Edge::new("pm", "qa"), Edge::new("pm", "sa")];
        let order = GraphCompiler::new().compile(&nodes, &edges).unwrap();
        // pg has no incoming edges so it is ready right after pm
        assert_eq!(ids(&order), vec!["pm", "pg", "qa", "sa"]);

        let again = GraphCompiler::new().compile(&nodes, &edges).unwrap();
        assert_eq!(ids(&order), ids(&again));
    }

    #[test]
    fn test_cycle_detection() {
        let (nodes, mut edges) = pipeline();
        edges.push(Edge::new("qa", "sa"));
        let err = GraphCompiler::new().compile(&nodes, &edges).unwrap_err();
        match err {
            GraphValidationError::CycleDetected { nodes } => {
                assert_eq!(nodes, vec!["sa", "pg", "qa"]);
            }
            other => panic!("Expected CycleDetected, got {:?}", other),
        }
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let (nodes, mut edges) = pipeline();
        edges.push(Edge::new("pm", "pm"));
        let err = GraphCompiler::new().compile(&nodes, &edges).unwrap_err();
        assert!(matches!(err, GraphValidationError::CycleDetected { .. }));
    }

    #[test]
    fn test_missing_required_roles_are_all_named() {
        let nodes = vec![node("pm", AgentRole::Pm), node("sa", AgentRole::Sa)];
        let err = GraphCompiler::new().compile(&nodes, &[]).unwrap_err();
        assert_eq!(
            err,
            GraphValidationError::MissingRequiredRole {
                roles: vec!["PG".to_string(), "QA".to_string()]
            }
        );
    }

    #[test]
    fn test_role_check_runs_before_cycle_check() {
        let nodes = vec![node("a", AgentRole::Pm), node("b", AgentRole::Pm)];
        let edges = vec![Edge::new("a", "b"), Edge::new("b", "a")];
        let err = GraphCompiler::new().compile(&nodes, &edges).unwrap_err();
        assert!(matches!(err, GraphValidationError::MissingRequiredRole { .. }));
    }

    #[test]
    fn test_empty_graph_rejected() {
        let err = GraphCompiler::with_required_roles(vec![])
            .compile(&[], &[])
            .unwrap_err();
        assert_eq!(err, GraphValidationError::EmptyGraph);
    }

    #[test]
    fn test_duplicate_node_id_rejected() {
        let (mut nodes, edges) = pipeline();
        nodes.push(node("pm", AgentRole::Custom("EXTRA".to_string())));
        let err = GraphCompiler::new().compile(&nodes, &edges).unwrap_err();
        assert_eq!(
            err,
            GraphValidationError::DuplicateNode {
                id: "pm".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_edge_endpoints_are_ignored() {
        let (nodes, mut edges) = pipeline();
        edges.push(Edge::new("ghost", "pm"));
        edges.push(Edge::new("qa", "ghost"));
        let order = GraphCompiler::new().compile(&nodes, &edges).unwrap();
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_custom_required_roles() {
        let designer = AgentRole::Custom("DESIGNER".to_string());
        let compiler = GraphCompiler::with_required_roles(vec![designer.clone()]);
        let nodes = vec![node("d", designer)];
        assert_eq!(compiler.compile(&nodes, &[]).unwrap().len(), 1);
        assert!(compiler.compile(&[node("pm", AgentRole::Pm)], &[]).is_err());
    }

    #[test]
    fn test_random_dags_respect_every_edge() {
        // Small LCG so the test is deterministic without extra dependencies.
        let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
        let mut next = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as usize
        };

        let compiler = GraphCompiler::with_required_roles(vec![]);
        for _ in 0..50 {
            let count = 2 + next() % 12;
            // Hidden ranking: edges only go from lower to higher rank.
            let mut rank: Vec<usize> = (0..count).collect();
            for i in (1..count).rev() {
                rank.swap(i, next() % (i + 1));
            }
            let nodes: Vec<Node> = (0..count)
                .map(|i| node(&format!("n{}", i), AgentRole::Pg))
                .collect();
            let mut edges = Vec::new();
            for a in 0..count {
                for b in 0..count {
                    if rank[a] < rank[b] && next() % 3 == 0 {
                        edges.push(Edge::new(&nodes[a].id, &nodes[b].id));
                    }
                }
            }

            let order = compiler.compile(&nodes, &edges).unwrap();
            assert_eq!(order.len(), count);
            let position: HashMap<&str, usize> = order
                .iter()
                .enumerate()
                .map(|(i, n)| (n.id.as_str(), i))
                .collect();
            for edge in &edges {
                assert!(position[edge.source_id.as_str()] < position[edge.target_id.as_str()]);
            }
        }
    }
}
