//! Adjacency index over a [`Graph`].
//!
//! Forward and reverse adjacency are kept as two maps keyed by node ID.
//! Wherever an algorithm has a free choice (Kahn's ready set, BFS
//! frontier) it picks nodes in their declaration order, so results are
//! deterministic for a given graph blob.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use super::entities::Graph;

#[derive(Debug, Clone, Default)]
pub struct GraphIndex {
    order: Vec<String>,
    rank: HashMap<String, usize>,
    adjacency: HashMap<String, Vec<String>>,
    reverse: HashMap<String, Vec<String>>,
}

impl GraphIndex {
    pub fn build(graph: &Graph) -> Self {
        let order: Vec<String> = graph.nodes.iter().map(|n| n.id.clone()).collect();
        let rank = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        let mut adjacency: HashMap<String, Vec<String>> =
            order.iter().map(|id| (id.clone(), Vec::new())).collect();
        let mut reverse = adjacency.clone();
        for edge in &graph.edges {
            adjacency
                .entry(edge.source.clone())
                .or_default()
                .push(edge.target.clone());
            reverse
                .entry(edge.target.clone())
                .or_default()
                .push(edge.source.clone());
        }
        Self {
            order,
            rank,
            adjacency,
            reverse,
        }
    }

    pub fn successors(&self, id: &str) -> &[String] {
        self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn predecessors(&self, id: &str) -> &[String] {
        self.reverse.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn in_degree(&self, id: &str) -> usize {
        self.predecessors(id).len()
    }

    pub fn out_degree(&self, id: &str) -> usize {
        self.successors(id).len()
    }

    /// Node IDs with no incoming edges, in declaration order.
    pub fn sources(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|id| self.in_degree(id) == 0)
            .map(String::as_str)
            .collect()
    }

    /// Node IDs with no outgoing edges, in declaration order.
    pub fn sinks(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|id| self.out_degree(id) == 0)
            .map(String::as_str)
            .collect()
    }

    /// Every node reachable from `start` (inclusive) by breadth-first search.
    pub fn reachable_from(&self, start: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        seen.insert(start.to_string());
        queue.push_back(start.to_string());
        while let Some(id) = queue.pop_front() {
            for next in self.successors(&id) {
                if seen.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }
        seen
    }

    /// Every node with a path to `id` (exclusive).
    pub fn ancestors(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = self.predecessors(id).iter().map(String::as_str).collect();
        while let Some(cur) = stack.pop() {
            if seen.insert(cur.to_string()) {
                stack.extend(self.predecessors(cur).iter().map(String::as_str));
            }
        }
        seen
    }

    /// Kahn's algorithm. Returns `None` when the graph has a cycle.
    pub fn topological_order(&self) -> Option<Vec<String>> {
        let mut remaining: HashMap<&str, usize> = self
            .order
            .iter()
            .map(|id| (id.as_str(), self.in_degree(id)))
            .collect();
        let mut ready: BTreeSet<usize> = self
            .order
            .iter()
            .enumerate()
            .filter(|(_, id)| self.in_degree(id) == 0)
            .map(|(i, _)| i)
            .collect();

        let mut out = Vec::with_capacity(self.order.len());
        while let Some(i) = ready.pop_first() {
            let id = &self.order[i];
            out.push(id.clone());
            for next in self.successors(id) {
                if let Some(deg) = remaining.get_mut(next.as_str()) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        if let Some(&r) = self.rank.get(next) {
                            ready.insert(r);
                        }
                    }
                }
            }
        }

        (out.len() == self.order.len()).then_some(out)
    }

    pub fn has_cycle(&self) -> bool {
        self.topological_order().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::entities::{Edge, Node, NodeData, NodeType, Position};

    fn node(id: &str) -> Node {
        Node {
            id: id.into(),
            title: id.into(),
            description: String::new(),
            position: Position::default(),
            inputs: vec![],
            outputs: vec![],
            data: NodeData::TemplateTransform {
                template: String::new(),
            },
        }
    }

    fn edge(s: &str, t: &str) -> Edge {
        Edge {
            id: format!("{}-{}", s, t),
            source: s.into(),
            source_type: NodeType::TemplateTransform,
            target: t.into(),
            target_type: NodeType::TemplateTransform,
            source_handle_id: None,
        }
    }

    fn graph(nodes: &[&str], edges: &[(&str, &str)]) -> Graph {
        Graph {
            nodes: nodes.iter().map(|n| node(n)).collect(),
            edges: edges.iter().map(|(s, t)| edge(s, t)).collect(),
        }
    }

    #[test]
    fn test_topological_order_ties_follow_declaration() {
        let g = graph(&["a", "c", "b", "d"], &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")]);
        let idx = GraphIndex::build(&g);
        assert_eq!(idx.topological_order().unwrap(), vec!["a", "c", "b", "d"]);
    }

    #[test]
    fn test_cycle_detected() {
        let g = graph(&["a", "b", "c"], &[("a", "b"), ("b", "a")]);
        assert!(GraphIndex::build(&g).has_cycle());
    }

    #[test]
    fn test_ancestors_and_reachability() {
        let g = graph(&["a", "b", "c", "d"], &[("a", "b"), ("b", "c")]);
        let idx = GraphIndex::build(&g);
        let anc = idx.ancestors("c");
        assert!(anc.contains("a") && anc.contains("b") && !anc.contains("c"));
        let reach = idx.reachable_from("a");
        assert_eq!(reach.len(), 3);
        assert!(!reach.contains("d"));
        assert_eq!(idx.sources(), vec!["a", "d"]);
        assert_eq!(idx.sinks(), vec!["c", "d"]);
    }
}
