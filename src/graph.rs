use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::{JobError, Node};

struct Entry<N> {
    node: Arc<N>,
    precursors: Vec<String>,
}

/// Nodes and their precursor edges.
///
/// Edges are only ever set explicitly through [`Graph::set_precursors`];
/// nothing is inferred. Finish building the graph before planning it.
pub struct Graph<N> {
    all: HashMap<String, Entry<N>>,
}

impl<N> Default for Graph<N> {
    fn default() -> Self {
        Self {
            all: HashMap::new(),
        }
    }
}

impl<N: Node> Graph<N> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `node`, replacing any node with the same id. A replaced node
    /// loses its precursors.
    pub fn add_node(&mut self, node: N) {
        let id = node.id().to_string();
        self.all.insert(
            id,
            Entry {
                node: Arc::new(node),
                precursors: Vec::new(),
            },
        );
    }

    pub fn add_nodes(&mut self, nodes: impl IntoIterator<Item = N>) {
        for node in nodes {
            self.add_node(node);
        }
    }

    /// Replaces the precursors of `id`.
    ///
    /// Every id is checked before anything changes: on error the previous
    /// precursors of `id` are kept as they were.
    pub fn set_precursors<I, S>(&mut self, id: &str, precursors: I) -> Result<(), JobError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if !self.all.contains_key(id) {
            return Err(JobError::UnknownNode(id.to_string()));
        }

        let mut resolved: Vec<String> = Vec::new();
        for precursor in precursors {
            let precursor = precursor.as_ref();
            if !self.all.contains_key(precursor) {
                return Err(JobError::UnknownNode(precursor.to_string()));
            }
            if !resolved.iter().any(|p| p == precursor) {
                resolved.push(precursor.to_string());
            }
        }

        if let Some(entry) = self.all.get_mut(id) {
            entry.precursors = resolved;
        }
        Ok(())
    }

    pub fn set_precursor_nodes(&mut self, node: &N, precursors: &[&N]) -> Result<(), JobError> {
        self.set_precursors(node.id(), precursors.iter().map(|p| p.id()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.all.contains_key(id)
    }

    pub fn node(&self, id: &str) -> Option<&N> {
        self.all.get(id).map(|e| e.node.as_ref())
    }

    /// Direct precursors of `id`, in the order they were set.
    pub fn precursors(&self, id: &str) -> Option<&[String]> {
        self.all.get(id).map(|e| e.precursors.as_slice())
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// Orders `targets` and everything they transitively depend on so that
    /// each node comes after all of its precursors.
    ///
    /// Nodes not reachable from the targets are left out. If no node can be
    /// placed in a full pass, every node still waiting is reported as
    /// [`JobError::CircularDependency`]; this includes nodes that are only
    /// blocked behind the cycle.
    pub fn plan<I, S>(&self, targets: I) -> Result<Plan<N>, JobError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut todo: BTreeSet<String> = BTreeSet::new();
        for target in targets {
            let target = target.as_ref();
            if !self.all.contains_key(target) {
                return Err(JobError::UnknownTarget(target.to_string()));
            }
            todo.insert(target.to_string());
        }

        let mut placed: HashSet<String> = HashSet::with_capacity(todo.len());
        let mut nodes = Vec::with_capacity(todo.len());

        while !todo.is_empty() {
            let mut progress = false;
            let pass: Vec<String> = todo.iter().cloned().collect();

            for id in pass {
                let entry = self
                    .all
                    .get(&id)
                    .ok_or_else(|| JobError::UnknownNode(id.clone()))?;

                let mut ready = true;
                for precursor in &entry.precursors {
                    if !placed.contains(precursor) {
                        ready = false;
                        if todo.insert(precursor.clone()) {
                            progress = true;
                        }
                    }
                }

                if ready {
                    todo.remove(&id);
                    placed.insert(id.clone());
                    nodes.push(PlannedNode {
                        id,
                        node: Arc::clone(&entry.node),
                        precursors: entry.precursors.clone(),
                    });
                    progress = true;
                }
            }

            if !progress {
                return Err(JobError::CircularDependency(todo.into_iter().collect()));
            }
        }

        Ok(Plan { nodes })
    }

    pub fn plan_nodes(&self, targets: &[&N]) -> Result<Plan<N>, JobError> {
        self.plan(targets.iter().map(|t| t.id()))
    }
}

/// One node of a [`Plan`] together with its direct precursors.
#[derive(Debug)]
pub struct PlannedNode<N> {
    id: String,
    node: Arc<N>,
    precursors: Vec<String>,
}

impl<N> PlannedNode<N> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node(&self) -> &Arc<N> {
        &self.node
    }

    pub fn precursors(&self) -> &[String] {
        &self.precursors
    }
}

impl<N> Clone for PlannedNode<N> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            node: Arc::clone(&self.node),
            precursors: self.precursors.clone(),
        }
    }
}

/// Nodes in an order where every node follows its precursors.
#[derive(Debug)]
pub struct Plan<N> {
    pub(crate) nodes: Vec<PlannedNode<N>>,
}

impl<N> Plan<N> {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PlannedNode<N>> {
        self.nodes.iter()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.id()).collect()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }
}

impl<N> Clone for Plan<N> {
    fn clone(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
        }
    }
}

impl<N> fmt::Display for Plan<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.nodes.iter().enumerate() {
            writeln!(f, "{}. {}", i + 1, node.id)?;
        }
        Ok(())
    }
}

impl<'a, N> IntoIterator for &'a Plan<N> {
    type Item = &'a PlannedNode<N>;
    type IntoIter = std::slice::Iter<'a, PlannedNode<N>>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(ids: &[&'static str]) -> Graph<&'static str> {
        let mut g = Graph::new();
        g.add_nodes(ids.iter().copied());
        g
    }

    fn assert_ordered(plan: &Plan<&'static str>) {
        for node in plan {
            let at = plan.position(node.id()).unwrap();
            for p in node.precursors() {
                assert!(plan.position(p).unwrap() < at, "{} planned before {}", node.id(), p);
            }
        }
    }

    #[test]
    fn chain_is_planned_in_dependency_order() {
        let mut g = graph(&["a", "b", "c"]);
        g.set_precursors("c", ["b"]).unwrap();
        g.set_precursors("b", ["a"]).unwrap();

        let plan = g.plan(["c"]).unwrap();
        assert_eq!(plan.ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn diamond_contains_each_node_once() {
        let mut g = graph(&["root", "left", "right", "join"]);
        g.set_precursors("left", ["root"]).unwrap();
        g.set_precursors("right", ["root"]).unwrap();
        g.set_precursors("join", ["left", "right"]).unwrap();

        let plan = g.plan(["join", "left"]).unwrap();
        assert_eq!(plan.len(), 4);
        assert_eq!(plan.ids()[0], "root");
        assert_eq!(plan.ids()[3], "join");
        assert_ordered(&plan);
    }

    #[test]
    fn unrelated_nodes_are_left_out() {
        let mut g = graph(&["a", "b", "x"]);
        g.set_precursors("b", ["a"]).unwrap();

        let plan = g.plan(["b"]).unwrap();
        assert_eq!(plan.ids(), vec!["a", "b"]);
    }

    #[test]
    fn unknown_target_is_reported() {
        let g = graph(&["a"]);
        assert_eq!(
            g.plan(["a", "nope"]).unwrap_err(),
            JobError::UnknownTarget("nope".into())
        );
    }

    #[test]
    fn set_precursors_rejects_unknown_ids_without_changes() {
        let mut g = graph(&["a", "b"]);
        g.set_precursors("b", ["a"]).unwrap();

        assert_eq!(
            g.set_precursors("b", ["missing"]).unwrap_err(),
            JobError::UnknownNode("missing".into())
        );
        assert_eq!(g.precursors("b").unwrap(), ["a".to_string()]);

        assert_eq!(
            g.set_precursors("ghost", ["a"]).unwrap_err(),
            JobError::UnknownNode("ghost".into())
        );
        assert!(g.plan(["b"]).is_ok());
    }

    #[test]
    fn set_precursors_overwrites() {
        let mut g = graph(&["a", "b", "c"]);
        g.set_precursors("c", ["a"]).unwrap();
        g.set_precursors("c", ["b", "b"]).unwrap();
        assert_eq!(g.precursors("c").unwrap(), ["b".to_string()]);
    }

    #[test]
    fn re_adding_a_node_clears_its_precursors() {
        let mut g = graph(&["a", "b"]);
        g.set_precursors("b", ["a"]).unwrap();
        g.add_node("b");

        assert!(g.precursors("b").unwrap().is_empty());
        assert_eq!(g.plan(["b"]).unwrap().ids(), vec!["b"]);
    }

    #[test]
    fn cycle_is_reported_with_blocked_nodes() {
        let mut g = graph(&["a", "b", "c", "d"]);
        g.set_precursors("a", ["b"]).unwrap();
        g.set_precursors("b", ["a"]).unwrap();
        g.set_precursors("c", ["a"]).unwrap();
        g.set_precursors("d", ["c"]).unwrap();

        assert_eq!(
            g.plan(["d"]).unwrap_err(),
            JobError::CircularDependency(vec!["a".into(), "b".into(), "c".into(), "d".into()])
        );
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let mut g = graph(&["a"]);
        g.set_precursors("a", ["a"]).unwrap();
        assert_eq!(
            g.plan(["a"]).unwrap_err(),
            JobError::CircularDependency(vec!["a".into()])
        );
    }

    #[test]
    fn unreachable_cycle_does_not_block_planning() {
        let mut g = graph(&["a", "b", "ok"]);
        g.set_precursors("a", ["b"]).unwrap();
        g.set_precursors("b", ["a"]).unwrap();
        assert_eq!(g.plan(["ok"]).unwrap().ids(), vec!["ok"]);
    }

    #[test]
    fn set_precursor_nodes_uses_node_ids() {
        let mut g = Graph::new();
        let (a, b) = ("a".to_string(), "b".to_string());
        g.add_nodes([a.clone(), b.clone()]);
        g.set_precursor_nodes(&b, &[&a]).unwrap();

        let plan = g.plan_nodes(&[&b]).unwrap();
        assert_eq!(plan.ids(), vec!["a", "b"]);
        assert_eq!(plan.iter().last().unwrap().node().as_str(), "b");
    }

    #[test]
    fn plan_renders_as_numbered_list() {
        let mut g = graph(&["a", "b"]);
        g.set_precursors("b", ["a"]).unwrap();
        assert_eq!(g.plan(["b"]).unwrap().to_string(), "1. a\n2. b\n");
    }
}
