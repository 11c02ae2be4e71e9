use std::collections::{HashMap, HashSet, VecDeque};

/// Directed graph keyed by node name.
///
/// Each node maps to the ordered list of its immediate downstream nodes.
/// Registration order is remembered so queries return names deterministically.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    order: Vec<String>,
    edges: HashMap<String, Vec<String>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` with an empty downstream list.
    ///
    /// Re-adding an existing name resets its edge list.
    pub fn add_node(&mut self, name: impl Into<String>) {
        let name = name.into();
        if self.edges.insert(name.clone(), Vec::new()).is_none() {
            self.order.push(name);
        }
    }

    /// Appends `downstream` to the edge list of `upstream`.
    ///
    /// No self-loop or duplicate-edge guard is applied here.
    pub fn set_downstream(&mut self, upstream: &str, downstream: impl Into<String>) {
        if !self.edges.contains_key(upstream) {
            self.add_node(upstream);
        }
        if let Some(list) = self.edges.get_mut(upstream) {
            list.push(downstream.into());
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.edges.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn downstream(&self, name: &str) -> &[String] {
        self.edges.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns true when the graph has no cycle.
    ///
    /// Kahn's algorithm: repeatedly peel off nodes whose in-degree is zero.
    /// The graph is acyclic iff every node gets peeled.
    pub fn validate(&self) -> bool {
        self.topological_order().len() == self.order.len()
    }

    /// Nodes in a topological order. Shorter than [`Graph::len`] when a
    /// cycle exists; the nodes on or behind the cycle are left out.
    pub fn topological_order(&self) -> Vec<String> {
        let mut degree: HashMap<&str, usize> =
            self.order.iter().map(|n| (n.as_str(), 0)).collect();

        for targets in self.edges.values() {
            for target in targets {
                if let Some(d) = degree.get_mut(target.as_str()) {
                    *d += 1;
                }
            }
        }

        let mut queue: VecDeque<&str> = self
            .order
            .iter()
            .map(String::as_str)
            .filter(|n| degree[n] == 0)
            .collect();

        let mut sorted = Vec::with_capacity(self.order.len());

        while let Some(node) = queue.pop_front() {
            sorted.push(node.to_string());
            for next in self.downstream(node) {
                if let Some(d) = degree.get_mut(next.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(next.as_str());
                    }
                }
            }
        }

        sorted
    }

    /// Immediate upstream nodes of `node`: every node whose edge list contains it.
    pub fn dependencies(&self, node: &str) -> Vec<String> {
        self.order
            .iter()
            .filter(|up| self.downstream(up).iter().any(|d| d == node))
            .cloned()
            .collect()
    }

    /// Nodes that never appear as an edge target.
    pub fn independent_nodes(&self) -> Vec<String> {
        let targets: HashSet<&str> = self
            .edges
            .values()
            .flat_map(|ds| ds.iter().map(String::as_str))
            .collect();

        self.order
            .iter()
            .filter(|n| !targets.contains(n.as_str()))
            .cloned()
            .collect()
    }

    pub fn is_downstream(&self, node: &str) -> bool {
        self.edges.values().any(|ds| ds.iter().any(|d| d == node))
    }

    /// Prints each root followed by its downstream chains.
    pub fn print(&self) {
        for root in self.independent_nodes() {
            println!("{}", root);
            self.print_chain(&root, "  ");
            println!();
        }
    }

    fn print_chain(&self, name: &str, prefix: &str) {
        for child in self.downstream(name) {
            println!("{}└─> {}", prefix, child);
            self.print_chain(child, &format!("{}    ", prefix));
        }
    }
}
