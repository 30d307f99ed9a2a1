use std::collections::HashMap;

use petgraph::algo::astar;
use petgraph::graph::{NodeIndex, UnGraph};

use crate::error::{ImportsError, Result};

/// Undirected graph of classification schemes.
///
/// Nodes are scheme names (the column names concordances use), edges carry
/// the index of the concordance that links the two schemes. A concordance
/// can be walked either way since it is a plain code-pair relation.
pub struct SchemeGraph {
    graph: UnGraph<String, usize>,
    /// Map from scheme name → NodeIndex for fast lookup.
    node_map: HashMap<String, NodeIndex>,
}

impl SchemeGraph {
    pub fn new() -> Self {
        Self {
            graph: UnGraph::new_undirected(),
            node_map: HashMap::new(),
        }
    }

    /// Build from (scheme, scheme) pairs; edge weight is the pair's position.
    pub fn from_links<'a>(links: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut g = Self::new();
        for (i, (a, b)) in links.into_iter().enumerate() {
            g.add_link(a, b, i);
        }
        g
    }

    pub fn add_link(&mut self, a: &str, b: &str, concordance: usize) {
        let a_idx = self.node(a);
        let b_idx = self.node(b);
        self.graph.add_edge(a_idx, b_idx, concordance);
    }

    fn node(&mut self, scheme: &str) -> NodeIndex {
        if let Some(&idx) = self.node_map.get(scheme) {
            return idx;
        }
        let idx = self.graph.add_node(scheme.to_string());
        self.node_map.insert(scheme.to_string(), idx);
        idx
    }

    /// Concordance indices along the shortest scheme path from `from` to `to`.
    pub fn path(&self, from: &str, to: &str) -> Result<Vec<usize>> {
        let no_path = || ImportsError::NoConcordancePath {
            from: from.to_string(),
            to: to.to_string(),
        };
        let (&start, &goal) = self
            .node_map
            .get(from)
            .zip(self.node_map.get(to))
            .ok_or_else(no_path)?;
        if start == goal {
            return Err(ImportsError::InvalidData(format!(
                "concordance path requested from '{from}' to itself"
            )));
        }

        let (_, nodes) = astar(&self.graph, start, |n| n == goal, |_| 1usize, |_| 0)
            .ok_or_else(no_path)?;

        nodes
            .windows(2)
            .map(|w| {
                self.graph
                    .find_edge(w[0], w[1])
                    .map(|e| self.graph[e])
                    .ok_or_else(no_path)
            })
            .collect()
    }
}

impl Default for SchemeGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::scheme;

    #[test]
    fn finds_gloria_to_bea_chain() {
        let g = SchemeGraph::from_links([
            (scheme::GLORIA, scheme::HSCPC),
            (scheme::ISIC4, scheme::HSCPC),
            (scheme::ISIC4, scheme::NAICS_2012),
            (scheme::BEA_SUMMARY, scheme::NAICS_2012),
        ]);
        assert_eq!(g.path(scheme::GLORIA, scheme::BEA_SUMMARY).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(g.path(scheme::BEA_SUMMARY, scheme::HSCPC).unwrap(), vec![3, 2, 1]);
    }

    #[test]
    fn prefers_shorter_chain() {
        let g = SchemeGraph::from_links([
            (scheme::EXIOBASE, scheme::NAICS_2012),
            (scheme::NAICS_2012, scheme::BEA_DETAIL),
            (scheme::EXIOBASE, scheme::BEA_DETAIL),
        ]);
        assert_eq!(g.path(scheme::EXIOBASE, scheme::BEA_DETAIL).unwrap(), vec![2]);
    }

    #[test]
    fn disconnected_schemes_have_no_path() {
        let g = SchemeGraph::from_links([("A", "B"), ("C", "D")]);
        assert!(matches!(
            g.path("A", "D"),
            Err(ImportsError::NoConcordancePath { .. })
        ));
        assert!(g.path("A", "Z").is_err());
    }
}
