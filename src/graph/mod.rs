//! Architecture graph generation
//!
//! Turns a sampled cell pair and the macro template into a buildable
//! computation graph with stable weight-bank keys per layer.

use serde::{Deserialize, Serialize};

use crate::cell::{Cell, CellType, OperationType, SearchSpace};
use crate::error::{EnasError, Result};

/// Weight key of the input projection layer
pub const STEM_KEY: &str = "stem/dense";
/// Weight key of the output softmax layer
pub const HEAD_KEY: &str = "head/softmax";

/// One resolved node of a cell graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub op: OperationType,
    pub inputs: [usize; 2],
    /// Weight-bank key; `None` for weightless operations
    pub weight_key: Option<String>,
}

/// A buildable computation graph: the macro template with both cell
/// descriptions resolved to operations and weight keys.
///
/// Template positions of the same cell type share nodes and therefore
/// weight keys; this is where weight sharing across stacked cells comes
/// from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchitectureGraph {
    pub template: Vec<CellType>,
    pub normal_nodes: Vec<GraphNode>,
    pub reduction_nodes: Vec<GraphNode>,
}

impl ArchitectureGraph {
    /// Nodes for one template position
    pub fn nodes_for(&self, cell_type: CellType) -> &[GraphNode] {
        match cell_type {
            CellType::Normal => &self.normal_nodes,
            CellType::Reduction => &self.reduction_nodes,
        }
    }

    /// Every weight key the graph can carry, stem and head included
    pub fn weight_keys(&self) -> Vec<String> {
        let mut keys = vec![STEM_KEY.to_string(), HEAD_KEY.to_string()];
        for nodes in [&self.normal_nodes, &self.reduction_nodes] {
            keys.extend(nodes.iter().filter_map(|n| n.weight_key.clone()));
        }
        keys
    }
}

/// Builds a computation graph from a cell pair
pub trait GraphBuilder {
    fn build(&self, normal: &Cell, reduction: &Cell) -> Result<ArchitectureGraph>;
}

/// Default builder: validates cells against the search space and resolves
/// macro-template markers.
#[derive(Debug, Clone)]
pub struct CellGraphBuilder {
    space: SearchSpace,
    template: Vec<CellType>,
}

impl CellGraphBuilder {
    pub fn new(space: SearchSpace, template: Vec<CellType>) -> Self {
        Self { space, template }
    }

    fn resolve(&self, cell: &Cell, cell_type: CellType) -> Vec<GraphNode> {
        cell.nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| {
                let op = self.space.operation(node.oper);
                let weight_key = op
                    .has_weights()
                    .then(|| format!("{}/n{}/{}", cell_type.key_name(), idx, op.key_name()));
                GraphNode {
                    op,
                    inputs: node.inputs,
                    weight_key,
                }
            })
            .collect()
    }
}

impl GraphBuilder for CellGraphBuilder {
    fn build(&self, normal: &Cell, reduction: &Cell) -> Result<ArchitectureGraph> {
        if self.template.is_empty() {
            return Err(EnasError::ValidationError(
                "macro template is empty".to_string(),
            ));
        }
        normal.validate(&self.space)?;
        reduction.validate(&self.space)?;

        Ok(ArchitectureGraph {
            template: self.template.clone(),
            normal_nodes: self.resolve(normal, CellType::Normal),
            reduction_nodes: self.resolve(reduction, CellType::Reduction),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn builder() -> CellGraphBuilder {
        CellGraphBuilder::new(
            SearchSpace::standard(),
            vec![CellType::Normal, CellType::Normal, CellType::Reduction],
        )
    }

    fn sampled_pair(seed: u64) -> (Cell, Cell) {
        let space = SearchSpace::standard();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        (space.sample_random(&mut rng), space.sample_random(&mut rng))
    }

    #[test]
    fn test_build_resolves_template() {
        let (normal, reduction) = sampled_pair(42);
        let graph = builder().build(&normal, &reduction).unwrap();

        assert_eq!(graph.template.len(), 3);
        assert_eq!(graph.normal_nodes.len(), 6);
        assert_eq!(graph.reduction_nodes.len(), 6);
        assert_eq!(graph.nodes_for(CellType::Normal).len(), 6);
    }

    #[test]
    fn test_weight_keys_include_stem_and_head() {
        let (normal, reduction) = sampled_pair(42);
        let graph = builder().build(&normal, &reduction).unwrap();
        let keys = graph.weight_keys();

        assert!(keys.contains(&STEM_KEY.to_string()));
        assert!(keys.contains(&HEAD_KEY.to_string()));
    }

    #[test]
    fn test_identity_nodes_have_no_key() {
        let space = SearchSpace::standard();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let mut normal = space.sample_random(&mut rng);
        normal.nodes[0].oper = 0; // Identity
        let reduction = space.sample_random(&mut rng);

        let graph = builder().build(&normal, &reduction).unwrap();
        assert!(graph.normal_nodes[0].weight_key.is_none());
    }

    #[test]
    fn test_same_node_same_key_across_cell_positions() {
        let (normal, reduction) = sampled_pair(9);
        let graph = builder().build(&normal, &reduction).unwrap();

        // The template stacks the normal cell twice; both positions read
        // the same node list, hence the same keys.
        let a = graph.nodes_for(graph.template[0]);
        let b = graph.nodes_for(graph.template[1]);
        assert_eq!(a[2].weight_key, b[2].weight_key);
    }

    #[test]
    fn test_empty_template_rejected() {
        let (normal, reduction) = sampled_pair(42);
        let builder = CellGraphBuilder::new(SearchSpace::standard(), vec![]);
        assert!(builder.build(&normal, &reduction).is_err());
    }

    #[test]
    fn test_mismatched_cell_rejected() {
        let (normal, reduction) = sampled_pair(42);
        let mut short = normal.clone();
        short.nodes.pop();
        assert!(builder().build(&short, &reduction).is_err());
    }
}
