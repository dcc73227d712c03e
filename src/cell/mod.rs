//! Cell search space
//!
//! Defines the space of cell descriptions the controller samples from:
//! per-node operation choices and input connections for a normal cell and
//! a reduction cell.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{EnasError, Result};

/// Types of node operations in the search space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// Identity (skip connection, no weights)
    Identity,
    /// Linear transform
    Dense,
    /// Linear transform with ReLU
    ReluDense,
    /// Linear transform with tanh
    TanhDense,
    /// Sigmoid-gated linear transform
    GatedDense,
}

impl OperationType {
    /// The standard operation set searched over
    pub fn standard_ops() -> Vec<Self> {
        vec![
            Self::Identity,
            Self::Dense,
            Self::ReluDense,
            Self::TanhDense,
            Self::GatedDense,
        ]
    }

    /// Whether the operation carries a trainable weight matrix
    pub fn has_weights(&self) -> bool {
        !matches!(self, Self::Identity)
    }

    /// Stable name used in weight-bank layer keys
    pub fn key_name(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Dense => "dense",
            Self::ReluDense => "relu_dense",
            Self::TanhDense => "tanh_dense",
            Self::GatedDense => "gated_dense",
        }
    }
}

/// Cell type in the macro template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellType {
    /// Normal cell
    Normal,
    /// Reduction cell
    Reduction,
}

impl CellType {
    /// Stable prefix used in weight-bank layer keys
    pub fn key_name(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Reduction => "reduction",
        }
    }
}

/// One node of a cell: an operation applied to two prior states.
///
/// Input index `0` and `1` are the two cell inputs; index `2 + k` is the
/// output of node `k`. Node `t` may therefore reference indices
/// `0..t + 2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Index into the operation set
    pub oper: usize,
    /// Indices of the two input states
    pub inputs: [usize; 2],
}

/// An ordered sequence of node specifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub nodes: Vec<NodeSpec>,
}

impl Cell {
    pub fn new(nodes: Vec<NodeSpec>) -> Self {
        Self { nodes }
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check node count, operation indices and input connectivity against
    /// the search space.
    pub fn validate(&self, space: &SearchSpace) -> Result<()> {
        if self.len() != space.num_nodes() {
            return Err(EnasError::ValidationError(format!(
                "cell has {} nodes, search space expects {}",
                self.len(),
                space.num_nodes()
            )));
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.oper >= space.num_opers() {
                return Err(EnasError::ValidationError(format!(
                    "node {} selects operation {} out of {}",
                    idx,
                    node.oper,
                    space.num_opers()
                )));
            }
            for &inp in &node.inputs {
                if inp >= idx + 2 {
                    return Err(EnasError::ValidationError(format!(
                        "node {} connects to state {} but only {} exist",
                        idx,
                        inp,
                        idx + 2
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A sampled pair of cell descriptions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellPair {
    pub normal: Cell,
    pub reduction: Cell,
}

/// Configuration for the cell search space
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSpaceConfig {
    /// Nodes per cell
    pub num_nodes: usize,
    /// Available node operations
    pub operations: Vec<OperationType>,
}

impl Default for SearchSpaceConfig {
    fn default() -> Self {
        Self {
            num_nodes: 6,
            operations: OperationType::standard_ops(),
        }
    }
}

/// The cell search space
#[derive(Debug, Clone)]
pub struct SearchSpace {
    pub config: SearchSpaceConfig,
}

impl SearchSpace {
    pub fn new(config: SearchSpaceConfig) -> Self {
        Self { config }
    }

    /// Default search space (6 nodes, 5 operations)
    pub fn standard() -> Self {
        Self::new(SearchSpaceConfig::default())
    }

    /// Number of operation choices
    pub fn num_opers(&self) -> usize {
        self.config.operations.len()
    }

    /// Nodes per cell
    pub fn num_nodes(&self) -> usize {
        self.config.num_nodes
    }

    /// Operation for a sampled index
    pub fn operation(&self, oper: usize) -> OperationType {
        self.config.operations[oper]
    }

    /// Sample a cell uniformly at random
    pub fn sample_random(&self, rng: &mut impl Rng) -> Cell {
        let nodes = (0..self.num_nodes())
            .map(|idx| NodeSpec {
                oper: rng.gen_range(0..self.num_opers()),
                inputs: [rng.gen_range(0..idx + 2), rng.gen_range(0..idx + 2)],
            })
            .collect();
        Cell::new(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    #[test]
    fn test_search_space_creation() {
        let space = SearchSpace::standard();
        assert_eq!(space.num_nodes(), 6);
        assert_eq!(space.num_opers(), 5);
    }

    #[test]
    fn test_sample_random_cell() {
        let space = SearchSpace::standard();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);

        let cell = space.sample_random(&mut rng);

        assert_eq!(cell.len(), space.num_nodes());
        assert!(cell.validate(&space).is_ok());
    }

    #[test]
    fn test_validate_rejects_short_cell() {
        let space = SearchSpace::standard();
        let cell = Cell::new(vec![NodeSpec { oper: 0, inputs: [0, 1] }]);

        assert!(cell.validate(&space).is_err());
    }

    #[test]
    fn test_validate_rejects_forward_connection() {
        let space = SearchSpace::standard();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        let mut cell = space.sample_random(&mut rng);
        // Node 0 may only see the two cell inputs.
        cell.nodes[0].inputs = [0, 3];

        assert!(cell.validate(&space).is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_operation() {
        let space = SearchSpace::standard();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        let mut cell = space.sample_random(&mut rng);
        cell.nodes[2].oper = space.num_opers();

        assert!(cell.validate(&space).is_err());
    }

    #[test]
    fn test_cell_serde_round_trip() {
        let space = SearchSpace::standard();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        let cell = space.sample_random(&mut rng);

        let json = serde_json::to_string(&cell).unwrap();
        let back: Cell = serde_json::from_str(&json).unwrap();
        assert_eq!(cell, back);
    }
}
