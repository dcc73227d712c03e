//! Architecture sampling policies
//!
//! A recurrent controller emits per-node categorical distributions over
//! operations and input connections, samples concrete cells from them, and
//! is trained REINFORCE-style with the child network's validation accuracy
//! as reward. The search runs two independent instances of one policy type:
//! one for the normal cell, one for the reduction cell.

use std::fs::File;
use std::path::Path;

use ndarray::{Array1, Array2, Axis};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cell::{Cell, NodeSpec};
use crate::error::{EnasError, Result};

/// Controller hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Hidden state dimension
    pub hidden_dim: usize,
    /// Learning rate for policy updates
    pub learning_rate: f64,
    /// Baseline decay for REINFORCE
    pub baseline_decay: f64,
    /// Temperature dividing the logits
    pub temperature: f64,
    /// Tanh clamp applied to scaled logits
    pub tanh_constant: f64,
    /// Random seed for sampling
    pub seed: Option<u64>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            hidden_dim: 32,
            learning_rate: 0.00035,
            baseline_decay: 0.99,
            temperature: 5.0,
            tanh_constant: 2.5,
            seed: None,
        }
    }
}

/// Per-node categorical distributions produced by one controller forward
/// pass. `input_probs[t]` ranges over the `t + 2` states visible to node
/// `t`. Ephemeral; recomputed every epoch.
#[derive(Debug, Clone)]
pub struct CellDistribution {
    pub op_probs: Vec<Array1<f64>>,
    pub input_probs: Vec<Array1<f64>>,
}

impl CellDistribution {
    pub fn num_nodes(&self) -> usize {
        self.op_probs.len()
    }
}

/// One-hot training targets derived from a sampled cell
#[derive(Debug, Clone)]
pub struct ArchTargets {
    pub op_targets: Vec<Array1<f64>>,
    pub input_targets: Vec<Array1<f64>>,
}

impl ArchTargets {
    /// Build one-hot targets for the actions that produced `cell`.
    pub fn from_cell(cell: &Cell, num_opers: usize) -> Self {
        let mut op_targets = Vec::with_capacity(cell.len());
        let mut input_targets = Vec::with_capacity(cell.len());
        for (idx, node) in cell.nodes.iter().enumerate() {
            let mut op = Array1::zeros(num_opers);
            op[node.oper] = 1.0;
            op_targets.push(op);

            // Both input picks share one distribution; a doubly selected
            // state just gets the full mass.
            let mut inp = Array1::zeros(idx + 2);
            for &i in &node.inputs {
                inp[i] += 0.5;
            }
            input_targets.push(inp);
        }
        Self { op_targets, input_targets }
    }
}

/// An architecture sampler the orchestrator can drive
pub trait Policy {
    /// Pure forward pass; no parameter update.
    fn forward(&self) -> CellDistribution;

    /// Draw one concrete cell from a distribution. Stochastic.
    fn sample(&mut self, dist: &CellDistribution) -> Cell;

    /// One policy-gradient step toward `targets`, weighted by the
    /// advantage of `reward` over the internal baseline.
    fn train_step(&mut self, targets: &ArchTargets, reward: f64) -> Result<()>;

    /// Persist parameters (baseline included) to `path`.
    fn save(&self, path: &Path) -> Result<()>;

    /// Restore parameters from `path`. Missing or corrupt state is fatal.
    fn load(&mut self, path: &Path) -> Result<()>;
}

/// Trainable parameters of [`RnnPolicy`], the unit of checkpointing
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PolicyParams {
    op_embeddings: Array2<f64>,
    recurrent: Array2<f64>,
    input_bias: Array1<f64>,
    hidden_to_op: Array2<f64>,
    hidden_to_input: Array2<f64>,
    baseline: f64,
}

/// Recurrent architecture sampler trained with REINFORCE
#[derive(Debug)]
pub struct RnnPolicy {
    name: String,
    num_nodes: usize,
    num_opers: usize,
    config: ControllerConfig,
    params: PolicyParams,
    rng: Xoshiro256PlusPlus,
}

impl RnnPolicy {
    pub fn new(
        name: impl Into<String>,
        num_nodes: usize,
        num_opers: usize,
        config: ControllerConfig,
    ) -> Self {
        let mut rng = match config.seed {
            Some(s) => Xoshiro256PlusPlus::seed_from_u64(s),
            None => Xoshiro256PlusPlus::from_entropy(),
        };

        let hidden = config.hidden_dim;
        // Node t chooses among t + 2 input states; the widest case is the
        // last node.
        let max_inputs = num_nodes + 1;
        let scale = 0.1;
        let op_embeddings =
            Array2::from_shape_fn((num_opers, hidden), |_| (rng.gen::<f64>() - 0.5) * scale);
        let recurrent =
            Array2::from_shape_fn((hidden, hidden), |_| (rng.gen::<f64>() - 0.5) * scale);
        let hidden_to_op =
            Array2::from_shape_fn((hidden, num_opers), |_| (rng.gen::<f64>() - 0.5) * scale);
        let hidden_to_input =
            Array2::from_shape_fn((hidden, max_inputs), |_| (rng.gen::<f64>() - 0.5) * scale);
        let input_bias = Array1::from_shape_fn(hidden, |_| (rng.gen::<f64>() - 0.5) * scale);

        let params = PolicyParams {
            op_embeddings,
            recurrent,
            hidden_to_op,
            hidden_to_input,
            input_bias,
            baseline: 0.0,
        };

        Self {
            name: name.into(),
            num_nodes,
            num_opers,
            config,
            params,
            rng,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn baseline(&self) -> f64 {
        self.params.baseline
    }

    /// Scaled softmax over raw logits: divide by temperature, clamp with
    /// `tanh_constant * tanh`, normalize.
    fn scaled_softmax(&self, logits: &Array1<f64>) -> Array1<f64> {
        let scaled = logits.mapv(|x| self.config.tanh_constant * (x / self.config.temperature).tanh());
        softmax(&scaled)
    }

    /// Unroll the recurrence, returning the hidden state seen by each node
    /// alongside the emitted distributions. The feedback embedding is the
    /// argmax operation, which keeps the pass deterministic.
    fn unroll(&self) -> (Vec<Array1<f64>>, CellDistribution) {
        let mut hidden: Array1<f64> = Array1::zeros(self.config.hidden_dim);
        let mut states = Vec::with_capacity(self.num_nodes);
        let mut op_probs = Vec::with_capacity(self.num_nodes);
        let mut input_probs = Vec::with_capacity(self.num_nodes);

        for idx in 0..self.num_nodes {
            hidden = (self.params.recurrent.dot(&hidden) + &self.params.input_bias).mapv(f64::tanh);
            states.push(hidden.clone());

            let op_logits = self.params.hidden_to_op.t().dot(&hidden);
            let op = self.scaled_softmax(&op_logits);

            let input_logits = self.params.hidden_to_input.t().dot(&hidden);
            let visible = input_logits.slice(ndarray::s![..idx + 2]).to_owned();
            input_probs.push(self.scaled_softmax(&visible));

            let feedback = argmax(&op);
            hidden = &hidden + &self.params.op_embeddings.row(feedback);
            op_probs.push(op);
        }

        (states, CellDistribution { op_probs, input_probs })
    }
}

impl Policy for RnnPolicy {
    fn forward(&self) -> CellDistribution {
        self.unroll().1
    }

    fn sample(&mut self, dist: &CellDistribution) -> Cell {
        let nodes = (0..dist.num_nodes())
            .map(|idx| NodeSpec {
                oper: sample_categorical(&dist.op_probs[idx], &mut self.rng),
                inputs: [
                    sample_categorical(&dist.input_probs[idx], &mut self.rng),
                    sample_categorical(&dist.input_probs[idx], &mut self.rng),
                ],
            })
            .collect();
        Cell::new(nodes)
    }

    fn train_step(&mut self, targets: &ArchTargets, reward: f64) -> Result<()> {
        if targets.op_targets.len() != self.num_nodes {
            return Err(EnasError::ValidationError(format!(
                "targets cover {} nodes, policy {} expects {}",
                targets.op_targets.len(),
                self.name,
                self.num_nodes
            )));
        }

        self.params.baseline = self.config.baseline_decay * self.params.baseline
            + (1.0 - self.config.baseline_decay) * reward;
        let advantage = reward - self.params.baseline;
        let lr = self.config.learning_rate;

        let (states, dist) = self.unroll();
        for idx in 0..self.num_nodes {
            let h = states[idx].view().insert_axis(Axis(1));

            // Output-layer cross-entropy gradient, advantage weighted.
            let op_err = (&targets.op_targets[idx] - &dist.op_probs[idx]) * (lr * advantage);
            self.params.hidden_to_op += &h.dot(&op_err.view().insert_axis(Axis(0)));

            let visible = idx + 2;
            let in_err = (&targets.input_targets[idx] - &dist.input_probs[idx]) * (lr * advantage);
            let mut padded = Array1::zeros(self.params.hidden_to_input.ncols());
            padded.slice_mut(ndarray::s![..visible]).assign(&in_err);
            self.params.hidden_to_input += &h.dot(&padded.view().insert_axis(Axis(0)));
        }

        debug!(
            policy = %self.name,
            reward,
            baseline = self.params.baseline,
            advantage,
            "controller step"
        );
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer(file, &self.params)?;
        Ok(())
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path).map_err(|e| {
            EnasError::ResumeError(format!(
                "controller checkpoint {}: {e}",
                path.display()
            ))
        })?;
        let params: PolicyParams = serde_json::from_reader(file).map_err(|e| {
            EnasError::ResumeError(format!(
                "controller checkpoint {} is corrupt: {e}",
                path.display()
            ))
        })?;
        if params.hidden_to_op.ncols() != self.num_opers
            || params.hidden_to_input.ncols() != self.num_nodes + 1
        {
            return Err(EnasError::ResumeError(format!(
                "controller checkpoint {} does not match the search space",
                path.display()
            )));
        }
        self.params = params;
        Ok(())
    }
}

/// Numerically stable softmax
fn softmax(logits: &Array1<f64>) -> Array1<f64> {
    let max_val = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exp: Array1<f64> = logits.mapv(|x| (x - max_val).exp());
    let sum: f64 = exp.sum();
    exp / sum
}

/// Sample an index from a categorical distribution
fn sample_categorical(probs: &Array1<f64>, rng: &mut impl Rng) -> usize {
    let r: f64 = rng.gen();
    let mut cumsum = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return i;
        }
    }
    probs.len() - 1
}

fn argmax(probs: &Array1<f64>) -> usize {
    let mut best = 0;
    for (i, &p) in probs.iter().enumerate() {
        if p > probs[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn policy(seed: u64) -> RnnPolicy {
        let config = ControllerConfig {
            seed: Some(seed),
            ..ControllerConfig::default()
        };
        RnnPolicy::new("normal_controller", 4, 5, config)
    }

    #[test]
    fn test_forward_shapes() {
        let p = policy(42);
        let dist = p.forward();

        assert_eq!(dist.num_nodes(), 4);
        for (idx, probs) in dist.input_probs.iter().enumerate() {
            assert_eq!(probs.len(), idx + 2);
            assert!((probs.sum() - 1.0).abs() < 1e-9);
        }
        for probs in &dist.op_probs {
            assert_eq!(probs.len(), 5);
            assert!((probs.sum() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_forward_is_pure() {
        let p = policy(42);
        let a = p.forward();
        let b = p.forward();
        assert_eq!(a.op_probs[0], b.op_probs[0]);
        assert_eq!(a.input_probs[3], b.input_probs[3]);
    }

    #[test]
    fn test_sample_respects_node_count() {
        let mut p = policy(42);
        let dist = p.forward();
        let cell = p.sample(&dist);

        assert_eq!(cell.len(), 4);
        for (idx, node) in cell.nodes.iter().enumerate() {
            assert!(node.oper < 5);
            assert!(node.inputs[0] < idx + 2);
            assert!(node.inputs[1] < idx + 2);
        }
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let mut a = policy(7);
        let mut b = policy(7);
        let cell_a = a.sample(&a.forward());
        let cell_b = b.sample(&b.forward());
        assert_eq!(cell_a, cell_b);
    }

    #[test]
    fn test_train_step_moves_baseline() {
        let mut p = policy(42);
        let dist = p.forward();
        let cell = p.sample(&dist);
        let targets = ArchTargets::from_cell(&cell, 5);

        p.train_step(&targets, 0.8).unwrap();
        assert!(p.baseline() > 0.0);
    }

    #[test]
    fn test_train_step_rejects_mismatched_targets() {
        let mut p = policy(42);
        let short = Cell::new(vec![NodeSpec { oper: 0, inputs: [0, 1] }]);
        let targets = ArchTargets::from_cell(&short, 5);

        assert!(p.train_step(&targets, 0.5).is_err());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("normal_controller.json");

        let mut p = policy(42);
        let dist = p.forward();
        let cell = p.sample(&dist);
        p.train_step(&ArchTargets::from_cell(&cell, 5), 0.9).unwrap();
        p.save(&path).unwrap();

        let mut fresh = policy(1);
        fresh.load(&path).unwrap();
        assert_eq!(fresh.baseline(), p.baseline());

        // Parameters determine the forward pass.
        let a = p.forward();
        let b = fresh.forward();
        assert_eq!(a.op_probs[0], b.op_probs[0]);
    }

    #[test]
    fn test_load_missing_checkpoint_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut p = policy(42);
        let err = p.load(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, EnasError::ResumeError(_)));
    }

    #[test]
    fn test_targets_from_cell() {
        let cell = Cell::new(vec![
            NodeSpec { oper: 2, inputs: [0, 1] },
            NodeSpec { oper: 0, inputs: [2, 2] },
        ]);
        let targets = ArchTargets::from_cell(&cell, 5);

        assert_eq!(targets.op_targets[0][2], 1.0);
        assert_eq!(targets.op_targets[0].sum(), 1.0);
        assert_eq!(targets.input_targets[1][2], 1.0);
        assert_eq!(targets.input_targets[1].len(), 3);
    }
}
