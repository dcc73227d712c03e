//! Child network training
//!
//! Builds an executable dense network from an architecture graph, trains it
//! with minibatch SGD and backpropagation through the cell DAG, and moves
//! layer weights in and out of the shared weight bank.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, Axis};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{EnasError, Result};
use crate::graph::{ArchitectureGraph, GraphNode, HEAD_KEY, STEM_KEY};
use crate::cell::OperationType;
use crate::weights::WeightBank;

/// A labeled dataset: features by row, class index per row
#[derive(Debug, Clone)]
pub struct DataSet {
    pub x: Array2<f64>,
    pub y: Array1<f64>,
}

impl DataSet {
    pub fn new(x: Array2<f64>, y: Array1<f64>) -> Self {
        Self { x, y }
    }

    pub fn len(&self) -> usize {
        self.x.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One training run's schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainSchedule {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Early-stopping patience on validation loss; `None` disables it
    pub patience: Option<usize>,
}

/// Per-epoch child trainer driven by the orchestrator
pub trait ChildTrainer {
    /// Initialize layers from the bank wherever a key and shape match.
    fn load_shared_weights(&mut self, bank: &WeightBank);

    /// Train against the full training set, validating per inner epoch.
    fn train(&mut self, train: &DataSet, validation: &DataSet, schedule: &TrainSchedule)
        -> Result<()>;

    /// Trained layer weights keyed by layer identity.
    fn extract_weights(&self) -> BTreeMap<String, Array2<f64>>;

    /// `(loss, accuracy)` on a batch.
    fn evaluate(&self, batch: &DataSet) -> Result<(f64, f64)>;

    /// Free the network's resources. Further use is an error.
    fn release(&mut self);
}

/// Creates a fresh trainer for one epoch's sampled graph
pub trait TrainerFactory {
    type Trainer: ChildTrainer;

    fn create(&self, graph: &ArchitectureGraph) -> Result<Self::Trainer>;
}

/// Child network hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildConfig {
    /// Feature dimension of the dataset
    pub input_dim: usize,
    /// Number of output classes
    pub classes: usize,
    /// Hidden width of every cell state
    pub init_filters: usize,
    /// Seed for layer initialization and batch shuffling
    pub seed: Option<u64>,
}

impl Default for ChildConfig {
    fn default() -> Self {
        Self {
            input_dim: 0,
            classes: 0,
            init_filters: 64,
            seed: None,
        }
    }
}

/// Default [`TrainerFactory`] building [`ChildNetwork`] instances
#[derive(Debug, Clone)]
pub struct ChildNetworkFactory {
    pub config: ChildConfig,
}

impl ChildNetworkFactory {
    pub fn new(config: ChildConfig) -> Self {
        Self { config }
    }
}

impl TrainerFactory for ChildNetworkFactory {
    type Trainer = ChildNetwork;

    fn create(&self, graph: &ArchitectureGraph) -> Result<ChildNetwork> {
        ChildNetwork::build(graph.clone(), self.config.clone())
    }
}

/// Forward-pass cache for one node
struct NodeCache {
    a: Array2<f64>,
    z: Option<Array2<f64>>,
    out: Array2<f64>,
}

/// Forward-pass cache for one template position
struct CellCache {
    nodes: Vec<NodeCache>,
    loose: Vec<usize>,
}

struct ForwardCache {
    z0: Array2<f64>,
    cells: Vec<CellCache>,
    hn: Array2<f64>,
    probs: Array2<f64>,
}

/// An executable child network: stem projection, stacked cells per
/// template marker, softmax head. All cell states share one hidden width
/// so layer weights stay shape-compatible across architecture samples.
pub struct ChildNetwork {
    graph: ArchitectureGraph,
    config: ChildConfig,
    layers: BTreeMap<String, Array2<f64>>,
    rng: Xoshiro256PlusPlus,
    released: bool,
}

impl ChildNetwork {
    pub fn build(graph: ArchitectureGraph, config: ChildConfig) -> Result<Self> {
        if config.input_dim == 0 || config.classes == 0 {
            return Err(EnasError::ValidationError(
                "child network needs a nonzero input dimension and class count".to_string(),
            ));
        }
        let mut rng = match config.seed {
            Some(s) => Xoshiro256PlusPlus::seed_from_u64(s),
            None => Xoshiro256PlusPlus::from_entropy(),
        };

        let filters = config.init_filters;
        let mut layers = BTreeMap::new();
        layers.insert(
            STEM_KEY.to_string(),
            glorot(&mut rng, config.input_dim, filters),
        );
        layers.insert(HEAD_KEY.to_string(), glorot(&mut rng, filters, config.classes));
        for nodes in [&graph.normal_nodes, &graph.reduction_nodes] {
            for node in nodes {
                if let Some(key) = &node.weight_key {
                    layers
                        .entry(key.clone())
                        .or_insert_with(|| glorot(&mut rng, filters, filters));
                }
            }
        }

        Ok(Self {
            graph,
            config,
            layers,
            rng,
            released: false,
        })
    }

    fn ensure_live(&self) -> Result<()> {
        if self.released {
            return Err(EnasError::TrainingError(
                "child network resources already released".to_string(),
            ));
        }
        Ok(())
    }

    fn weight(&self, key: &str) -> &Array2<f64> {
        // Keys come from the graph this network was built from.
        &self.layers[key]
    }

    /// Run one cell over its two input states.
    fn run_cell(&self, nodes: &[GraphNode], s0: &Array2<f64>, s1: &Array2<f64>) -> CellCache {
        let mut states: Vec<Array2<f64>> = vec![s0.clone(), s1.clone()];
        let mut used = vec![false; nodes.len() + 2];
        let mut caches = Vec::with_capacity(nodes.len());

        for node in nodes {
            let a = (&states[node.inputs[0]] + &states[node.inputs[1]]) * 0.5;
            used[node.inputs[0]] = true;
            used[node.inputs[1]] = true;

            let (out, z) = match node.op {
                OperationType::Identity => (a.clone(), None),
                OperationType::Dense => {
                    let z = a.dot(self.weight(node.weight_key.as_deref().unwrap_or_default()));
                    (z.clone(), Some(z))
                }
                OperationType::ReluDense => {
                    let z = a.dot(self.weight(node.weight_key.as_deref().unwrap_or_default()));
                    (z.mapv(|v| v.max(0.0)), Some(z))
                }
                OperationType::TanhDense => {
                    let z = a.dot(self.weight(node.weight_key.as_deref().unwrap_or_default()));
                    (z.mapv(f64::tanh), Some(z))
                }
                OperationType::GatedDense => {
                    let z = a.dot(self.weight(node.weight_key.as_deref().unwrap_or_default()));
                    (z.mapv(sigmoid) * &a, Some(z))
                }
            };
            states.push(out.clone());
            caches.push(NodeCache { a, z, out });
        }

        // Loose ends: node outputs no other node consumed. If every node
        // output is consumed, average them all.
        let mut loose: Vec<usize> = (0..nodes.len()).filter(|j| !used[j + 2]).collect();
        if loose.is_empty() {
            loose = (0..nodes.len()).collect();
        }

        CellCache { nodes: caches, loose }
    }

    fn cell_output(cache: &CellCache) -> Array2<f64> {
        let mut out = cache.nodes[cache.loose[0]].out.clone();
        for &j in &cache.loose[1..] {
            out += &cache.nodes[j].out;
        }
        out / cache.loose.len() as f64
    }

    fn forward(&self, x: &Array2<f64>) -> ForwardCache {
        let z0 = x.dot(self.weight(STEM_KEY));
        let h0 = z0.mapv(|v| v.max(0.0));

        let mut prev_prev = h0.clone();
        let mut prev = h0.clone();
        let mut cells = Vec::with_capacity(self.graph.template.len());
        for &marker in &self.graph.template {
            let cache = self.run_cell(self.graph.nodes_for(marker), &prev_prev, &prev);
            let out = Self::cell_output(&cache);
            cells.push(cache);
            prev_prev = prev;
            prev = out;
        }

        let logits = prev.dot(self.weight(HEAD_KEY));
        let probs = softmax_rows(&logits);
        ForwardCache {
            z0,
            cells,
            hn: prev,
            probs,
        }
    }

    /// Backward pass through one cell. Accumulates weight gradients and
    /// returns the gradients of the two cell inputs.
    fn backward_cell(
        &self,
        nodes: &[GraphNode],
        cache: &CellCache,
        d_out: &Array2<f64>,
        grads: &mut BTreeMap<String, Array2<f64>>,
    ) -> (Array2<f64>, Array2<f64>) {
        let shape = d_out.raw_dim();
        let mut dstate: Vec<Array2<f64>> =
            (0..nodes.len() + 2).map(|_| Array2::zeros(shape)).collect();

        let share = d_out / cache.loose.len() as f64;
        for &j in &cache.loose {
            dstate[j + 2] += &share;
        }

        for j in (0..nodes.len()).rev() {
            let g = dstate[j + 2].clone();
            let node = &nodes[j];
            let nc = &cache.nodes[j];

            let d_a = match node.op {
                OperationType::Identity => g,
                OperationType::Dense | OperationType::ReluDense | OperationType::TanhDense => {
                    let z = nc.z.as_ref().unwrap_or(&nc.out);
                    let dz = match node.op {
                        OperationType::Dense => g,
                        OperationType::ReluDense => {
                            g * &z.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 })
                        }
                        _ => g * &nc.out.mapv(|v| 1.0 - v * v),
                    };
                    let key = node.weight_key.as_deref().unwrap_or_default();
                    accumulate(grads, key, nc.a.t().dot(&dz));
                    dz.dot(&self.weight(key).t())
                }
                OperationType::GatedDense => {
                    let z = nc.z.as_ref().unwrap_or(&nc.out);
                    let s = z.mapv(sigmoid);
                    let dz = &g * &nc.a * &s.mapv(|v| v * (1.0 - v));
                    let key = node.weight_key.as_deref().unwrap_or_default();
                    accumulate(grads, key, nc.a.t().dot(&dz));
                    g * &s + dz.dot(&self.weight(key).t())
                }
            };

            let half = d_a * 0.5;
            dstate[node.inputs[0]] += &half;
            dstate[node.inputs[1]] += &half;
        }

        let ds1 = dstate.swap_remove(1);
        let ds0 = dstate.swap_remove(0);
        (ds0, ds1)
    }

    /// One SGD step over a minibatch. Returns the batch loss.
    fn train_batch(&mut self, x: &Array2<f64>, y: &Array1<f64>, lr: f64) -> Result<f64> {
        let n = x.nrows();
        let fwd = self.forward(x);
        let (loss, d_logits) = cross_entropy_grad(&fwd.probs, y, self.config.classes)?;

        let mut grads: BTreeMap<String, Array2<f64>> = BTreeMap::new();
        accumulate(&mut grads, HEAD_KEY, fwd.hn.t().dot(&d_logits));
        let d_hn = d_logits.dot(&self.weight(HEAD_KEY).t());

        // Walk the template in reverse, threading (prev_prev, prev)
        // gradients back to the stem.
        let mut d_prev = d_hn;
        let mut d_prev_prev: Array2<f64> = Array2::zeros(d_prev.raw_dim());
        for (k, &marker) in self.graph.template.iter().enumerate().rev() {
            let nodes = self.graph.nodes_for(marker);
            let (d_in0, d_in1) = self.backward_cell(nodes, &fwd.cells[k], &d_prev, &mut grads);
            d_prev = d_in1 + &d_prev_prev;
            d_prev_prev = d_in0;
        }

        let d_h0 = d_prev + &d_prev_prev;
        let d_z0 = d_h0 * &fwd.z0.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
        accumulate(&mut grads, STEM_KEY, x.t().dot(&d_z0));

        for (key, grad) in grads {
            if let Some(w) = self.layers.get_mut(&key) {
                *w -= &(grad * lr);
            }
        }

        trace!(batch = n, loss, "child minibatch");
        Ok(loss)
    }
}

impl ChildTrainer for ChildNetwork {
    fn load_shared_weights(&mut self, bank: &WeightBank) {
        let mut shared = 0;
        for (key, weights) in self.layers.iter_mut() {
            if let Some(stored) = bank.get(key) {
                if stored.raw_dim() == weights.raw_dim() {
                    weights.assign(stored);
                    shared += 1;
                }
            }
        }
        debug!(shared, total = self.layers.len(), "shared weights loaded");
    }

    fn train(&mut self, train: &DataSet, validation: &DataSet, schedule: &TrainSchedule)
        -> Result<()> {
        self.ensure_live()?;
        if train.is_empty() {
            return Err(EnasError::TrainingError("training set is empty".to_string()));
        }

        let mut best_val = f64::INFINITY;
        let mut stale = 0usize;
        let mut order: Vec<usize> = (0..train.len()).collect();

        for epoch in 0..schedule.epochs {
            order.shuffle(&mut self.rng);
            let mut epoch_loss = 0.0;
            let mut batches = 0usize;
            for chunk in order.chunks(schedule.batch_size.max(1)) {
                let bx = train.x.select(Axis(0), chunk);
                let by = train.y.select(Axis(0), chunk);
                epoch_loss += self.train_batch(&bx, &by, schedule.learning_rate)?;
                batches += 1;
            }

            let (val_loss, val_acc) = self.evaluate(validation)?;
            debug!(
                epoch,
                train_loss = epoch_loss / batches.max(1) as f64,
                val_loss,
                val_acc,
                "child epoch"
            );

            if let Some(patience) = schedule.patience {
                if val_loss < best_val {
                    best_val = val_loss;
                    stale = 0;
                } else {
                    stale += 1;
                    if stale > patience {
                        debug!(epoch, "early stopping");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn extract_weights(&self) -> BTreeMap<String, Array2<f64>> {
        self.layers.clone()
    }

    fn evaluate(&self, batch: &DataSet) -> Result<(f64, f64)> {
        self.ensure_live()?;
        if batch.is_empty() {
            return Err(EnasError::TrainingError("evaluation batch is empty".to_string()));
        }
        let fwd = self.forward(&batch.x);
        let (loss, _) = cross_entropy_grad(&fwd.probs, &batch.y, self.config.classes)?;

        let mut correct = 0usize;
        for (row, &label) in fwd.probs.outer_iter().zip(batch.y.iter()) {
            let mut best = 0;
            for (i, &p) in row.iter().enumerate() {
                if p > row[best] {
                    best = i;
                }
            }
            if best == label as usize {
                correct += 1;
            }
        }
        Ok((loss, correct as f64 / batch.len() as f64))
    }

    fn release(&mut self) {
        self.layers.clear();
        self.released = true;
    }
}

fn glorot(rng: &mut impl Rng, rows: usize, cols: usize) -> Array2<f64> {
    let scale = (6.0 / (rows + cols) as f64).sqrt();
    Array2::from_shape_fn((rows, cols), |_| (rng.gen::<f64>() * 2.0 - 1.0) * scale)
}

fn sigmoid(v: f64) -> f64 {
    1.0 / (1.0 + (-v).exp())
}

fn softmax_rows(logits: &Array2<f64>) -> Array2<f64> {
    let mut out = logits.clone();
    for mut row in out.outer_iter_mut() {
        let max_val = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|v| (v - max_val).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}

/// Mean cross-entropy loss and the softmax gradient `(probs - onehot) / n`.
fn cross_entropy_grad(
    probs: &Array2<f64>,
    y: &Array1<f64>,
    classes: usize,
) -> Result<(f64, Array2<f64>)> {
    let n = probs.nrows();
    let mut d_logits = probs.clone();
    let mut loss = 0.0;
    for (i, &label) in y.iter().enumerate() {
        let target = label as usize;
        if target >= classes {
            return Err(EnasError::TrainingError(format!(
                "label {target} out of range for {classes} classes"
            )));
        }
        loss -= probs[[i, target]].max(1e-12).ln();
        d_logits[[i, target]] -= 1.0;
    }
    Ok((loss / n as f64, d_logits / n as f64))
}

fn accumulate(grads: &mut BTreeMap<String, Array2<f64>>, key: &str, grad: Array2<f64>) {
    match grads.get_mut(key) {
        Some(existing) => *existing += &grad,
        None => {
            grads.insert(key.to_string(), grad);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CellType, SearchSpace};
    use crate::graph::{CellGraphBuilder, GraphBuilder};
    use ndarray::array;
    use rand::SeedableRng;

    fn small_graph(seed: u64) -> ArchitectureGraph {
        let space = SearchSpace::new(crate::cell::SearchSpaceConfig {
            num_nodes: 3,
            operations: crate::cell::OperationType::standard_ops(),
        });
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let normal = space.sample_random(&mut rng);
        let reduction = space.sample_random(&mut rng);
        CellGraphBuilder::new(space, vec![CellType::Normal, CellType::Reduction])
            .build(&normal, &reduction)
            .unwrap()
    }

    fn config() -> ChildConfig {
        ChildConfig {
            input_dim: 2,
            classes: 2,
            init_filters: 8,
            seed: Some(42),
        }
    }

    /// Two linearly separable blobs
    fn blobs() -> DataSet {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..20 {
            let t = i as f64 / 20.0;
            x.push([t, t + 2.0]);
            y.push(0.0);
            x.push([t + 2.0, t]);
            y.push(1.0);
        }
        let flat: Vec<f64> = x.iter().flatten().copied().collect();
        DataSet::new(
            Array2::from_shape_vec((y.len(), 2), flat).unwrap(),
            Array1::from_vec(y),
        )
    }

    #[test]
    fn test_build_creates_stem_and_head() {
        let net = ChildNetwork::build(small_graph(42), config()).unwrap();
        let weights = net.extract_weights();
        assert!(weights.contains_key(STEM_KEY));
        assert!(weights.contains_key(HEAD_KEY));
    }

    #[test]
    fn test_build_rejects_empty_dims() {
        let bad = ChildConfig {
            input_dim: 0,
            ..config()
        };
        assert!(ChildNetwork::build(small_graph(42), bad).is_err());
    }

    #[test]
    fn test_training_reduces_loss() {
        let data = blobs();
        let mut net = ChildNetwork::build(small_graph(42), config()).unwrap();
        let (before, _) = net.evaluate(&data).unwrap();

        let schedule = TrainSchedule {
            epochs: 30,
            batch_size: 8,
            learning_rate: 0.1,
            patience: None,
        };
        net.train(&data, &data, &schedule).unwrap();

        let (after, acc) = net.evaluate(&data).unwrap();
        assert!(after < before, "loss should drop: {before} -> {after}");
        assert!(acc > 0.5);
    }

    #[test]
    fn test_shared_weights_are_loaded() {
        let graph = small_graph(42);
        let mut bank = WeightBank::new();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(9);
        bank.insert(STEM_KEY.to_string(), glorot(&mut rng, 2, 8));

        let mut net = ChildNetwork::build(graph, config()).unwrap();
        net.load_shared_weights(&bank);

        assert_eq!(net.extract_weights()[STEM_KEY], *bank.get(STEM_KEY).unwrap());
    }

    #[test]
    fn test_shape_mismatch_keeps_fresh_init() {
        let graph = small_graph(42);
        let mut bank = WeightBank::new();
        bank.insert(STEM_KEY.to_string(), array![[1.0]]);

        let mut net = ChildNetwork::build(graph, config()).unwrap();
        let fresh = net.extract_weights()[STEM_KEY].clone();
        net.load_shared_weights(&bank);

        assert_eq!(net.extract_weights()[STEM_KEY], fresh);
    }

    #[test]
    fn test_release_blocks_further_use() {
        let data = blobs();
        let mut net = ChildNetwork::build(small_graph(42), config()).unwrap();
        net.release();

        assert!(net.evaluate(&data).is_err());
        let schedule = TrainSchedule {
            epochs: 1,
            batch_size: 8,
            learning_rate: 0.1,
            patience: None,
        };
        assert!(net.train(&data, &data, &schedule).is_err());
    }

    #[test]
    fn test_label_out_of_range() {
        let mut data = blobs();
        data.y[0] = 7.0;
        let net = ChildNetwork::build(small_graph(42), config()).unwrap();
        assert!(net.evaluate(&data).is_err());
    }

    #[test]
    fn test_early_stopping_terminates() {
        let data = blobs();
        let mut net = ChildNetwork::build(small_graph(42), config()).unwrap();
        let schedule = TrainSchedule {
            epochs: 500,
            batch_size: 8,
            learning_rate: 0.0, // No progress; patience must cut this short.
            patience: Some(2),
        };
        net.train(&data, &data, &schedule).unwrap();
    }
}
