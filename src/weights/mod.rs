//! Shared weight bank
//!
//! Layer weights accumulated across search epochs. Child networks read
//! matching entries at build time and write their trained layers back after
//! every inner training run, which approximates weight sharing between
//! architecture samples.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;

/// Mapping from layer identity to trained weight matrix.
///
/// Keys encode cell type, node index and operation (e.g. `normal/n2/dense`)
/// plus the fixed `stem/dense` and `head/softmax` layers. Within a run keys
/// are never removed; values are overwritten each time a network containing
/// that layer is retrained.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeightBank {
    layers: BTreeMap<String, Array2<f64>>,
}

impl WeightBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a layer by key
    pub fn get(&self, key: &str) -> Option<&Array2<f64>> {
        self.layers.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.layers.contains_key(key)
    }

    /// Insert or overwrite a layer
    pub fn insert(&mut self, key: String, weights: Array2<f64>) {
        self.layers.insert(key, weights);
    }

    /// Merge a trained layer mapping into the bank, overwriting on key
    /// collision.
    pub fn absorb(&mut self, trained: BTreeMap<String, Array2<f64>>) {
        for (key, weights) in trained {
            self.layers.insert(key, weights);
        }
    }

    /// Number of stored layers
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Iterate over the stored layer keys
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.layers.keys()
    }

    /// Write every layer to `dir` as a JSON snapshot, one file per key.
    ///
    /// Slashes in layer keys become dots in file names.
    pub fn snapshot_to_disk(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        for (key, weights) in &self.layers {
            let file = File::create(Self::snapshot_path(dir, key))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, weights)?;
            writer.flush()?;
        }
        debug!(layers = self.layers.len(), dir = %dir.display(), "weight snapshot written");
        Ok(())
    }

    /// Load a single layer snapshot previously written by
    /// [`snapshot_to_disk`](Self::snapshot_to_disk).
    pub fn load_snapshot(dir: &Path, key: &str) -> Result<Array2<f64>> {
        let file = File::open(Self::snapshot_path(dir, key))?;
        Ok(serde_json::from_reader(file)?)
    }

    fn snapshot_path(dir: &Path, key: &str) -> PathBuf {
        dir.join(format!("{}.json", key.replace('/', ".")))
    }
}

/// Remove a weight directory and everything under it. Destructive; only
/// called when directory initialization is configured.
pub fn initialize_weight_directory(dir: &Path) -> Result<()> {
    if dir.exists() {
        info!(dir = %dir.display(), "initializing child weight directory");
        fs::remove_dir_all(dir)?;
    }
    Ok(())
}
