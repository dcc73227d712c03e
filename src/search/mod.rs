//! Search orchestration
//!
//! The epoch loop that ties the controller policies, graph generation,
//! child training and persistence together: sample, build, train, evaluate,
//! reward, record, update controllers, checkpoint.

use std::fs::File;
use std::path::PathBuf;

use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cell::{Cell, CellPair, CellType, SearchSpace, SearchSpaceConfig};
use crate::child::{
    ChildConfig, ChildNetworkFactory, ChildTrainer, DataSet, TrainSchedule, TrainerFactory,
};
use crate::controller::{ArchTargets, ControllerConfig, Policy, RnnPolicy};
use crate::error::{EnasError, Result};
use crate::graph::{CellGraphBuilder, GraphBuilder};
use crate::record::{RecordLog, RecordRow};
use crate::utils::{sample_batch_indices, sgdr_learning_rate, take_batch};
use crate::weights::{initialize_weight_directory, WeightBank};

/// Inner training epochs per architecture sample, independent of the
/// outer schedule
const CHILD_SEARCH_EPOCHS: usize = 5;

/// Full configuration surface of one search run.
///
/// The training internals are fixed rather than configurable: children
/// train with plain SGD against cross-entropy loss and report accuracy,
/// and each controller takes one policy-gradient step per search epoch.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Child network name; prefixes every persisted file
    pub name: String,
    pub working_directory: PathBuf,
    pub space: SearchSpaceConfig,
    pub controller: ControllerConfig,
    pub child: ChildConfig,
    /// Macro template: ordered cell markers
    pub template: Vec<CellType>,
    /// Child minibatch size
    pub child_batch_size: usize,
    /// Validation batch drawn per epoch
    pub val_batch_size: usize,
    /// Total planned search epochs
    pub epochs: usize,
    /// Child learning rate per search epoch; length must equal `epochs`
    pub lr_schedule: Vec<f64>,
    pub start_from_record: bool,
    pub initialize_weight_directory: bool,
    pub save_to_disk: bool,
    pub weight_directory: String,
    pub controller_normal_file: String,
    pub controller_reduction_file: String,
    /// Seed for validation-batch sampling
    pub seed: Option<u64>,
}

impl SearchConfig {
    pub fn new(name: impl Into<String>) -> Self {
        let lr_schedule = sgdr_learning_rate(0.05, 0.001, 5, 10);
        Self {
            name: name.into(),
            working_directory: PathBuf::from("."),
            space: SearchSpaceConfig::default(),
            controller: ControllerConfig::default(),
            child: ChildConfig::default(),
            template: vec![CellType::Normal, CellType::Normal, CellType::Reduction],
            child_batch_size: 128,
            val_batch_size: 128,
            epochs: lr_schedule.len(),
            lr_schedule,
            start_from_record: true,
            initialize_weight_directory: true,
            save_to_disk: false,
            weight_directory: "child_weights".to_string(),
            controller_normal_file: "normal_controller.json".to_string(),
            controller_reduction_file: "reduction_controller.json".to_string(),
            seed: None,
        }
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    /// Set the schedule; the epoch count follows its length.
    pub fn with_lr_schedule(mut self, schedule: Vec<f64>) -> Self {
        self.epochs = schedule.len();
        self.lr_schedule = schedule;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_template(mut self, template: Vec<CellType>) -> Self {
        self.template = template;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.start_from_record = resume;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.lr_schedule.len() != self.epochs {
            return Err(EnasError::ScheduleError(format!(
                "schedule covers {} epochs but {} are planned",
                self.lr_schedule.len(),
                self.epochs
            )));
        }
        if self.template.is_empty() {
            return Err(EnasError::ValidationError(
                "macro template is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Best architecture seen so far
#[derive(Debug, Clone, Default)]
pub struct BestState {
    pub epoch: usize,
    pub val_acc: f64,
    pub normal_cell: Option<Cell>,
    pub reduction_cell: Option<Cell>,
}

/// In-memory outcome of one completed search epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochOutcome {
    pub epoch: usize,
    pub cells: CellPair,
    pub reward: f64,
    pub val_loss: f64,
}

/// Final report of a search run
#[derive(Debug, Clone)]
pub struct SearchReport {
    pub best_epoch: usize,
    pub best_val_acc: f64,
    pub normal_cell: Option<Cell>,
    pub reduction_cell: Option<Cell>,
    pub history: Vec<EpochOutcome>,
    /// `(loss, accuracy)` of the terminal epoch's child, when the run
    /// performed at least one epoch
    pub final_eval: Option<(f64, f64)>,
}

/// The orchestrator with default collaborators
pub type EnasSearch = SearchOrchestrator<RnnPolicy, ChildNetworkFactory>;

/// Drives the search epoch loop and owns all cross-epoch state: the two
/// controller policies, the shared weight bank, best-state bookkeeping and
/// the resumable on-disk record.
pub struct SearchOrchestrator<P: Policy, F: TrainerFactory> {
    config: SearchConfig,
    space: SearchSpace,
    builder: CellGraphBuilder,
    normal_policy: P,
    reduction_policy: P,
    factory: F,
    bank: WeightBank,
    best: BestState,
    record: RecordLog,
    history: Vec<EpochOutcome>,
    train_data: DataSet,
    test_data: DataSet,
    rng: Xoshiro256PlusPlus,
}

impl EnasSearch {
    /// Orchestrator with the default recurrent policies and child-network
    /// factory. The child input dimension is taken from the data.
    pub fn new(mut config: SearchConfig, train_data: DataSet, test_data: DataSet) -> Result<Self> {
        config.child.input_dim = train_data.x.ncols();
        let space = SearchSpace::new(config.space.clone());
        let normal = RnnPolicy::new(
            "normal_controller",
            space.num_nodes(),
            space.num_opers(),
            config.controller.clone(),
        );
        let reduction = RnnPolicy::new(
            "reduction_controller",
            space.num_nodes(),
            space.num_opers(),
            config.controller.clone(),
        );
        let factory = ChildNetworkFactory::new(config.child.clone());
        Self::with_components(config, train_data, test_data, normal, reduction, factory)
    }
}

impl<P: Policy, F: TrainerFactory> SearchOrchestrator<P, F> {
    /// Orchestrator over caller-supplied policies and trainer factory.
    pub fn with_components(
        config: SearchConfig,
        train_data: DataSet,
        test_data: DataSet,
        normal_policy: P,
        reduction_policy: P,
        factory: F,
    ) -> Result<Self> {
        config.validate()?;
        let space = SearchSpace::new(config.space.clone());
        let builder = CellGraphBuilder::new(space.clone(), config.template.clone());
        let record = RecordLog::new(&config.working_directory, &config.name);
        let rng = match config.seed {
            Some(s) => Xoshiro256PlusPlus::seed_from_u64(s),
            None => Xoshiro256PlusPlus::from_entropy(),
        };

        if config.initialize_weight_directory {
            initialize_weight_directory(&config.working_directory.join(&config.weight_directory))?;
        }

        Ok(Self {
            config,
            space,
            builder,
            normal_policy,
            reduction_policy,
            factory,
            bank: WeightBank::new(),
            best: BestState::default(),
            record,
            history: Vec::new(),
            train_data,
            test_data,
            rng,
        })
    }

    pub fn best_state(&self) -> &BestState {
        &self.best
    }

    pub fn weight_bank(&self) -> &WeightBank {
        &self.bank
    }

    fn normal_cell_path(&self) -> PathBuf {
        self.config
            .working_directory
            .join(format!("{}_normal_cell.json", self.config.name))
    }

    fn reduction_cell_path(&self) -> PathBuf {
        self.config
            .working_directory
            .join(format!("{}_reduction_cell.json", self.config.name))
    }

    fn controller_paths(&self) -> (PathBuf, PathBuf) {
        (
            self.config
                .working_directory
                .join(&self.config.controller_normal_file),
            self.config
                .working_directory
                .join(&self.config.controller_reduction_file),
        )
    }

    /// Persist the best cells. Written every epoch, improvement or not, so
    /// the on-disk pair always matches the in-memory best state.
    fn save_best_cells(&self) -> Result<()> {
        let file = File::create(self.normal_cell_path())?;
        serde_json::to_writer(file, &self.best.normal_cell)?;
        let file = File::create(self.reduction_cell_path())?;
        serde_json::to_writer(file, &self.best.reduction_cell)?;
        Ok(())
    }

    fn load_best_cells(&mut self) -> Result<()> {
        let load = |path: &PathBuf| -> Result<Option<Cell>> {
            let file = File::open(path).map_err(|e| {
                EnasError::ResumeError(format!("best-cell file {}: {e}", path.display()))
            })?;
            serde_json::from_reader(file).map_err(|e| {
                EnasError::ResumeError(format!("best-cell file {} is corrupt: {e}", path.display()))
            })
        };
        self.best.normal_cell = load(&self.normal_cell_path())?;
        self.best.reduction_cell = load(&self.reduction_cell_path())?;
        Ok(())
    }

    /// Resume check: returns the starting epoch. A record without its
    /// best-cell files is fatal, never a fresh start. Controller
    /// checkpoints may lag the record (the terminal epoch skips the
    /// controller save) and are loaded only when present.
    fn resume(&mut self) -> Result<usize> {
        if !self.config.start_from_record {
            return Ok(0);
        }
        let rows = match self.record.rows()? {
            Some(rows) => rows,
            None => return Ok(0),
        };
        let last = match rows.last() {
            Some(last) => last.clone(),
            None => return Ok(0),
        };
        self.best.val_acc = last.best_val_acc;
        // First occurrence of the peak reward: a tie never displaced the
        // best state in the original run.
        let mut peak: Option<&RecordRow> = None;
        for row in &rows {
            if peak.map_or(true, |p| row.reward > p.reward) {
                peak = Some(row);
            }
        }
        if let Some(peak) = peak {
            self.best.epoch = peak.epoch;
        }
        self.load_best_cells()?;

        let (normal_path, reduction_path) = self.controller_paths();
        if normal_path.exists() {
            self.normal_policy.load(&normal_path)?;
        } else {
            warn!(
                path = %normal_path.display(),
                "controller checkpoint missing; keeping fresh parameters"
            );
        }
        if reduction_path.exists() {
            self.reduction_policy.load(&reduction_path)?;
        } else {
            warn!(
                path = %reduction_path.display(),
                "controller checkpoint missing; keeping fresh parameters"
            );
        }

        info!(
            resumed_epochs = rows.len(),
            best_val_acc = self.best.val_acc,
            "resumed from record"
        );
        Ok(last.epoch + 1)
    }

    /// Run the search loop to the final scheduled epoch.
    pub fn run(&mut self) -> Result<SearchReport> {
        self.config.validate()?;
        let start = self.resume()?;
        if start >= self.config.epochs {
            warn!(
                start,
                epochs = self.config.epochs,
                "no scheduled epochs remain"
            );
            return Ok(self.report(None));
        }

        for epoch in start..self.config.epochs {
            info!(epoch, total = self.config.epochs, "search epoch");

            // 1-2: pure forward, then stochastic sample.
            let normal_dist = self.normal_policy.forward();
            let reduction_dist = self.reduction_policy.forward();
            let normal_cell = self.normal_policy.sample(&normal_dist);
            let reduction_cell = self.reduction_policy.sample(&reduction_dist);

            // 3: validation batch without replacement.
            let indices = sample_batch_indices(
                &mut self.rng,
                self.test_data.len(),
                self.config.val_batch_size,
            );
            let (vx, vy) = take_batch(&self.test_data.x, &self.test_data.y, &indices);
            let validation = DataSet::new(vx, vy);

            // 4: schedule-indexed learning rate.
            let lr = *self.config.lr_schedule.get(epoch).ok_or_else(|| {
                EnasError::ScheduleError(format!("no learning rate for epoch {epoch}"))
            })?;

            // 5-6: build graph, fresh trainer, shared-weight init.
            let graph = self.builder.build(&normal_cell, &reduction_cell)?;
            let mut trainer = self.factory.create(&graph)?;
            trainer.load_shared_weights(&self.bank);

            // 7: fixed short inner training run.
            let schedule = TrainSchedule {
                epochs: CHILD_SEARCH_EPOCHS,
                batch_size: self.config.child_batch_size,
                learning_rate: lr,
                patience: None,
            };
            trainer.train(&self.train_data, &validation, &schedule)?;

            // 8: trained weights flow back into the bank.
            self.bank.absorb(trainer.extract_weights());
            if self.config.save_to_disk {
                let dir = self
                    .config
                    .working_directory
                    .join(&self.config.weight_directory);
                self.bank.snapshot_to_disk(&dir)?;
            }

            // 9: reward.
            let (val_loss, val_acc) = trainer.evaluate(&validation)?;
            let reward = val_acc;
            info!(epoch, reward, val_loss, "child evaluated");

            // 10: strict-improvement best-state update.
            if reward > self.best.val_acc {
                self.best.epoch = epoch;
                self.best.val_acc = reward;
                self.best.normal_cell = Some(normal_cell.clone());
                self.best.reduction_cell = Some(reduction_cell.clone());
                info!(epoch, best_val_acc = reward, "new best architecture");
            }

            // 11-12: durable record append, then best-cell persistence.
            self.record.append(&RecordRow {
                epoch,
                lr,
                reward,
                val_loss,
                best_val_acc: self.best.val_acc,
            })?;
            self.save_best_cells()?;

            self.history.push(EpochOutcome {
                epoch,
                cells: CellPair {
                    normal: normal_cell.clone(),
                    reduction: reduction_cell.clone(),
                },
                reward,
                val_loss,
            });

            // 13: terminal epoch reports without controller update or
            // teardown; the final child stays alive until the report is
            // assembled.
            if epoch + 1 == self.config.epochs {
                info!(epoch, best_val_acc = self.best.val_acc, "search finished");
                return Ok(self.report(Some((val_loss, val_acc))));
            }

            // 14: release the epoch's heavy resources before anything else
            // is allocated.
            trainer.release();
            drop(trainer);

            // 15-16: controller step from the sampled cells, then
            // checkpoint both policies.
            let normal_targets = ArchTargets::from_cell(&normal_cell, self.space.num_opers());
            let reduction_targets = ArchTargets::from_cell(&reduction_cell, self.space.num_opers());
            self.normal_policy.train_step(&normal_targets, reward)?;
            self.reduction_policy.train_step(&reduction_targets, reward)?;

            let (normal_path, reduction_path) = self.controller_paths();
            self.normal_policy.save(&normal_path)?;
            self.reduction_policy.save(&reduction_path)?;
        }

        // Unreachable: the terminal epoch returns inside the loop and the
        // zero-epoch case returns before it.
        Ok(self.report(None))
    }

    fn report(&self, final_eval: Option<(f64, f64)>) -> SearchReport {
        SearchReport {
            best_epoch: self.best.epoch,
            best_val_acc: self.best.val_acc,
            normal_cell: self.best.normal_cell.clone(),
            reduction_cell: self.best.reduction_cell.clone(),
            history: self.history.clone(),
            final_eval,
        }
    }

    /// Train a specific cell pair to convergence against the full test set.
    ///
    /// Defaults to the current best cells. Uses the same shared-weight
    /// initialization contract as the search loop but never writes the
    /// bank, the record or the controllers, and leaves the search-time
    /// best state untouched; the returned metrics are the caller's to
    /// interpret.
    pub fn train_best_cells(
        &mut self,
        cells: Option<CellPair>,
        schedule: Option<TrainSchedule>,
    ) -> Result<(f64, f64)> {
        let cells = match cells {
            Some(pair) => pair,
            None => CellPair {
                normal: self.best.normal_cell.clone().ok_or_else(|| {
                    EnasError::ValidationError("no best normal cell available".to_string())
                })?,
                reduction: self.best.reduction_cell.clone().ok_or_else(|| {
                    EnasError::ValidationError("no best reduction cell available".to_string())
                })?,
            },
        };
        let schedule = schedule.unwrap_or(TrainSchedule {
            epochs: 100,
            batch_size: self.config.child_batch_size,
            learning_rate: 0.001,
            patience: Some(20),
        });

        info!(
            best_val_acc = self.best.val_acc,
            "training best cells to convergence"
        );
        let graph = self.builder.build(&cells.normal, &cells.reduction)?;
        let mut trainer = self.factory.create(&graph)?;
        trainer.load_shared_weights(&self.bank);
        trainer.train(&self.train_data, &self.test_data, &schedule)?;
        let metrics = trainer.evaluate(&self.test_data)?;
        trainer.release();

        info!(loss = metrics.0, accuracy = metrics.1, "final training done");
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_follow_schedule() {
        let config = SearchConfig::new("cifar");
        assert_eq!(config.epochs, config.lr_schedule.len());
        assert_eq!(config.epochs, 310);
    }

    #[test]
    fn test_schedule_mismatch_rejected() {
        let config = SearchConfig::new("cifar").with_epochs(3);
        assert!(matches!(
            config.validate(),
            Err(EnasError::ScheduleError(_))
        ));
    }

    #[test]
    fn test_empty_template_rejected() {
        let config = SearchConfig::new("cifar").with_template(vec![]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_with_lr_schedule_syncs_epochs() {
        let config = SearchConfig::new("cifar").with_lr_schedule(vec![0.05, 0.04]);
        assert_eq!(config.epochs, 2);
        assert!(config.validate().is_ok());
    }
}
