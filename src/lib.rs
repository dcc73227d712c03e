//! enas-micro - Efficient Neural Architecture Search
//!
//! A reinforcement-learning search loop over convolutional-style cell
//! architectures: a recurrent controller pair proposes normal and reduction
//! cells, child networks built from the sampled cells are trained with
//! shared weights, and child validation accuracy feeds back as the
//! controller reward.
//!
//! # Modules
//!
//! - [`cell`] - Cell search space (operations, node specs, cell pairs)
//! - [`controller`] - Architecture sampling policies (REINFORCE + baseline)
//! - [`graph`] - Macro-template and cell-pair resolution into a buildable graph
//! - [`weights`] - Shared weight bank accumulated across search epochs
//! - [`child`] - Child network building, training and evaluation
//! - [`record`] - Append-only training record (the resumability contract)
//! - [`search`] - The search orchestrator and final-training entry point
//! - [`utils`] - SGDR schedule and batching helpers

pub mod error;

pub mod cell;
pub mod controller;
pub mod graph;
pub mod weights;
pub mod child;
pub mod record;
pub mod search;
pub mod utils;

pub use error::{EnasError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{EnasError, Result};

    pub use crate::cell::{
        Cell, CellPair, CellType, NodeSpec, OperationType, SearchSpace, SearchSpaceConfig,
    };

    pub use crate::controller::{
        ArchTargets, CellDistribution, ControllerConfig, Policy, RnnPolicy,
    };

    pub use crate::graph::{ArchitectureGraph, CellGraphBuilder, GraphBuilder};

    pub use crate::weights::WeightBank;

    pub use crate::child::{
        ChildConfig, ChildNetwork, ChildNetworkFactory, ChildTrainer, DataSet, TrainSchedule,
        TrainerFactory,
    };

    pub use crate::record::{RecordLog, RecordRow};

    pub use crate::search::{
        BestState, EnasSearch, EpochOutcome, SearchConfig, SearchOrchestrator, SearchReport,
    };

    pub use crate::utils::sgdr_learning_rate;
}
