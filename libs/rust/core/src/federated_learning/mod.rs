//! Federated learning: round coordinator and aggregation strategies.

pub mod coordinator;
pub mod strategy;

pub use coordinator::{
    FederatedLearningCoordinator,
    AggregationMethod,
    RoundId,
    ModelVersion,
    ClientUpdate,
    AggregatedModel,
};
pub use strategy::{FedAvg, LocalTrainer, Strategy};
