//! Datafile parsing and the indexed project configuration.
mod models;
mod project_config;

pub use models::{
    Attribute, Audience, CmabConfig, Datafile, DatafileError, EventDefinition, Experiment,
    ExperimentStatus, FeatureFlag, Group, GroupPolicy, Holdout, Rollout, TrafficAllocation,
    Variable, VariableType, VariableUsage, Variation, SUPPORTED_VERSIONS,
};
pub use project_config::ProjectConfig;
