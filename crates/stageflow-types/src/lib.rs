//! Shared types for the stageflow planning engine.
//!
//! This crate provides the foundational pieces used by `stageflow-core`:
//! - `StageflowError`: unified error taxonomy
//! - `Properties`: typed key-value configuration for stages and states
//! - collaborator contracts: `SceneSnapshot`, `Trajectory`, `MotionPlanner`,
//!   `RobotModel`, `CostTerm`
//! - `InterfaceState`: a scene snapshot pending at a stage boundary
//! - `Solution`: a scored, possibly composite planning result

pub mod properties;
pub mod scene;
pub mod solution;
pub mod state;

pub use properties::{MergeMode, Properties};
pub use scene::{
    same_scene, Constant, CostEstimate, CostProbe, CostTerm, MotionPlanner, NamedRobot,
    PathDuration, PlanningContext, ProbeKind, RobotModel, SceneRef, SceneSnapshot, SimpleScene,
    TimedPath, Trajectory, TrajectoryRef,
};
pub use solution::{Solution, SolutionKind, SolutionRef};
pub use state::{FlowDirection, InterfaceId, InterfaceState, Priority, StateRef};

/// Unified error type for all stageflow subsystems.
#[derive(Debug, thiserror::Error)]
pub enum StageflowError {
    #[error("Stage graph validation failed: {0}")]
    Validation(String),

    #[error("Stage '{stage}' misconfigured: {message}")]
    Config { stage: String, message: String },

    #[error("Stage '{stage}' property '{key}' invalid: {message}")]
    Property {
        stage: String,
        key: String,
        message: String,
    },

    #[error("Task is {state}, expected {expected}")]
    InvalidTaskState { state: String, expected: String },

    #[error("Stage '{stage}' compute failed: {message}")]
    Compute { stage: String, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl StageflowError {
    /// Returns `true` if the error must abort planning before any compute
    /// call runs (malformed graph, bad binding, bad property values).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            StageflowError::Validation(_)
                | StageflowError::Config { .. }
                | StageflowError::Property { .. }
                | StageflowError::InvalidTaskState { .. }
        )
    }
}

/// A convenience alias for `Result<T, StageflowError>`.
pub type Result<T> = std::result::Result<T, StageflowError>;
