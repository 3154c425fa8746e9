//! Stage-graph planning engine.
//!
//! This crate implements the core stageflow runner: interface wiring and
//! validation, the cost-ordered work scheduler, bidirectional propagation
//! and connection, failure pruning, and the built-in stages.

pub mod interface;
pub mod scheduler;
pub mod stage;
pub mod stages;
pub mod task;
pub mod validation;

pub use interface::{Interface, InterfaceRef};
pub use stage::{
    Bridge, Connector, Extension, Generator, PropagationDirection, Propagator, Spawn, Stage,
    StageKind, StagePath, StageStats,
};
pub use stages::{FixedState, PlanBridge, PlanMotion, SceneList};
pub use task::{PlanOptions, PlanSummary, PruneScope, Task, TaskState};
pub use validation::{resolve_shapes, InterfaceShape};
