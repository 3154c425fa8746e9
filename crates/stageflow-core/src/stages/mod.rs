//! Ready-made stage operators built on the planner and scene abstractions.

mod fixed_state;
mod plan_bridge;
mod plan_motion;
mod scene_list;

pub use fixed_state::FixedState;
pub use plan_bridge::PlanBridge;
pub use plan_motion::PlanMotion;
pub use scene_list::SceneList;
