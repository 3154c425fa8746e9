//! Planning-scene abstractions and cost scoring.
//!
//! The engine never inspects scene contents; it only threads opaque
//! snapshots between stages and asks cost terms to score candidate
//! solutions.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::Result;

// ---------------------------------------------------------------------------
// Scenes
// ---------------------------------------------------------------------------

/// An immutable snapshot of the world at one point in the plan.
pub trait SceneSnapshot: Send + Sync + Debug {
    /// Derive a new snapshot representing an incremental change on top of
    /// this one.
    fn diff(&self) -> SceneRef;

    /// Short human-readable identifier, used in logs and comments.
    fn label(&self) -> &str;
}

pub type SceneRef = Arc<dyn SceneSnapshot>;

/// Snapshot identity. Two refs name the same scene only when they point at
/// the same allocation.
pub fn same_scene(a: &SceneRef, b: &SceneRef) -> bool {
    Arc::ptr_eq(a, b)
}

/// Minimal labelled scene used by built-in stages and tests.
#[derive(Debug, Clone)]
pub struct SimpleScene {
    label: String,
}

impl SimpleScene {
    pub fn shared(label: impl Into<String>) -> SceneRef {
        Arc::new(Self { label: label.into() })
    }
}

impl SceneSnapshot for SimpleScene {
    fn diff(&self) -> SceneRef {
        SimpleScene::shared(format!("{}'", self.label))
    }

    fn label(&self) -> &str {
        &self.label
    }
}

// ---------------------------------------------------------------------------
// Robots and trajectories
// ---------------------------------------------------------------------------

/// The robot a task plans for. The engine only needs a name; planners may
/// downcast to richer models.
pub trait RobotModel: Send + Sync + Debug {
    fn name(&self) -> &str;
}

#[derive(Debug)]
pub struct NamedRobot {
    name: String,
}

impl NamedRobot {
    pub fn shared(name: impl Into<String>) -> Arc<dyn RobotModel> {
        Arc::new(Self { name: name.into() })
    }
}

impl RobotModel for NamedRobot {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Shared context handed to every stage at initialization.
#[derive(Debug, Clone)]
pub struct PlanningContext {
    pub robot: Arc<dyn RobotModel>,
}

impl PlanningContext {
    pub fn new(robot: Arc<dyn RobotModel>) -> Self {
        Self { robot }
    }
}

/// A motion segment connecting two scenes.
pub trait Trajectory: Send + Sync + Debug {
    fn duration(&self) -> f64;

    fn is_empty(&self) -> bool {
        self.duration() == 0.0
    }
}

pub type TrajectoryRef = Arc<dyn Trajectory>;

/// Trajectory stub carrying only timing metadata.
#[derive(Debug, Clone)]
pub struct TimedPath {
    pub waypoints: usize,
    pub duration: f64,
}

impl TimedPath {
    pub fn shared(waypoints: usize, duration: f64) -> TrajectoryRef {
        Arc::new(Self { waypoints, duration })
    }
}

impl Trajectory for TimedPath {
    fn duration(&self) -> f64 {
        self.duration
    }

    fn is_empty(&self) -> bool {
        self.waypoints == 0
    }
}

/// Pluggable planner backend used by the built-in motion stages.
pub trait MotionPlanner: Send + Sync + Debug {
    /// Plan a path between two scenes. `Ok(None)` means the planner gave up
    /// within `timeout` without an error.
    fn plan(
        &self,
        from: &SceneRef,
        to: &SceneRef,
        timeout: Duration,
    ) -> Result<Option<TrajectoryRef>>;
}

// ---------------------------------------------------------------------------
// Cost terms
// ---------------------------------------------------------------------------

/// What kind of solution a cost term is scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Trajectory,
    Sequence,
    Wrapped,
}

/// Read-only view of a candidate solution offered to a [`CostTerm`].
#[derive(Debug)]
pub struct CostProbe<'a> {
    pub kind: ProbeKind,
    pub trajectory: Option<&'a TrajectoryRef>,
    pub proposed_cost: f64,
}

#[derive(Debug, Clone)]
pub struct CostEstimate {
    pub cost: f64,
    pub comment: Option<String>,
}

impl CostEstimate {
    pub fn new(cost: f64) -> Self {
        Self { cost, comment: None }
    }

    pub fn with_comment(cost: f64, comment: impl Into<String>) -> Self {
        Self {
            cost,
            comment: Some(comment.into()),
        }
    }
}

/// Rescoring hook attached to a stage or container.
pub trait CostTerm: Send + Sync {
    fn score(&self, probe: &CostProbe<'_>) -> CostEstimate;
}

/// Fixed cost regardless of the solution content.
pub struct Constant(pub f64);

impl CostTerm for Constant {
    fn score(&self, _probe: &CostProbe<'_>) -> CostEstimate {
        CostEstimate::new(self.0)
    }
}

/// Cost equal to the trajectory execution time. Falls back to the proposed
/// cost for solutions without a trajectory.
pub struct PathDuration;

impl CostTerm for PathDuration {
    fn score(&self, probe: &CostProbe<'_>) -> CostEstimate {
        match probe.trajectory {
            Some(traj) => CostEstimate::new(traj.duration()),
            None => CostEstimate::new(probe.proposed_cost),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scene_identity_is_pointer_identity() {
        let a = SimpleScene::shared("home");
        let b = a.clone();
        let c = SimpleScene::shared("home");
        assert!(same_scene(&a, &b));
        assert!(!same_scene(&a, &c));
    }

    #[test]
    fn diff_derives_a_distinct_scene() {
        let base = SimpleScene::shared("grasp");
        let derived = base.diff();
        assert!(!same_scene(&base, &derived));
        assert_eq!(derived.label(), "grasp'");
    }

    #[test]
    fn constant_ignores_probe() {
        let term = Constant(7.0);
        let probe = CostProbe {
            kind: ProbeKind::Sequence,
            trajectory: None,
            proposed_cost: 3.0,
        };
        assert_eq!(term.score(&probe).cost, 7.0);
    }

    #[test]
    fn path_duration_prefers_trajectory_timing() {
        let traj = TimedPath::shared(5, 2.5);
        let probe = CostProbe {
            kind: ProbeKind::Trajectory,
            trajectory: Some(&traj),
            proposed_cost: 99.0,
        };
        assert_eq!(PathDuration.score(&probe).cost, 2.5);

        let bare = CostProbe {
            kind: ProbeKind::Sequence,
            trajectory: None,
            proposed_cost: 99.0,
        };
        assert_eq!(PathDuration.score(&bare).cost, 99.0);
    }

    #[test]
    fn empty_path_has_zero_waypoints() {
        let traj = TimedPath::shared(0, 0.0);
        assert!(traj.is_empty());
    }
}
