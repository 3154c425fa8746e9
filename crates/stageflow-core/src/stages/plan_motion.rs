//! Propagating stage that plans motions toward a goal scene.

use std::sync::Arc;
use std::time::Duration;

use stageflow_types::{MotionPlanner, Result, SceneRef, StateRef};

use crate::stage::{Extension, Propagator};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Extends a neighboring state toward `goal` using a pluggable planner
/// backend. Works in either direction; validation picks the one the
/// surrounding stages imply.
pub struct PlanMotion {
    planner: Arc<dyn MotionPlanner>,
    goal: SceneRef,
    timeout: Duration,
}

impl PlanMotion {
    pub fn new(planner: Arc<dyn MotionPlanner>, goal: SceneRef) -> Self {
        Self {
            planner,
            goal,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn extend(&self, from: &SceneRef, to: &SceneRef) -> Result<Vec<Extension>> {
        match self.planner.plan(from, to, self.timeout)? {
            Some(trajectory) => {
                let cost = trajectory.duration();
                Ok(vec![Extension {
                    scene: self.goal.clone(),
                    trajectory: Some(trajectory),
                    cost,
                    comment: None,
                }])
            }
            None => Ok(vec![Extension {
                scene: self.goal.clone(),
                trajectory: None,
                cost: f64::INFINITY,
                comment: Some(format!("no path to '{}'", self.goal.label())),
            }]),
        }
    }
}

impl Propagator for PlanMotion {
    fn compute_forward(&mut self, from: &StateRef) -> Result<Vec<Extension>> {
        let goal = self.goal.clone();
        self.extend(from.scene(), &goal)
    }

    fn compute_backward(&mut self, from: &StateRef) -> Result<Vec<Extension>> {
        let goal = self.goal.clone();
        self.extend(&goal, from.scene())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stageflow_types::{
        FlowDirection, InterfaceState, SimpleScene, TimedPath, TrajectoryRef,
    };

    #[derive(Debug)]
    struct Straight {
        works: bool,
    }

    impl MotionPlanner for Straight {
        fn plan(
            &self,
            _from: &SceneRef,
            _to: &SceneRef,
            _timeout: Duration,
        ) -> Result<Option<TrajectoryRef>> {
            Ok(self.works.then(|| TimedPath::shared(4, 1.5)))
        }
    }

    fn state() -> StateRef {
        InterfaceState::new(SimpleScene::shared("here"), FlowDirection::Forward, 0.0, 0)
    }

    #[test]
    fn successful_plan_costs_trajectory_duration() {
        let mut stage = PlanMotion::new(
            Arc::new(Straight { works: true }),
            SimpleScene::shared("there"),
        );
        let out = stage.compute_forward(&state()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].cost, 1.5);
        assert!(out[0].trajectory.is_some());
    }

    #[test]
    fn planner_giving_up_yields_a_failure_extension() {
        let mut stage = PlanMotion::new(
            Arc::new(Straight { works: false }),
            SimpleScene::shared("there"),
        );
        let out = stage.compute_forward(&state()).unwrap();
        assert_eq!(out.len(), 1);
        assert!(!out[0].cost.is_finite());
        assert!(out[0].comment.as_deref().unwrap().contains("there"));
    }
}
