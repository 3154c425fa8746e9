//! Connecting stage that plans motions between arbitrary state pairs.

use std::sync::Arc;
use std::time::Duration;

use stageflow_types::{MotionPlanner, Result, StateRef};

use crate::stage::{Bridge, Connector};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Bridges the gap between a forward and a backward frontier state with a
/// planned motion. A planner that gives up produces a recorded failure,
/// not an error.
pub struct PlanBridge {
    planner: Arc<dyn MotionPlanner>,
    timeout: Duration,
}

impl PlanBridge {
    pub fn new(planner: Arc<dyn MotionPlanner>) -> Self {
        Self {
            planner,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Connector for PlanBridge {
    fn connect(&mut self, from: &StateRef, to: &StateRef) -> Result<Bridge> {
        match self.planner.plan(from.scene(), to.scene(), self.timeout)? {
            Some(trajectory) => Ok(Bridge {
                cost: trajectory.duration(),
                trajectory: Some(trajectory),
                comment: None,
            }),
            None => Ok(Bridge::failed(format!(
                "no path from '{}' to '{}'",
                from.scene().label(),
                to.scene().label()
            ))),
        }
    }
}
