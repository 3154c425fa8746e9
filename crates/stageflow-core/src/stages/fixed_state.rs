//! Generator publishing one predefined scene.

use stageflow_types::{Result, SceneRef};

use crate::stage::{Generator, Spawn};

/// Seeds the search with a single known scene, typically the current world
/// state or a fixed goal.
pub struct FixedState {
    scene: Option<SceneRef>,
    template: SceneRef,
    cost: f64,
}

impl FixedState {
    pub fn new(scene: SceneRef) -> Self {
        Self {
            scene: Some(scene.clone()),
            template: scene,
            cost: 0.0,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

impl Generator for FixedState {
    fn reset(&mut self) {
        self.scene = Some(self.template.clone());
    }

    fn can_compute(&self) -> bool {
        self.scene.is_some()
    }

    fn compute(&mut self) -> Result<Vec<Spawn>> {
        Ok(self
            .scene
            .take()
            .map(|scene| vec![Spawn::new(scene, self.cost)])
            .unwrap_or_default())
    }
}
