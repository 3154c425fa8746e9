//! Generator enumerating a list of candidate scenes.

use std::collections::VecDeque;

use stageflow_types::{Result, SceneRef};

use crate::stage::{Generator, Spawn};

/// Publishes precomputed scene candidates one per compute call, cheapest
/// first if the caller sorted them that way.
pub struct SceneList {
    remaining: VecDeque<(SceneRef, f64)>,
    template: Vec<(SceneRef, f64)>,
}

impl SceneList {
    pub fn new(scenes: Vec<(SceneRef, f64)>) -> Self {
        Self {
            remaining: scenes.iter().cloned().collect(),
            template: scenes,
        }
    }
}

impl Generator for SceneList {
    fn reset(&mut self) {
        self.remaining = self.template.iter().cloned().collect();
    }

    fn can_compute(&self) -> bool {
        !self.remaining.is_empty()
    }

    fn compute(&mut self) -> Result<Vec<Spawn>> {
        Ok(self
            .remaining
            .pop_front()
            .map(|(scene, cost)| vec![Spawn::new(scene, cost)])
            .unwrap_or_default())
    }
}
