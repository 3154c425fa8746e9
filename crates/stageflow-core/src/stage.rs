//! Stage tree: computation operators, their wiring slots, and bookkeeping.
//!
//! A stage is either a leaf operator (generator, propagator, connector) or
//! a container of child stages. The tree shape is fixed once a task is
//! initialized; interfaces are attached by [`crate::validation`].

use serde_json::Value;
use stageflow_types::{
    CostEstimate, CostProbe, CostTerm, MergeMode, PlanningContext, Properties, Result, SceneRef,
    SolutionRef, StageflowError, StateRef, TrajectoryRef,
};

use crate::interface::InterfaceRef;

// ---------------------------------------------------------------------------
// Operator outputs
// ---------------------------------------------------------------------------

/// One seed state produced by a generator. Published to both neighbors.
#[derive(Debug, Clone)]
pub struct Spawn {
    pub scene: SceneRef,
    pub cost: f64,
    pub comment: Option<String>,
    pub properties: Properties,
}

impl Spawn {
    pub fn new(scene: SceneRef, cost: f64) -> Self {
        Self {
            scene,
            cost,
            comment: None,
            properties: Properties::new(),
        }
    }
}

/// One extension of an existing state through a propagator.
#[derive(Debug, Clone)]
pub struct Extension {
    pub scene: SceneRef,
    pub trajectory: Option<TrajectoryRef>,
    pub cost: f64,
    pub comment: Option<String>,
}

impl Extension {
    pub fn new(scene: SceneRef, cost: f64) -> Self {
        Self {
            scene,
            trajectory: None,
            cost,
            comment: None,
        }
    }
}

/// Result of bridging a forward/backward state pair. Infinite cost records
/// a failed attempt.
#[derive(Debug, Clone)]
pub struct Bridge {
    pub trajectory: Option<TrajectoryRef>,
    pub cost: f64,
    pub comment: Option<String>,
}

impl Bridge {
    pub fn new(cost: f64) -> Self {
        Self {
            trajectory: None,
            cost,
            comment: None,
        }
    }

    pub fn failed(comment: impl Into<String>) -> Self {
        Self {
            trajectory: None,
            cost: f64::INFINITY,
            comment: Some(comment.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Operator traits
// ---------------------------------------------------------------------------

/// Produces seed states from nothing, one batch per compute call.
pub trait Generator: Send {
    fn init(&mut self, _context: &PlanningContext) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) {}

    /// Whether another compute call may still produce spawns.
    fn can_compute(&self) -> bool;

    fn compute(&mut self) -> Result<Vec<Spawn>>;
}

/// Extends a neighboring state one hop in the direction of flow.
pub trait Propagator: Send {
    fn init(&mut self, _context: &PlanningContext) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) {}

    fn compute_forward(&mut self, from: &StateRef) -> Result<Vec<Extension>>;

    fn compute_backward(&mut self, from: &StateRef) -> Result<Vec<Extension>>;
}

/// Bridges arbitrary forward/backward state pairs across a gap.
pub trait Connector: Send {
    fn init(&mut self, _context: &PlanningContext) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) {}

    /// Pre-filter applied before scheduling a pair. Incompatible pairs are
    /// skipped without counting as failures.
    fn compatible(&self, _from: &StateRef, _to: &StateRef) -> bool {
        true
    }

    fn connect(&mut self, from: &StateRef, to: &StateRef) -> Result<Bridge>;
}

/// Declared flow of a propagating stage. `EitherWay` is resolved from the
/// neighbors during validation: running with both directions enabled would
/// give the stage's boundaries two writers, which the single-writer rule
/// forbids, so it always narrows to one concrete direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationDirection {
    Forward,
    Backward,
    EitherWay,
}

// ---------------------------------------------------------------------------
// Stage tree
// ---------------------------------------------------------------------------

/// Position of a stage in the tree, as child indices from the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StagePath(pub Vec<usize>);

impl StagePath {
    pub fn root() -> Self {
        StagePath(Vec::new())
    }

    pub fn child(&self, index: usize) -> StagePath {
        let mut path = self.0.clone();
        path.push(index);
        StagePath(path)
    }

    pub fn parent(&self) -> Option<StagePath> {
        if self.0.is_empty() {
            return None;
        }
        let mut path = self.0.clone();
        path.pop();
        Some(StagePath(path))
    }

    pub fn is_prefix_of(&self, other: &StagePath) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

/// Per-stage compute counters, exposed for introspection.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
}

pub struct GeneratorSlot {
    pub(crate) op: Box<dyn Generator>,
    pub(crate) prev: Option<InterfaceRef>,
    pub(crate) next: Option<InterfaceRef>,
}

pub struct PropagatorSlot {
    pub(crate) op: Box<dyn Propagator>,
    pub(crate) direction: PropagationDirection,
    pub(crate) forward_enabled: bool,
    pub(crate) backward_enabled: bool,
    pub(crate) start: Option<InterfaceRef>,
    pub(crate) end: Option<InterfaceRef>,
}

pub struct ConnectorSlot {
    pub(crate) op: Box<dyn Connector>,
    pub(crate) merge_mode: MergeMode,
    pub(crate) seen_forward: Vec<StateRef>,
    pub(crate) seen_backward: Vec<StateRef>,
    pub(crate) start: Option<InterfaceRef>,
    pub(crate) end: Option<InterfaceRef>,
}

pub enum StageKind {
    Generator(GeneratorSlot),
    Propagator(PropagatorSlot),
    Connector(ConnectorSlot),
    Serial(Vec<Stage>),
    Parallel(Vec<Stage>),
}

impl std::fmt::Debug for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageKind::Generator(_) => f.write_str("Generator"),
            StageKind::Propagator(slot) => write!(f, "Propagator({:?})", slot.direction),
            StageKind::Connector(_) => f.write_str("Connector"),
            StageKind::Serial(children) => write!(f, "Serial({})", children.len()),
            StageKind::Parallel(children) => write!(f, "Parallel({})", children.len()),
        }
    }
}

pub struct Stage {
    name: String,
    properties: Properties,
    cost_term: Option<Box<dyn CostTerm>>,
    pub(crate) stats: StageStats,
    pub(crate) solutions: Vec<SolutionRef>,
    pub(crate) failures: Vec<SolutionRef>,
    pub(crate) exhausted: bool,
    pub(crate) pending_work: usize,
    pub(crate) kind: StageKind,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl Stage {
    fn with_kind(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            properties: Properties::new(),
            cost_term: None,
            stats: StageStats::default(),
            solutions: Vec::new(),
            failures: Vec::new(),
            exhausted: false,
            pending_work: 0,
            kind,
        }
    }

    pub fn generator(name: impl Into<String>, op: impl Generator + 'static) -> Self {
        Self::with_kind(
            name,
            StageKind::Generator(GeneratorSlot {
                op: Box::new(op),
                prev: None,
                next: None,
            }),
        )
    }

    fn propagating(
        name: impl Into<String>,
        op: impl Propagator + 'static,
        direction: PropagationDirection,
    ) -> Self {
        Self::with_kind(
            name,
            StageKind::Propagator(PropagatorSlot {
                op: Box::new(op),
                direction,
                forward_enabled: direction != PropagationDirection::Backward,
                backward_enabled: direction != PropagationDirection::Forward,
                start: None,
                end: None,
            }),
        )
    }

    pub fn forward(name: impl Into<String>, op: impl Propagator + 'static) -> Self {
        Self::propagating(name, op, PropagationDirection::Forward)
    }

    pub fn backward(name: impl Into<String>, op: impl Propagator + 'static) -> Self {
        Self::propagating(name, op, PropagationDirection::Backward)
    }

    /// Propagating stage that adopts whichever direction its neighbors
    /// imply. Validation narrows it to exactly one of forward or backward
    /// and rejects the tree when neither neighbor determines a direction.
    pub fn either_way(name: impl Into<String>, op: impl Propagator + 'static) -> Self {
        Self::propagating(name, op, PropagationDirection::EitherWay)
    }

    pub fn connector(name: impl Into<String>, op: impl Connector + 'static) -> Self {
        Self::with_kind(
            name,
            StageKind::Connector(ConnectorSlot {
                op: Box::new(op),
                merge_mode: MergeMode::default(),
                seen_forward: Vec::new(),
                seen_backward: Vec::new(),
                start: None,
                end: None,
            }),
        )
    }

    pub fn serial(name: impl Into<String>, children: Vec<Stage>) -> Self {
        Self::with_kind(name, StageKind::Serial(children))
    }

    pub fn parallel(name: impl Into<String>, children: Vec<Stage>) -> Self {
        Self::with_kind(name, StageKind::Parallel(children))
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.set(key, value);
        self
    }

    pub fn with_cost_term(mut self, term: impl CostTerm + 'static) -> Self {
        self.cost_term = Some(Box::new(term));
        self
    }

    // -----------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    pub fn stats(&self) -> StageStats {
        self.stats
    }

    pub fn solutions(&self) -> &[SolutionRef] {
        &self.solutions
    }

    pub fn failures(&self) -> &[SolutionRef] {
        &self.failures
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn children(&self) -> &[Stage] {
        match &self.kind {
            StageKind::Serial(children) | StageKind::Parallel(children) => children,
            _ => &[],
        }
    }

    pub(crate) fn children_mut(&mut self) -> &mut [Stage] {
        match &mut self.kind {
            StageKind::Serial(children) | StageKind::Parallel(children) => children,
            _ => &mut [],
        }
    }

    pub fn find(&self, path: &StagePath) -> Option<&Stage> {
        let mut current = self;
        for &index in &path.0 {
            current = current.children().get(index)?;
        }
        Some(current)
    }

    pub(crate) fn find_mut(&mut self, path: &StagePath) -> Option<&mut Stage> {
        let mut current = self;
        for &index in &path.0 {
            current = current.children_mut().get_mut(index)?;
        }
        Some(current)
    }

    /// Apply this stage's cost term to a candidate, or pass the proposed
    /// cost through unchanged.
    pub fn score(&self, probe: &CostProbe<'_>) -> CostEstimate {
        match &self.cost_term {
            Some(term) => term.score(probe),
            None => CostEstimate::new(probe.proposed_cost),
        }
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Walk the tree, initializing operators and resolving property-driven
    /// configuration.
    pub(crate) fn init_recursive(&mut self, context: &PlanningContext) -> Result<()> {
        let name = self.name.clone();
        match &mut self.kind {
            StageKind::Generator(slot) => slot.op.init(context)?,
            StageKind::Propagator(slot) => slot.op.init(context)?,
            StageKind::Connector(slot) => {
                slot.op.init(context)?;
                if let Some(value) = self.properties.get("merge_mode") {
                    slot.merge_mode = serde_json::from_value(value.clone()).map_err(|e| {
                        StageflowError::Property {
                            stage: name,
                            key: "merge_mode".into(),
                            message: e.to_string(),
                        }
                    })?;
                }
            }
            StageKind::Serial(children) | StageKind::Parallel(children) => {
                for child in children {
                    child.init_recursive(context)?;
                }
            }
        }
        Ok(())
    }

    /// Clear all planning state so the task can run again from scratch.
    pub(crate) fn reset_recursive(&mut self) {
        self.stats = StageStats::default();
        self.solutions.clear();
        self.failures.clear();
        self.exhausted = false;
        self.pending_work = 0;
        match &mut self.kind {
            StageKind::Generator(slot) => slot.op.reset(),
            StageKind::Propagator(slot) => slot.op.reset(),
            StageKind::Connector(slot) => {
                slot.seen_forward.clear();
                slot.seen_backward.clear();
                slot.op.reset();
            }
            StageKind::Serial(children) | StageKind::Parallel(children) => {
                for child in children {
                    child.reset_recursive();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stageflow_types::{ProbeKind, SimpleScene};

    struct Nop;

    impl Generator for Nop {
        fn can_compute(&self) -> bool {
            false
        }

        fn compute(&mut self) -> Result<Vec<Spawn>> {
            Ok(Vec::new())
        }
    }

    struct Echo;

    impl Propagator for Echo {
        fn compute_forward(&mut self, from: &StateRef) -> Result<Vec<Extension>> {
            Ok(vec![Extension::new(from.scene().diff(), 1.0)])
        }

        fn compute_backward(&mut self, from: &StateRef) -> Result<Vec<Extension>> {
            Ok(vec![Extension::new(from.scene().diff(), 1.0)])
        }
    }

    struct Join;

    impl Connector for Join {
        fn connect(&mut self, _from: &StateRef, _to: &StateRef) -> Result<Bridge> {
            Ok(Bridge::new(0.0))
        }
    }

    #[test]
    fn path_navigation() {
        let root = StagePath::root();
        let child = root.child(2);
        assert_eq!(child.0, vec![2]);
        assert_eq!(child.parent(), Some(root.clone()));
        assert!(root.is_prefix_of(&child));
        assert!(!child.is_prefix_of(&root));
    }

    #[test]
    fn find_walks_child_indices() {
        let tree = Stage::serial(
            "task",
            vec![
                Stage::generator("gen", Nop),
                Stage::serial("inner", vec![Stage::forward("move", Echo)]),
            ],
        );
        let found = tree.find(&StagePath(vec![1, 0])).unwrap();
        assert_eq!(found.name(), "move");
        assert!(tree.find(&StagePath(vec![5])).is_none());
    }

    #[test]
    fn merge_mode_is_read_from_properties() {
        let context = PlanningContext::new(stageflow_types::NamedRobot::shared("bot"));
        let mut stage = Stage::connector("join", Join).with_property("merge_mode", "sequential");
        stage.init_recursive(&context).unwrap();
        match &stage.kind {
            StageKind::Connector(slot) => assert_eq!(slot.merge_mode, MergeMode::Sequential),
            _ => unreachable!(),
        }
    }

    #[test]
    fn bad_merge_mode_is_a_property_error() {
        let context = PlanningContext::new(stageflow_types::NamedRobot::shared("bot"));
        let mut stage = Stage::connector("join", Join).with_property("merge_mode", "sideways");
        let err = stage.init_recursive(&context).unwrap_err();
        assert!(matches!(err, StageflowError::Property { .. }));
    }

    #[test]
    fn score_passes_through_without_a_term() {
        let stage = Stage::generator("gen", Nop);
        let probe = CostProbe {
            kind: ProbeKind::Trajectory,
            trajectory: None,
            proposed_cost: 4.0,
        };
        assert_eq!(stage.score(&probe).cost, 4.0);
    }

    #[test]
    fn reset_clears_planning_state() {
        let mut stage = Stage::generator("gen", Nop);
        stage.stats.calls = 3;
        stage.exhausted = true;
        let a = stageflow_types::InterfaceState::new(
            SimpleScene::shared("a"),
            stageflow_types::FlowDirection::Forward,
            0.0,
            0,
        );
        let b = stageflow_types::InterfaceState::new(
            SimpleScene::shared("b"),
            stageflow_types::FlowDirection::Backward,
            0.0,
            0,
        );
        stage
            .solutions
            .push(stageflow_types::Solution::segment("gen", a, b, None, 0.0, None));
        stage.reset_recursive();
        assert_eq!(stage.stats().calls, 0);
        assert!(!stage.is_exhausted());
        assert!(stage.solutions().is_empty());
    }
}
