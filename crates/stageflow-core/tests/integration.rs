//! End-to-end planning scenarios driven by scripted stage operators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use stageflow_core::{
    Bridge, Connector, Extension, Generator, PlanOptions, Propagator, PruneScope, Spawn, Stage,
    Task, TaskState,
};
use stageflow_types::{
    Constant, NamedRobot, Properties, Result, SimpleScene, Solution, SolutionKind, StateRef,
};

const INF: f64 = f64::INFINITY;

#[derive(Clone, Default)]
struct CallCount(Arc<AtomicUsize>);

impl CallCount {
    fn bump(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Spawns one scene per compute call with the next scripted cost.
struct ScriptedGenerator {
    costs: VecDeque<f64>,
    template: Vec<f64>,
    properties: Properties,
}

impl ScriptedGenerator {
    fn new(costs: &[f64]) -> Self {
        Self {
            costs: costs.iter().copied().collect(),
            template: costs.to_vec(),
            properties: Properties::new(),
        }
    }

    fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }
}

impl Generator for ScriptedGenerator {
    fn reset(&mut self) {
        self.costs = self.template.iter().copied().collect();
    }

    fn can_compute(&self) -> bool {
        !self.costs.is_empty()
    }

    fn compute(&mut self) -> Result<Vec<Spawn>> {
        let cost = self.costs.pop_front().unwrap_or(0.0);
        let mut spawn = Spawn::new(SimpleScene::shared("scene"), cost);
        spawn.properties = self.properties.clone();
        Ok(vec![spawn])
    }
}

/// Extends states with scripted costs; the last scripted cost repeats
/// forever once the list is drained.
struct ScriptedPropagator {
    costs: VecDeque<f64>,
    last: f64,
    per_compute: usize,
    calls: CallCount,
}

impl ScriptedPropagator {
    fn new(costs: &[f64], calls: CallCount) -> Self {
        Self::batched(costs, 1, calls)
    }

    fn batched(costs: &[f64], per_compute: usize, calls: CallCount) -> Self {
        Self {
            costs: costs.iter().copied().collect(),
            last: 0.0,
            per_compute,
            calls,
        }
    }

    fn next_cost(&mut self) -> f64 {
        if let Some(cost) = self.costs.pop_front() {
            self.last = cost;
        }
        self.last
    }

    fn extend(&mut self, from: &StateRef) -> Vec<Extension> {
        self.calls.bump();
        let mut out = Vec::with_capacity(self.per_compute);
        for _ in 0..self.per_compute {
            out.push(Extension::new(from.scene().diff(), self.next_cost()));
        }
        out
    }
}

impl Propagator for ScriptedPropagator {
    fn compute_forward(&mut self, from: &StateRef) -> Result<Vec<Extension>> {
        Ok(self.extend(from))
    }

    fn compute_backward(&mut self, from: &StateRef) -> Result<Vec<Extension>> {
        Ok(self.extend(from))
    }
}

/// Propagator contributing no solutions at all.
struct SilentForward {
    calls: CallCount,
}

impl Propagator for SilentForward {
    fn compute_forward(&mut self, _from: &StateRef) -> Result<Vec<Extension>> {
        self.calls.bump();
        Ok(Vec::new())
    }

    fn compute_backward(&mut self, _from: &StateRef) -> Result<Vec<Extension>> {
        self.calls.bump();
        Ok(Vec::new())
    }
}

/// Bridges pairs with scripted costs, repeating the last cost forever.
struct ScriptedConnector {
    costs: VecDeque<f64>,
    last: f64,
    calls: CallCount,
}

impl ScriptedConnector {
    fn new(costs: &[f64], calls: CallCount) -> Self {
        Self {
            costs: costs.iter().copied().collect(),
            last: 0.0,
            calls,
        }
    }
}

impl Connector for ScriptedConnector {
    fn connect(&mut self, _from: &StateRef, _to: &StateRef) -> Result<Bridge> {
        self.calls.bump();
        let cost = if let Some(cost) = self.costs.pop_front() {
            self.last = cost;
            cost
        } else {
            self.last
        };
        Ok(Bridge::new(cost))
    }
}

fn robot() -> Arc<dyn stageflow_types::RobotModel> {
    // Honors RUST_LOG when a test run needs engine traces.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    NamedRobot::shared("test-bot")
}

fn result_costs(task: &Task) -> Vec<f64> {
    task.results().iter().map(|s| s.cost()).collect()
}

// ---------------------------------------------------------------------------
// Cost calibration and ordering
// ---------------------------------------------------------------------------

#[test]
fn costs_combine_across_two_connections() {
    let mut task = Task::new("calibration");
    task.add(Stage::generator("approach", ScriptedGenerator::new(&[1.0, 2.0, 3.0])));
    task.add(Stage::connector("join-a", ScriptedConnector::new(&[], CallCount::default())));
    task.add(Stage::generator("grasp", ScriptedGenerator::new(&[10.0, 20.0])));
    task.add(Stage::connector("join-b", ScriptedConnector::new(&[], CallCount::default())));
    task.add(Stage::generator("place", ScriptedGenerator::new(&[0.0])));
    task.init(robot()).unwrap();

    assert!(task.plan(PlanOptions::new()).unwrap());
    assert_eq!(result_costs(&task), vec![11.0, 12.0, 13.0, 21.0, 22.0, 23.0]);
    assert_eq!(task.state(), TaskState::Done);
}

#[test]
fn always_failing_connection_yields_no_solutions() {
    let mut task = Task::new("fail-succ");
    task.add(Stage::generator("g1", ScriptedGenerator::new(&[0.0])));
    task.add(
        Stage::connector("broken", ScriptedConnector::new(&[INF], CallCount::default()))
            .with_property("merge_mode", "sequential"),
    );
    task.add(Stage::generator("g2", ScriptedGenerator::new(&[0.0])));
    task.add(Stage::connector("fine", ScriptedConnector::new(&[], CallCount::default())));
    task.add(Stage::generator("g3", ScriptedGenerator::new(&[0.0])));
    let silent = CallCount::default();
    task.add(Stage::forward("dropout", SilentForward { calls: silent }));
    task.init(robot()).unwrap();

    assert!(!task.plan(PlanOptions::new()).unwrap());
    assert!(task.results().is_empty());
    let summary = task.summary().unwrap();
    assert!(summary.exhausted);
    assert!(summary.failures > 0);
}

#[test]
fn connector_tries_every_state_combination() {
    let calls = CallCount::default();
    let mut task = Task::new("pairs");
    task.add(Stage::generator("left", ScriptedGenerator::new(&[1.0, 2.0])));
    task.add(Stage::connector("join", ScriptedConnector::new(&[], calls.clone())));
    task.add(Stage::generator("right", ScriptedGenerator::new(&[5.0, 6.0])));
    task.init(robot()).unwrap();

    assert!(task.plan(PlanOptions::new()).unwrap());
    assert_eq!(calls.get(), 4);
    assert_eq!(result_costs(&task), vec![6.0, 7.0, 7.0, 8.0]);
}

// ---------------------------------------------------------------------------
// Parallel alternatives
// ---------------------------------------------------------------------------

fn contains_wrapped(solution: &Solution, creator: &str) -> bool {
    match solution.kind() {
        SolutionKind::Wrapped { inner } => {
            solution.creator() == creator || contains_wrapped(inner, creator)
        }
        SolutionKind::Sequence { children } => {
            children.iter().any(|c| contains_wrapped(c, creator))
        }
        SolutionKind::Trajectory { .. } => false,
    }
}

#[test]
fn parallel_alternatives_rank_both_branches() {
    let mut task = Task::new("alternatives");
    task.add(Stage::generator("seed", ScriptedGenerator::new(&[0.0])));
    task.add(Stage::parallel(
        "alts",
        vec![
            Stage::forward("direct", ScriptedPropagator::new(&[1.0], CallCount::default())),
            Stage::forward("detour", ScriptedPropagator::new(&[2.0], CallCount::default())),
        ],
    ));
    task.init(robot()).unwrap();

    assert!(task.plan(PlanOptions::new()).unwrap());
    assert_eq!(result_costs(&task), vec![1.0, 2.0]);
    assert_eq!(task.state(), TaskState::Done);
    // Each branch reaches the task result as a fragment lifted through the
    // container.
    for result in task.results() {
        assert!(contains_wrapped(result, "alts"));
    }
}

#[test]
fn parallel_cost_term_rescosts_lifted_solutions() {
    let mut task = Task::new("alternatives-rescore");
    task.add(Stage::generator("seed", ScriptedGenerator::new(&[0.0])));
    task.add(
        Stage::parallel(
            "alts",
            vec![
                Stage::forward("direct", ScriptedPropagator::new(&[1.0], CallCount::default())),
                Stage::forward("detour", ScriptedPropagator::new(&[2.0], CallCount::default())),
            ],
        )
        .with_cost_term(Constant(5.0)),
    );
    task.init(robot()).unwrap();

    assert!(task.plan(PlanOptions::new()).unwrap());
    // The container's cost term replaces both branch costs.
    assert_eq!(result_costs(&task), vec![5.0, 5.0]);
}

// ---------------------------------------------------------------------------
// Pruning
// ---------------------------------------------------------------------------

#[test]
fn propagator_failure_prunes_the_backward_branch() {
    let backward_calls = CallCount::default();
    let mut task = Task::new("propagator-failure");
    task.add(Stage::backward(
        "retreat",
        ScriptedPropagator::new(&[0.0], backward_calls.clone()),
    ));
    task.add(Stage::generator("grasp", ScriptedGenerator::new(&[0.0])));
    task.add(Stage::forward(
        "lift",
        ScriptedPropagator::new(&[INF], CallCount::default()),
    ));
    task.init(robot()).unwrap();

    assert!(!task.plan(PlanOptions::new()).unwrap());
    assert!(task.results().is_empty());
    // The forward failure makes the shared seed state a dead end, so the
    // backward stage must never run.
    assert_eq!(backward_calls.get(), 0);
}

#[test]
fn partial_failure_keeps_sibling_solutions() {
    let mut task = Task::new("multi-forward");
    task.add(Stage::backward(
        "b1",
        ScriptedPropagator::new(&[0.0], CallCount::default()),
    ));
    task.add(Stage::backward(
        "b2",
        ScriptedPropagator::new(&[0.0], CallCount::default()),
    ));
    task.add(Stage::generator("seed", ScriptedGenerator::new(&[0.0])));
    // Two extensions from the single seed state.
    task.add(Stage::forward(
        "split",
        ScriptedPropagator::batched(&[0.0, 0.0], 2, CallCount::default()),
    ));
    // The second extension fails; the first must survive.
    task.add(Stage::forward(
        "filter",
        ScriptedPropagator::new(&[0.0, INF], CallCount::default()),
    ));
    task.init(robot()).unwrap();

    assert!(task.plan(PlanOptions::new()).unwrap());
    assert_eq!(result_costs(&task), vec![0.0]);
}

#[test]
fn early_connection_failure_prunes_downstream_pairs() {
    let c1_calls = CallCount::default();
    let c2_calls = CallCount::default();
    let mut task = Task::new("prune-forward");
    task.add(Stage::generator("g1", ScriptedGenerator::new(&[0.0])));
    // First attempt fails, everything after succeeds.
    task.add(Stage::connector("c1", ScriptedConnector::new(&[INF, 0.0], c1_calls.clone())));
    task.add(Stage::generator("g2", ScriptedGenerator::new(&[0.0, 10.0, 20.0])));
    task.add(Stage::forward(
        "shift",
        ScriptedPropagator::new(&[0.0], CallCount::default()),
    ));
    task.add(Stage::connector("c2", ScriptedConnector::new(&[], c2_calls.clone())));
    task.add(Stage::generator("g3", ScriptedGenerator::new(&[1.0, 2.0, 3.0])));
    task.init(robot()).unwrap();

    assert!(task.plan(PlanOptions::new()).unwrap());
    assert_eq!(result_costs(&task), vec![11.0, 12.0, 13.0, 21.0, 22.0, 23.0]);
    assert_eq!(c1_calls.get(), 3);
    // Pairs downstream of the failed first connection are skipped.
    assert_eq!(c2_calls.get(), 6);
}

#[test]
fn late_connection_failure_prunes_upstream_pairs() {
    let c1_calls = CallCount::default();
    let c2_calls = CallCount::default();
    let mut task = Task::new("prune-backward");
    task.add(Stage::generator("g1", ScriptedGenerator::new(&[1.0, 2.0, 3.0])));
    task.add(Stage::connector("c1", ScriptedConnector::new(&[], c1_calls.clone())));
    task.add(Stage::backward(
        "shift",
        ScriptedPropagator::new(&[0.0], CallCount::default()),
    ));
    task.add(Stage::generator("g2", ScriptedGenerator::new(&[0.0, 10.0, 20.0])));
    task.add(Stage::connector("c2", ScriptedConnector::new(&[INF, 0.0], c2_calls.clone())));
    task.add(Stage::generator("g3", ScriptedGenerator::new(&[0.0])));
    task.init(robot()).unwrap();

    assert!(task.plan(PlanOptions::new()).unwrap());
    assert_eq!(result_costs(&task), vec![11.0, 12.0, 13.0, 21.0, 22.0, 23.0]);
    assert_eq!(c2_calls.get(), 3);
    assert_eq!(c1_calls.get(), 6);
}

#[test]
fn external_failure_prunes_inside_a_container() {
    let con_calls = CallCount::default();
    let mut task = Task::new("prune-into-container");
    task.add(Stage::backward(
        "retreat",
        ScriptedPropagator::new(&[INF], CallCount::default()),
    ));
    task.add(Stage::generator("seed", ScriptedGenerator::new(&[0.0])));
    task.add(Stage::serial(
        "approach",
        vec![
            Stage::connector("con", ScriptedConnector::new(&[], con_calls.clone())),
            Stage::generator("goal", ScriptedGenerator::new(&[0.0])),
        ],
    ));
    task.init(robot()).unwrap();

    assert!(!task.plan(PlanOptions::new()).unwrap());
    // The backward failure outside the container kills the pending pair
    // inside it.
    assert_eq!(con_calls.get(), 0);
}

#[test]
fn container_local_scope_stops_pruning_at_the_boundary() {
    let build = |scope: PruneScope| {
        let far_calls = CallCount::default();
        let mut task = Task::new("prune-scope");
        task.set_prune_scope(scope);
        task.add(Stage::backward(
            "far",
            ScriptedPropagator::new(&[0.0], far_calls.clone()),
        ));
        task.add(Stage::backward(
            "near",
            ScriptedPropagator::new(&[0.0], CallCount::default()),
        ));
        task.add(Stage::generator("seed", ScriptedGenerator::new(&[0.0])));
        task.add(Stage::serial(
            "descent",
            vec![
                Stage::forward(
                    "fail",
                    ScriptedPropagator::new(&[INF], CallCount::default()),
                ),
                Stage::forward(
                    "finish",
                    ScriptedPropagator::new(&[0.0], CallCount::default()),
                ),
            ],
        ));
        task.init(robot()).unwrap();
        task.plan(PlanOptions::new()).unwrap();
        (task, far_calls)
    };

    let (task, far_calls) = build(PruneScope::WholeTask);
    assert!(task.results().is_empty());
    assert_eq!(far_calls.get(), 0);

    // With pruning confined to the container, the backward side keeps
    // computing even though the forward side is already dead.
    let (task, far_calls) = build(PruneScope::ContainerLocal);
    assert!(task.results().is_empty());
    assert_eq!(far_calls.get(), 1);
}

// ---------------------------------------------------------------------------
// Stopping criteria
// ---------------------------------------------------------------------------

#[test]
fn max_solutions_stops_early_and_planning_can_resume() {
    let calls = CallCount::default();
    let mut task = Task::new("early-stop");
    task.add(Stage::generator("left", ScriptedGenerator::new(&[1.0, 2.0, 3.0])));
    task.add(Stage::connector("join", ScriptedConnector::new(&[], calls.clone())));
    task.add(Stage::generator("right", ScriptedGenerator::new(&[0.0])));
    task.init(robot()).unwrap();

    assert!(task
        .plan(PlanOptions::new().with_max_solutions(2))
        .unwrap());
    assert_eq!(task.results().len(), 2);
    assert_eq!(calls.get(), 2);
    assert_eq!(task.state(), TaskState::Idle);
    assert!(!task.summary().unwrap().exhausted);

    // Resuming picks up the remaining queued work.
    assert!(task.plan(PlanOptions::new()).unwrap());
    assert_eq!(result_costs(&task), vec![1.0, 2.0, 3.0]);
    assert_eq!(task.state(), TaskState::Done);
}

#[test]
fn zero_timeout_returns_before_any_compute() {
    let calls = CallCount::default();
    let mut task = Task::new("timeout");
    task.add(Stage::generator("left", ScriptedGenerator::new(&[1.0])));
    task.add(Stage::connector("join", ScriptedConnector::new(&[], calls.clone())));
    task.add(Stage::generator("right", ScriptedGenerator::new(&[0.0])));
    task.init(robot()).unwrap();

    assert!(!task
        .plan(PlanOptions::new().with_timeout(Duration::ZERO))
        .unwrap());
    assert_eq!(calls.get(), 0);
    let summary = task.summary().unwrap();
    assert_eq!(summary.solutions, 0);
    assert!(!summary.exhausted);
}

#[test]
fn cancellation_token_stops_planning() {
    let calls = CallCount::default();
    let mut task = Task::new("cancel");
    task.add(Stage::generator("left", ScriptedGenerator::new(&[1.0])));
    task.add(Stage::connector("join", ScriptedConnector::new(&[], calls.clone())));
    task.add(Stage::generator("right", ScriptedGenerator::new(&[0.0])));
    task.init(robot()).unwrap();

    task.cancel_token().store(true, Ordering::Relaxed);
    assert!(!task.plan(PlanOptions::new()).unwrap());
    assert_eq!(calls.get(), 0);
    assert_eq!(task.state(), TaskState::Idle);
}

// ---------------------------------------------------------------------------
// Property merging and determinism
// ---------------------------------------------------------------------------

fn bridge_properties(task: &Task, connector: &str) -> Properties {
    let mut found = None;
    task.results()[0].for_each_sub_trajectory(&mut |leaf| {
        if leaf.creator() == connector {
            if let SolutionKind::Trajectory { properties, .. } = leaf.kind() {
                found = Some(properties.clone());
            }
        }
    });
    found.expect("bridge segment present in the solution")
}

#[test]
fn merge_modes_control_bridge_property_provenance() {
    let build = |sequential: bool| {
        let mut left = Properties::new();
        left.set("grasp", json!("left"));
        left.set("object", json!("cup"));
        let mut right = Properties::new();
        right.set("grasp", json!("right"));

        let mut task = Task::new("merge");
        task.add(Stage::generator(
            "from",
            ScriptedGenerator::new(&[0.0]).with_properties(left),
        ));
        let mut join = Stage::connector("join", ScriptedConnector::new(&[], CallCount::default()));
        if sequential {
            join = join.with_property("merge_mode", "sequential");
        }
        task.add(join);
        task.add(Stage::generator(
            "to",
            ScriptedGenerator::new(&[0.0]).with_properties(right),
        ));
        task.init(robot()).unwrap();
        assert!(task.plan(PlanOptions::new()).unwrap());
        task
    };

    let unordered = build(false);
    let props = bridge_properties(&unordered, "join");
    assert!(!props.contains("grasp"));
    assert_eq!(props.get_string("object", ""), "cup");

    let sequential = build(true);
    let props = bridge_properties(&sequential, "join");
    assert_eq!(props.get_string("grasp", ""), "right");
    assert_eq!(props.get_string("object", ""), "cup");
}

#[test]
fn reset_gives_identical_replans() {
    let calls = CallCount::default();
    let mut task = Task::new("replan");
    task.add(Stage::generator("left", ScriptedGenerator::new(&[1.0, 2.0])));
    task.add(Stage::connector("join", ScriptedConnector::new(&[], calls.clone())));
    task.add(Stage::generator("right", ScriptedGenerator::new(&[10.0])));
    task.init(robot()).unwrap();

    assert!(task.plan(PlanOptions::new()).unwrap());
    let first = result_costs(&task);
    let first_calls = calls.get();

    task.reset().unwrap();
    assert!(task.plan(PlanOptions::new()).unwrap());
    assert_eq!(result_costs(&task), first);
    assert_eq!(calls.get(), first_calls * 2);
}
