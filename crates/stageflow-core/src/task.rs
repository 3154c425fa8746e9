//! Task: the stage tree plus the planning loop driving it.
//!
//! Planning is cooperative and single-threaded. The task owns a global
//! cost-ordered queue; each iteration pops the cheapest unit, lets the
//! owning stage compute, folds the results back into the interface graph,
//! and re-checks exhaustion and reachability. The loop stops on success
//! limits, timeout, cancellation, or a drained queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stageflow_types::{
    CostProbe, FlowDirection, InterfaceId, InterfaceState, MergeMode, PlanningContext, ProbeKind,
    Properties, Result, RobotModel, Solution, SolutionRef, StageflowError, StateRef,
};
use tracing::{debug, info};

use crate::interface::{Interface, InterfaceRef};
use crate::scheduler::{Pending, Work, WorkQueue};
use crate::stage::{Bridge, Extension, Spawn, Stage, StageKind, StagePath};
use crate::validation::{build_wiring, resolve_shapes, ConsumerRole, Wiring};

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created but not yet initialized.
    Unknown,
    /// Validated, wired, and seeded; ready to plan.
    Initialized,
    /// Inside a `plan` call.
    Planning,
    /// Stopped early; more work remains in the queue.
    Idle,
    /// The search space is exhausted.
    Done,
}

/// How far a pruning event may travel through the solution graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneScope {
    /// Dead ends propagate across the whole task.
    #[default]
    WholeTask,
    /// Dead ends stop at the boundary of the container that caused them.
    ContainerLocal,
}

/// Stopping criteria for one `plan` call.
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Stop once this many complete solutions exist. Zero means unlimited.
    pub max_solutions: usize,
    pub timeout: Option<Duration>,
}

impl PlanOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_solutions(mut self, count: usize) -> Self {
        self.max_solutions = count;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome report of the most recent `plan` call.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub solutions: usize,
    pub failures: u64,
    pub exhausted: bool,
}

enum Outputs {
    Spawns {
        items: Vec<Spawn>,
        more: bool,
    },
    Extensions {
        from: StateRef,
        direction: FlowDirection,
        items: Vec<Extension>,
    },
    Bridge {
        from: StateRef,
        to: StateRef,
        bridge: Bridge,
        merge_mode: MergeMode,
    },
}

pub struct Task {
    name: String,
    root: Stage,
    context: Option<PlanningContext>,
    state: TaskState,
    prune_scope: PruneScope,
    queue: WorkQueue,
    wiring: Option<Wiring>,
    results: Vec<SolutionRef>,
    cancel: Arc<AtomicBool>,
    summary: Option<PlanSummary>,
}

fn lock_iface(iface: &InterfaceRef) -> MutexGuard<'_, Interface> {
    iface.lock().expect("interface lock poisoned")
}

fn iface_id(iface: &Option<InterfaceRef>) -> Result<InterfaceId> {
    iface
        .as_ref()
        .map(|i| lock_iface(i).id())
        .ok_or_else(|| StageflowError::Other("stage used before wiring".into()))
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            root: Stage::serial(name.clone(), Vec::new()),
            name,
            context: None,
            state: TaskState::Unknown,
            prune_scope: PruneScope::default(),
            queue: WorkQueue::new(),
            wiring: None,
            results: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            summary: None,
        }
    }

    /// Append a stage to the task's top-level sequence. Only valid before
    /// initialization.
    pub fn add(&mut self, stage: Stage) {
        if let StageKind::Serial(children) = &mut self.root.kind {
            children.push(stage);
        }
    }

    pub fn set_prune_scope(&mut self, scope: PruneScope) {
        self.prune_scope = scope;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn results(&self) -> &[SolutionRef] {
        &self.results
    }

    pub fn summary(&self) -> Option<&PlanSummary> {
        self.summary.as_ref()
    }

    pub fn root(&self) -> &Stage {
        &self.root
    }

    pub fn stage(&self, path: &StagePath) -> Option<&Stage> {
        self.root.find(path)
    }

    /// Total failures recorded anywhere in the stage tree.
    pub fn num_failures(&self) -> u64 {
        fn count(stage: &Stage) -> u64 {
            stage.stats.failures + stage.children().iter().map(count).sum::<u64>()
        }
        count(&self.root)
    }

    /// Shared flag checked between compute calls. Setting it stops the
    /// current `plan` call at the next iteration.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Validate the tree, wire interfaces, initialize operators, and seed
    /// generator work.
    pub fn init(&mut self, robot: Arc<dyn RobotModel>) -> Result<()> {
        resolve_shapes(&mut self.root)?;
        let context = PlanningContext::new(robot);
        self.root.init_recursive(&context)?;
        self.context = Some(context);
        self.wiring = Some(build_wiring(&mut self.root)?);
        self.seed();
        self.state = TaskState::Initialized;
        debug!(task = %self.name, "task initialized");
        Ok(())
    }

    /// Throw away all planning state and re-seed, so the next `plan` call
    /// starts from scratch.
    pub fn reset(&mut self) -> Result<()> {
        if self.state == TaskState::Unknown {
            return Err(StageflowError::InvalidTaskState {
                state: format!("{:?}", self.state),
                expected: "initialized".into(),
            });
        }
        self.root.reset_recursive();
        self.queue = WorkQueue::new();
        self.results.clear();
        self.summary = None;
        self.cancel.store(false, Ordering::Relaxed);
        self.wiring = Some(build_wiring(&mut self.root)?);
        self.seed();
        self.state = TaskState::Initialized;
        Ok(())
    }

    fn seed(&mut self) {
        fn collect(stage: &Stage, path: StagePath, out: &mut Vec<StagePath>) {
            match &stage.kind {
                StageKind::Generator(slot) => {
                    if slot.op.can_compute() {
                        out.push(path);
                    }
                }
                StageKind::Serial(children) | StageKind::Parallel(children) => {
                    for (i, child) in children.iter().enumerate() {
                        collect(child, path.child(i), out);
                    }
                }
                _ => {}
            }
        }
        let mut paths = Vec::new();
        collect(&self.root, StagePath::root(), &mut paths);
        for path in paths {
            self.schedule(path, Work::Generate);
        }
    }

    // -----------------------------------------------------------------
    // Planning loop
    // -----------------------------------------------------------------

    /// Run the planning loop until a stopping criterion hits. Returns
    /// whether at least one complete solution exists afterwards.
    pub fn plan(&mut self, options: PlanOptions) -> Result<bool> {
        if !matches!(self.state, TaskState::Initialized | TaskState::Idle) {
            return Err(StageflowError::InvalidTaskState {
                state: format!("{:?}", self.state),
                expected: "initialized or idle".into(),
            });
        }
        self.state = TaskState::Planning;
        let started_at = Utc::now();
        let clock = Instant::now();

        loop {
            if options.max_solutions > 0 && self.results.len() >= options.max_solutions {
                break;
            }
            if self.cancel.load(Ordering::Relaxed) {
                debug!(task = %self.name, "planning cancelled");
                break;
            }
            if let Some(timeout) = options.timeout {
                if clock.elapsed() >= timeout {
                    break;
                }
            }
            let Some(Pending { stage: path, work }) = self.queue.pop() else {
                break;
            };
            if let Some(stage) = self.root.find_mut(&path) {
                stage.pending_work = stage.pending_work.saturating_sub(1);
            }
            let consumed = work.states();
            for state in &consumed {
                state.finish_pending();
            }
            if consumed.iter().any(|s| s.is_pruned()) {
                // The frontier moved on while this unit sat in the queue.
                let scope = path.parent().unwrap_or_else(StagePath::root);
                for state in &consumed {
                    match state.direction() {
                        FlowDirection::Forward => self.reeval_end(state, &scope),
                        FlowDirection::Backward => self.reeval_start(state, &scope),
                    }
                }
                self.settle_exhaustion();
                continue;
            }
            let outputs = self.dispatch(&path, work)?;
            self.process(&path, outputs)?;
            self.settle_exhaustion();
        }

        self.finish(started_at, clock.elapsed());
        Ok(!self.results.is_empty())
    }

    fn finish(&mut self, started_at: DateTime<Utc>, elapsed: Duration) {
        self.results
            .sort_by(|a, b| a.cost().total_cmp(&b.cost()));
        let summary = PlanSummary {
            started_at,
            elapsed,
            solutions: self.results.len(),
            failures: self.num_failures(),
            exhausted: self.root.exhausted,
        };
        self.state = if summary.exhausted {
            TaskState::Done
        } else {
            TaskState::Idle
        };
        info!(
            task = %self.name,
            solutions = summary.solutions,
            failures = summary.failures,
            exhausted = summary.exhausted,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "planning finished"
        );
        self.summary = Some(summary);
    }

    fn schedule(&mut self, path: StagePath, work: Work) {
        for state in work.states() {
            state.add_pending();
        }
        if let Some(stage) = self.root.find_mut(&path) {
            stage.pending_work += 1;
        }
        self.queue.push(path, work);
    }

    fn dispatch(&mut self, path: &StagePath, work: Work) -> Result<Outputs> {
        let stage = self
            .root
            .find_mut(path)
            .ok_or_else(|| StageflowError::Other(format!("no stage at {:?}", path)))?;
        let name = stage.name().to_owned();
        stage.stats.calls += 1;
        match (&mut stage.kind, work) {
            (StageKind::Generator(slot), Work::Generate) => {
                let items = slot.op.compute()?;
                let more = slot.op.can_compute();
                Ok(Outputs::Spawns { items, more })
            }
            (StageKind::Propagator(slot), Work::Forward(state)) => {
                let items = slot.op.compute_forward(&state)?;
                Ok(Outputs::Extensions {
                    from: state,
                    direction: FlowDirection::Forward,
                    items,
                })
            }
            (StageKind::Propagator(slot), Work::Backward(state)) => {
                let items = slot.op.compute_backward(&state)?;
                Ok(Outputs::Extensions {
                    from: state,
                    direction: FlowDirection::Backward,
                    items,
                })
            }
            (StageKind::Connector(slot), Work::Pair(from, to)) => {
                let bridge = slot.op.connect(&from, &to)?;
                Ok(Outputs::Bridge {
                    from,
                    to,
                    bridge,
                    merge_mode: slot.merge_mode,
                })
            }
            _ => Err(StageflowError::Compute {
                stage: name,
                message: "work unit does not match the stage kind".into(),
            }),
        }
    }

    fn process(&mut self, path: &StagePath, outputs: Outputs) -> Result<()> {
        match outputs {
            Outputs::Spawns { items, more } => {
                if more {
                    self.schedule(path.clone(), Work::Generate);
                }
                for spawn in items {
                    self.process_spawn(path, spawn)?;
                }
            }
            Outputs::Extensions {
                from,
                direction,
                items,
            } => {
                let mut finite = 0usize;
                for extension in items {
                    if self.process_extension(path, &from, direction, extension)? {
                        finite += 1;
                    }
                }
                if finite == 0 {
                    let scope = path.parent().unwrap_or_else(StagePath::root);
                    match direction {
                        FlowDirection::Forward => self.reeval_end(&from, &scope),
                        FlowDirection::Backward => self.reeval_start(&from, &scope),
                    }
                }
            }
            Outputs::Bridge {
                from,
                to,
                bridge,
                merge_mode,
            } => {
                self.process_bridge(path, from, to, bridge, merge_mode)?;
            }
        }
        Ok(())
    }

    fn process_spawn(&mut self, path: &StagePath, spawn: Spawn) -> Result<()> {
        let (name, cost, comment, prev_id, next_id) = {
            let stage = self
                .root
                .find(path)
                .ok_or_else(|| StageflowError::Other(format!("no stage at {:?}", path)))?;
            let probe = CostProbe {
                kind: ProbeKind::Trajectory,
                trajectory: None,
                proposed_cost: spawn.cost,
            };
            let estimate = stage.score(&probe);
            let (prev, next) = match &stage.kind {
                StageKind::Generator(slot) => (iface_id(&slot.prev)?, iface_id(&slot.next)?),
                _ => {
                    return Err(StageflowError::Compute {
                        stage: stage.name().to_owned(),
                        message: "spawn from a non-generator stage".into(),
                    })
                }
            };
            (
                stage.name().to_owned(),
                estimate.cost,
                estimate.comment.or_else(|| spawn.comment.clone()),
                prev,
                next,
            )
        };

        let backward = InterfaceState::with_properties(
            spawn.scene.clone(),
            spawn.properties.clone(),
            FlowDirection::Backward,
            cost,
            1,
        );
        let forward = InterfaceState::with_properties(
            spawn.scene,
            spawn.properties.clone(),
            FlowDirection::Forward,
            cost,
            1,
        );
        let fragment = Solution::segment_with(
            name,
            backward.clone(),
            forward.clone(),
            None,
            cost,
            comment,
            spawn.properties,
        );
        if fragment.is_failure() {
            self.record_failure(path, fragment);
            return Ok(());
        }
        let Some(committed) = self.commit(path, fragment)? else {
            return Ok(());
        };
        // The end side goes out first so downstream consumers win FIFO
        // ties against upstream ones at equal cost.
        self.push_state(next_id, forward)?;
        self.push_state(prev_id, backward)?;
        self.try_assemble(&committed);
        Ok(())
    }

    fn process_extension(
        &mut self,
        path: &StagePath,
        from: &StateRef,
        direction: FlowDirection,
        extension: Extension,
    ) -> Result<bool> {
        let (name, cost, comment, out_id) = {
            let stage = self
                .root
                .find(path)
                .ok_or_else(|| StageflowError::Other(format!("no stage at {:?}", path)))?;
            let probe = CostProbe {
                kind: ProbeKind::Trajectory,
                trajectory: extension.trajectory.as_ref(),
                proposed_cost: extension.cost,
            };
            let estimate = stage.score(&probe);
            let out = match (&stage.kind, direction) {
                (StageKind::Propagator(slot), FlowDirection::Forward) => iface_id(&slot.end)?,
                (StageKind::Propagator(slot), FlowDirection::Backward) => iface_id(&slot.start)?,
                _ => {
                    return Err(StageflowError::Compute {
                        stage: stage.name().to_owned(),
                        message: "extension from a non-propagating stage".into(),
                    })
                }
            };
            (
                stage.name().to_owned(),
                estimate.cost,
                estimate.comment.or_else(|| extension.comment.clone()),
                out,
            )
        };

        let from_priority = from.priority();
        let state = InterfaceState::with_properties(
            extension.scene,
            from.properties().clone(),
            direction,
            from_priority.cost + if cost.is_finite() { cost } else { 0.0 },
            from_priority.depth + 1,
        );
        let fragment = match direction {
            FlowDirection::Forward => Solution::segment(
                name,
                from.clone(),
                state.clone(),
                extension.trajectory,
                cost,
                comment,
            ),
            FlowDirection::Backward => Solution::segment(
                name,
                state.clone(),
                from.clone(),
                extension.trajectory,
                cost,
                comment,
            ),
        };
        if fragment.is_failure() {
            self.record_failure(path, fragment);
            return Ok(false);
        }
        let Some(committed) = self.commit(path, fragment)? else {
            return Ok(false);
        };
        self.push_state(out_id, state)?;
        self.try_assemble(&committed);
        Ok(true)
    }

    fn process_bridge(
        &mut self,
        path: &StagePath,
        from: StateRef,
        to: StateRef,
        bridge: Bridge,
        merge_mode: MergeMode,
    ) -> Result<()> {
        let (name, cost, comment) = {
            let stage = self
                .root
                .find(path)
                .ok_or_else(|| StageflowError::Other(format!("no stage at {:?}", path)))?;
            let probe = CostProbe {
                kind: ProbeKind::Trajectory,
                trajectory: bridge.trajectory.as_ref(),
                proposed_cost: bridge.cost,
            };
            let estimate = stage.score(&probe);
            (
                stage.name().to_owned(),
                estimate.cost,
                estimate.comment.or_else(|| bridge.comment.clone()),
            )
        };
        let properties = Properties::merged(from.properties(), to.properties(), merge_mode);
        let fragment = Solution::segment_with(
            name,
            from.clone(),
            to.clone(),
            bridge.trajectory,
            cost,
            comment,
            properties,
        );
        if fragment.is_failure() {
            self.record_failure(path, fragment);
            let scope = path.parent().unwrap_or_else(StagePath::root);
            self.reeval_end(&from, &scope);
            self.reeval_start(&to, &scope);
            return Ok(());
        }
        if let Some(committed) = self.commit(path, fragment)? {
            self.try_assemble(&committed);
        }
        Ok(())
    }

    fn record_failure(&mut self, path: &StagePath, fragment: SolutionRef) {
        if let Some(stage) = self.root.find_mut(path) {
            debug!(
                stage = %stage.name(),
                comment = fragment.comment().unwrap_or(""),
                "recorded failure"
            );
            stage.stats.failures += 1;
            stage.failures.push(fragment);
        }
    }

    /// Record a finite fragment with its creator and lift it through any
    /// parallel ancestors. Returns the solution that ends up registered on
    /// the interface states, or None when an ancestor rescored it into a
    /// failure.
    fn commit(&mut self, path: &StagePath, fragment: SolutionRef) -> Result<Option<SolutionRef>> {
        {
            let stage = self
                .root
                .find_mut(path)
                .ok_or_else(|| StageflowError::Other(format!("no stage at {:?}", path)))?;
            stage.stats.successes += 1;
            stage.solutions.push(fragment.clone());
        }
        let mut current = fragment;
        let mut cursor = path.clone();
        while let Some(parent) = cursor.parent() {
            let wrap = {
                let stage = self
                    .root
                    .find(&parent)
                    .ok_or_else(|| StageflowError::Other(format!("no stage at {:?}", parent)))?;
                if matches!(stage.kind, StageKind::Parallel(_)) {
                    let probe = CostProbe {
                        kind: ProbeKind::Wrapped,
                        trajectory: None,
                        proposed_cost: current.cost(),
                    };
                    let estimate = stage.score(&probe);
                    Some(Solution::wrapped(
                        stage.name(),
                        current.clone(),
                        estimate.cost,
                        estimate.comment,
                    ))
                } else {
                    None
                }
            };
            if let Some(wrapped) = wrap {
                let stage = self
                    .root
                    .find_mut(&parent)
                    .ok_or_else(|| StageflowError::Other(format!("no stage at {:?}", parent)))?;
                if wrapped.is_failure() {
                    stage.stats.failures += 1;
                    stage.failures.push(wrapped);
                    return Ok(None);
                }
                stage.solutions.push(wrapped.clone());
                current = wrapped;
            }
            cursor = parent;
        }
        current.start().register_outgoing(&current);
        current.end().register_incoming(&current);
        Ok(Some(current))
    }

    /// Publish a state at an interface and schedule every consumer that
    /// reads its direction of flow.
    fn push_state(&mut self, id: InterfaceId, state: StateRef) -> Result<()> {
        let consumers = {
            let wiring = self
                .wiring
                .as_ref()
                .ok_or_else(|| StageflowError::Other("task not wired".into()))?;
            if id == wiring.root_start {
                state.mark_start_boundary();
            }
            if id == wiring.root_end {
                state.mark_end_boundary();
            }
            if let Some(iface) = wiring.interface(id) {
                lock_iface(iface).push(state.clone());
            }
            wiring.consumers_of(id).to_vec()
        };
        for consumer in consumers {
            match (consumer.role, state.direction()) {
                (ConsumerRole::PropagateForward, FlowDirection::Forward) => {
                    self.schedule(consumer.path, Work::Forward(state.clone()));
                }
                (ConsumerRole::PropagateBackward, FlowDirection::Backward) => {
                    self.schedule(consumer.path, Work::Backward(state.clone()));
                }
                (ConsumerRole::ConnectStart, FlowDirection::Forward) => {
                    let partners = {
                        let stage = self.root.find_mut(&consumer.path);
                        match stage.map(|s| &mut s.kind) {
                            Some(StageKind::Connector(slot)) => {
                                slot.seen_forward.push(state.clone());
                                slot.seen_backward
                                    .iter()
                                    .filter(|b| !b.is_pruned() && slot.op.compatible(&state, *b))
                                    .cloned()
                                    .collect::<Vec<StateRef>>()
                            }
                            _ => Vec::new(),
                        }
                    };
                    for partner in partners {
                        self.schedule(
                            consumer.path.clone(),
                            Work::Pair(state.clone(), partner),
                        );
                    }
                }
                (ConsumerRole::ConnectEnd, FlowDirection::Backward) => {
                    let partners = {
                        let stage = self.root.find_mut(&consumer.path);
                        match stage.map(|s| &mut s.kind) {
                            Some(StageKind::Connector(slot)) => {
                                slot.seen_backward.push(state.clone());
                                slot.seen_forward
                                    .iter()
                                    .filter(|f| !f.is_pruned() && slot.op.compatible(*f, &state))
                                    .cloned()
                                    .collect::<Vec<_>>()
                            }
                            _ => Vec::new(),
                        }
                    };
                    for partner in partners {
                        self.schedule(
                            consumer.path.clone(),
                            Work::Pair(partner, state.clone()),
                        );
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Chain assembly
    // -----------------------------------------------------------------

    /// Check whether the new fragment closes any start-to-end chain and,
    /// if so, record the complete solutions.
    fn try_assemble(&mut self, solution: &SolutionRef) {
        let prefixes = chain_prefixes(solution.start());
        if prefixes.is_empty() {
            return;
        }
        let suffixes = chain_suffixes(solution.end());
        for prefix in &prefixes {
            for suffix in &suffixes {
                let mut chain = prefix.clone();
                chain.push(solution.clone());
                chain.extend(suffix.iter().cloned());
                let full = Solution::sequence(self.name.clone(), chain, None);
                let probe = CostProbe {
                    kind: ProbeKind::Sequence,
                    trajectory: None,
                    proposed_cost: full.cost(),
                };
                let estimate = self.root.score(&probe);
                let complete = if estimate.cost.total_cmp(&full.cost()) == std::cmp::Ordering::Equal
                {
                    full
                } else {
                    Solution::wrapped(self.name.clone(), full, estimate.cost, estimate.comment)
                };
                if complete.is_failure() {
                    self.root.stats.failures += 1;
                    self.root.failures.push(complete);
                } else {
                    debug!(task = %self.name, cost = complete.cost(), "complete solution");
                    self.results.push(complete);
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Pruning
    // -----------------------------------------------------------------

    fn scope_allows(&self, scope: &StagePath, state: &StateRef) -> bool {
        match self.prune_scope {
            PruneScope::WholeTask => true,
            PruneScope::ContainerLocal => {
                let Some(wiring) = self.wiring.as_ref() else {
                    return false;
                };
                state
                    .owner()
                    .and_then(|id| wiring.scope_of(id))
                    .map_or(false, |owning| scope.is_prefix_of(owning))
            }
        }
    }

    /// Can new solution fragments still grow out of this state's end side?
    fn connect_growth_end(&self, state: &StateRef) -> bool {
        let (Some(owner), Some(wiring)) = (state.owner(), self.wiring.as_ref()) else {
            return false;
        };
        wiring.consumers_of(owner).iter().any(|c| {
            c.role == ConsumerRole::ConnectStart
                && self.root.find(&c.path).map_or(false, |s| match &s.kind {
                    StageKind::Connector(slot) => slot
                        .end
                        .as_ref()
                        .map_or(false, |i| !lock_iface(i).is_closed()),
                    _ => false,
                })
        })
    }

    fn connect_growth_start(&self, state: &StateRef) -> bool {
        let (Some(owner), Some(wiring)) = (state.owner(), self.wiring.as_ref()) else {
            return false;
        };
        wiring.consumers_of(owner).iter().any(|c| {
            c.role == ConsumerRole::ConnectEnd
                && self.root.find(&c.path).map_or(false, |s| match &s.kind {
                    StageKind::Connector(slot) => slot
                        .start
                        .as_ref()
                        .map_or(false, |i| !lock_iface(i).is_closed()),
                    _ => false,
                })
        })
    }

    /// Re-check whether the task end boundary is still reachable from this
    /// state, and propagate the verdict upstream through existing fragments.
    fn reeval_end(&self, state: &StateRef, scope: &StagePath) {
        if state.at_end_boundary() || state.end_unreachable() {
            return;
        }
        let growing = match state.direction() {
            FlowDirection::Forward => state.pending() > 0 || self.connect_growth_end(state),
            FlowDirection::Backward => false,
        };
        if growing {
            return;
        }
        let alive = state
            .outgoing()
            .iter()
            .any(|f| !f.is_failure() && !f.end().end_unreachable());
        if alive {
            return;
        }
        if state.mark_end_unreachable() {
            debug!(state = %state.id(), "end boundary unreachable");
            for fragment in state.incoming() {
                let upstream = fragment.start();
                if self.scope_allows(scope, upstream) {
                    self.reeval_end(upstream, scope);
                }
            }
        }
    }

    /// Mirror of `reeval_end` for the start boundary, propagating
    /// downstream.
    fn reeval_start(&self, state: &StateRef, scope: &StagePath) {
        if state.at_start_boundary() || state.start_unreachable() {
            return;
        }
        let growing = match state.direction() {
            FlowDirection::Backward => state.pending() > 0 || self.connect_growth_start(state),
            FlowDirection::Forward => false,
        };
        if growing {
            return;
        }
        let alive = state
            .incoming()
            .iter()
            .any(|f| !f.is_failure() && !f.start().start_unreachable());
        if alive {
            return;
        }
        if state.mark_start_unreachable() {
            debug!(state = %state.id(), "start boundary unreachable");
            for fragment in state.outgoing() {
                let downstream = fragment.end();
                if self.scope_allows(scope, downstream) {
                    self.reeval_start(downstream, scope);
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Exhaustion
    // -----------------------------------------------------------------

    /// Fixpoint over stage exhaustion and interface closure. Interface
    /// closure in turn strips connector partners of future growth, which
    /// feeds back into pruning.
    fn settle_exhaustion(&mut self) {
        loop {
            let mut changed = false;

            let mut paths = Vec::new();
            collect_paths(&self.root, StagePath::root(), &mut paths);
            for path in &paths {
                let Some(stage) = self.root.find_mut(path) else {
                    continue;
                };
                if stage.exhausted {
                    continue;
                }
                let done = match &stage.kind {
                    StageKind::Generator(slot) => {
                        !slot.op.can_compute() && stage.pending_work == 0
                    }
                    StageKind::Propagator(slot) => {
                        let start_closed = slot
                            .start
                            .as_ref()
                            .map_or(false, |i| lock_iface(i).is_closed());
                        let end_closed = slot
                            .end
                            .as_ref()
                            .map_or(false, |i| lock_iface(i).is_closed());
                        let inputs_closed = (!slot.forward_enabled || start_closed)
                            && (!slot.backward_enabled || end_closed);
                        inputs_closed && stage.pending_work == 0
                    }
                    StageKind::Connector(slot) => {
                        let start_closed = slot
                            .start
                            .as_ref()
                            .map_or(false, |i| lock_iface(i).is_closed());
                        let end_closed = slot
                            .end
                            .as_ref()
                            .map_or(false, |i| lock_iface(i).is_closed());
                        start_closed && end_closed && stage.pending_work == 0
                    }
                    StageKind::Serial(children) | StageKind::Parallel(children) => {
                        !children.is_empty() && children.iter().all(|c| c.exhausted)
                    }
                };
                if done {
                    debug!(stage = %stage.name(), "stage exhausted");
                    stage.exhausted = true;
                    changed = true;
                }
            }

            let mut newly_closed = Vec::new();
            {
                let Some(wiring) = self.wiring.as_ref() else {
                    return;
                };
                for (&id, iface) in wiring.interfaces.iter() {
                    if lock_iface(iface).is_closed() {
                        continue;
                    }
                    let writers = wiring.writers_of(id);
                    if writers.is_empty() {
                        continue;
                    }
                    let all_done = writers
                        .iter()
                        .all(|p| self.root.find(p).map_or(false, |s| s.exhausted));
                    if all_done && lock_iface(iface).close() {
                        newly_closed.push(id);
                    }
                }
            }
            for id in newly_closed {
                changed = true;
                self.on_interface_closed(id);
            }

            if !changed {
                break;
            }
        }
    }

    /// No more states will ever arrive at `id`. Connector partners waiting
    /// on that side lose their remaining growth potential.
    fn on_interface_closed(&mut self, id: InterfaceId) {
        debug!(interface = id.0, "interface closed");
        let consumers = {
            let Some(wiring) = self.wiring.as_ref() else {
                return;
            };
            wiring.consumers_of(id).to_vec()
        };
        let mut checks: Vec<(StateRef, FlowDirection, StagePath)> = Vec::new();
        for consumer in consumers {
            let scope = consumer.path.parent().unwrap_or_else(StagePath::root);
            if let Some(stage) = self.root.find(&consumer.path) {
                if let StageKind::Connector(slot) = &stage.kind {
                    match consumer.role {
                        ConsumerRole::ConnectStart => {
                            for partner in &slot.seen_backward {
                                checks.push((partner.clone(), FlowDirection::Backward, scope.clone()));
                            }
                        }
                        ConsumerRole::ConnectEnd => {
                            for partner in &slot.seen_forward {
                                checks.push((partner.clone(), FlowDirection::Forward, scope.clone()));
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        for (state, direction, scope) in checks {
            match direction {
                FlowDirection::Forward => self.reeval_end(&state, &scope),
                FlowDirection::Backward => self.reeval_start(&state, &scope),
            }
        }
    }
}

fn collect_paths(stage: &Stage, path: StagePath, out: &mut Vec<StagePath>) {
    for (i, child) in stage.children().iter().enumerate() {
        collect_paths(child, path.child(i), out);
    }
    out.push(path);
}

/// All fragment chains connecting the task start boundary to `state`, in
/// execution order. Empty when no such chain exists yet.
fn chain_prefixes(state: &StateRef) -> Vec<Vec<SolutionRef>> {
    if state.at_start_boundary() {
        return vec![Vec::new()];
    }
    let mut out = Vec::new();
    for fragment in state.incoming() {
        if fragment.is_failure() {
            continue;
        }
        for mut prefix in chain_prefixes(fragment.start()) {
            prefix.push(fragment.clone());
            out.push(prefix);
        }
    }
    out
}

fn chain_suffixes(state: &StateRef) -> Vec<Vec<SolutionRef>> {
    if state.at_end_boundary() {
        return vec![Vec::new()];
    }
    let mut out = Vec::new();
    for fragment in state.outgoing() {
        if fragment.is_failure() {
            continue;
        }
        for suffix in chain_suffixes(fragment.end()) {
            let mut chain = vec![fragment.clone()];
            chain.extend(suffix);
            out.push(chain);
        }
    }
    out
}
