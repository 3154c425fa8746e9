//! Interface states: the planning frontier shared between adjacent stages.

use std::cmp::Ordering;
use std::sync::{Mutex, MutexGuard, Weak};

use uuid::Uuid;

use crate::properties::Properties;
use crate::scene::SceneRef;
use crate::solution::{Solution, SolutionRef};

/// Identifies one interface (boundary slot) in the wired stage graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct InterfaceId(pub u32);

/// Which way a state travels through the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    /// Created at a stage's end boundary, consumed by downstream stages.
    Forward,
    /// Created at a stage's start boundary, consumed by upstream stages.
    Backward,
}

/// Scheduling key. Lower accumulated cost first, then lower depth.
#[derive(Debug, Clone, Copy)]
pub struct Priority {
    pub cost: f64,
    pub depth: u32,
}

impl Priority {
    pub fn new(cost: f64, depth: u32) -> Self {
        Self { cost, depth }
    }

    /// Priority of pairing two frontier states: components add.
    pub fn combined(a: Priority, b: Priority) -> Priority {
        Priority {
            cost: a.cost + b.cost,
            depth: a.depth + b.depth,
        }
    }
}

impl PartialEq for Priority {
    fn eq(&self, other: &Self) -> bool {
        self.cost.total_cmp(&other.cost) == Ordering::Equal && self.depth == other.depth
    }
}

impl Eq for Priority {}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cost
            .total_cmp(&other.cost)
            .then(self.depth.cmp(&other.depth))
    }
}

#[derive(Debug, Default)]
struct StateFlags {
    cost: f64,
    depth: u32,
    owner: Option<InterfaceId>,
    at_start_boundary: bool,
    at_end_boundary: bool,
    start_unreachable: bool,
    end_unreachable: bool,
    pending_expansions: u32,
}

/// One point on the planning frontier: a scene plus bookkeeping about how
/// it connects to already-found solution fragments.
#[derive(Debug)]
pub struct InterfaceState {
    id: Uuid,
    scene: SceneRef,
    properties: Properties,
    direction: FlowDirection,
    flags: Mutex<StateFlags>,
    incoming: Mutex<Vec<Weak<Solution>>>,
    outgoing: Mutex<Vec<Weak<Solution>>>,
}

pub type StateRef = std::sync::Arc<InterfaceState>;

impl InterfaceState {
    pub fn new(scene: SceneRef, direction: FlowDirection, cost: f64, depth: u32) -> StateRef {
        Self::with_properties(scene, Properties::new(), direction, cost, depth)
    }

    pub fn with_properties(
        scene: SceneRef,
        properties: Properties,
        direction: FlowDirection,
        cost: f64,
        depth: u32,
    ) -> StateRef {
        std::sync::Arc::new(Self {
            id: Uuid::new_v4(),
            scene,
            properties,
            direction,
            flags: Mutex::new(StateFlags {
                cost,
                depth,
                ..StateFlags::default()
            }),
            incoming: Mutex::new(Vec::new()),
            outgoing: Mutex::new(Vec::new()),
        })
    }

    fn flags(&self) -> MutexGuard<'_, StateFlags> {
        self.flags.lock().expect("state lock poisoned")
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn scene(&self) -> &SceneRef {
        &self.scene
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn direction(&self) -> FlowDirection {
        self.direction
    }

    pub fn priority(&self) -> Priority {
        let flags = self.flags();
        Priority::new(flags.cost, flags.depth)
    }

    pub fn owner(&self) -> Option<InterfaceId> {
        self.flags().owner
    }

    pub fn set_owner(&self, owner: InterfaceId) {
        self.flags().owner = Some(owner);
    }

    // -----------------------------------------------------------------
    // Boundary markers
    // -----------------------------------------------------------------

    pub fn mark_start_boundary(&self) {
        self.flags().at_start_boundary = true;
    }

    pub fn mark_end_boundary(&self) {
        self.flags().at_end_boundary = true;
    }

    pub fn at_start_boundary(&self) -> bool {
        self.flags().at_start_boundary
    }

    pub fn at_end_boundary(&self) -> bool {
        self.flags().at_end_boundary
    }

    // -----------------------------------------------------------------
    // Reachability
    // -----------------------------------------------------------------

    /// A state is pruned when either side can no longer reach a task
    /// boundary; it then contributes to no complete solution.
    pub fn is_pruned(&self) -> bool {
        let flags = self.flags();
        flags.start_unreachable || flags.end_unreachable
    }

    pub fn start_unreachable(&self) -> bool {
        self.flags().start_unreachable
    }

    pub fn end_unreachable(&self) -> bool {
        self.flags().end_unreachable
    }

    /// Returns true when the flag was newly set. Monotone: never cleared.
    pub fn mark_start_unreachable(&self) -> bool {
        let mut flags = self.flags();
        let newly = !flags.start_unreachable;
        flags.start_unreachable = true;
        newly
    }

    pub fn mark_end_unreachable(&self) -> bool {
        let mut flags = self.flags();
        let newly = !flags.end_unreachable;
        flags.end_unreachable = true;
        newly
    }

    // -----------------------------------------------------------------
    // Pending expansion accounting
    // -----------------------------------------------------------------

    pub fn add_pending(&self) {
        self.flags().pending_expansions += 1;
    }

    pub fn finish_pending(&self) {
        let mut flags = self.flags();
        flags.pending_expansions = flags.pending_expansions.saturating_sub(1);
    }

    pub fn pending(&self) -> u32 {
        self.flags().pending_expansions
    }

    // -----------------------------------------------------------------
    // Solution fragment registry
    // -----------------------------------------------------------------

    pub fn register_incoming(&self, solution: &SolutionRef) {
        self.incoming
            .lock()
            .expect("state lock poisoned")
            .push(std::sync::Arc::downgrade(solution));
    }

    pub fn register_outgoing(&self, solution: &SolutionRef) {
        self.outgoing
            .lock()
            .expect("state lock poisoned")
            .push(std::sync::Arc::downgrade(solution));
    }

    /// Fragments ending at this state.
    pub fn incoming(&self) -> Vec<SolutionRef> {
        self.incoming
            .lock()
            .expect("state lock poisoned")
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Fragments starting at this state.
    pub fn outgoing(&self) -> Vec<SolutionRef> {
        self.outgoing
            .lock()
            .expect("state lock poisoned")
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}
