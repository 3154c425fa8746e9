//! Global cost-ordered work queue.
//!
//! Every schedulable unit carries the priority of the frontier states that
//! would be consumed. The queue pops the cheapest unit first; ties fall
//! back to insertion order, which keeps runs deterministic.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use stageflow_types::{Priority, StateRef};

use crate::stage::StagePath;

/// One schedulable unit of planning work for a specific stage.
#[derive(Debug, Clone)]
pub(crate) enum Work {
    /// Ask a generator to produce its next spawn batch.
    Generate,
    /// Extend a state forward through a propagator.
    Forward(StateRef),
    /// Extend a state backward through a propagator.
    Backward(StateRef),
    /// Bridge a forward/backward state pair through a connector.
    Pair(StateRef, StateRef),
}

impl Work {
    /// States this unit will consume, for pending-expansion accounting.
    pub(crate) fn states(&self) -> Vec<StateRef> {
        match self {
            Work::Generate => Vec::new(),
            Work::Forward(s) | Work::Backward(s) => vec![s.clone()],
            Work::Pair(a, b) => vec![a.clone(), b.clone()],
        }
    }

    pub(crate) fn priority(&self) -> Priority {
        match self {
            Work::Generate => Priority::new(0.0, 0),
            Work::Forward(s) | Work::Backward(s) => s.priority(),
            Work::Pair(a, b) => Priority::combined(a.priority(), b.priority()),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Pending {
    pub(crate) stage: StagePath,
    pub(crate) work: Work,
}

#[derive(Debug)]
struct Entry {
    key: Reverse<(Priority, u64)>,
    pending: Pending,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

#[derive(Debug, Default)]
pub(crate) struct WorkQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, stage: StagePath, work: Work) {
        let key = Reverse((work.priority(), self.next_seq));
        self.next_seq += 1;
        self.heap.push(Entry {
            key,
            pending: Pending { stage, work },
        });
    }

    pub(crate) fn pop(&mut self) -> Option<Pending> {
        self.heap.pop().map(|e| e.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stageflow_types::{FlowDirection, InterfaceState, SimpleScene};

    fn state(cost: f64, depth: u32) -> StateRef {
        InterfaceState::new(SimpleScene::shared("s"), FlowDirection::Forward, cost, depth)
    }

    #[test]
    fn pops_cheapest_first() {
        let mut queue = WorkQueue::new();
        queue.push(StagePath(vec![0]), Work::Forward(state(5.0, 0)));
        queue.push(StagePath(vec![1]), Work::Forward(state(1.0, 0)));
        queue.push(StagePath(vec![2]), Work::Forward(state(3.0, 0)));

        let order: Vec<usize> = std::iter::from_fn(|| queue.pop())
            .map(|p| p.stage.0[0])
            .collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let mut queue = WorkQueue::new();
        queue.push(StagePath(vec![0]), Work::Forward(state(1.0, 2)));
        queue.push(StagePath(vec![1]), Work::Forward(state(1.0, 2)));
        assert_eq!(queue.pop().unwrap().stage.0, vec![0]);
        assert_eq!(queue.pop().unwrap().stage.0, vec![1]);
    }

    #[test]
    fn depth_breaks_cost_ties() {
        let mut queue = WorkQueue::new();
        queue.push(StagePath(vec![0]), Work::Forward(state(1.0, 4)));
        queue.push(StagePath(vec![1]), Work::Forward(state(1.0, 1)));
        assert_eq!(queue.pop().unwrap().stage.0, vec![1]);
    }

    #[test]
    fn pair_priority_sums_both_sides() {
        let mut queue = WorkQueue::new();
        queue.push(
            StagePath(vec![0]),
            Work::Pair(state(2.0, 0), state(2.0, 0)),
        );
        queue.push(StagePath(vec![1]), Work::Forward(state(3.0, 0)));
        assert_eq!(queue.pop().unwrap().stage.0, vec![1]);
    }

    #[test]
    fn generate_work_outranks_costed_work() {
        let mut queue = WorkQueue::new();
        queue.push(StagePath(vec![0]), Work::Forward(state(0.5, 1)));
        queue.push(StagePath(vec![1]), Work::Generate);
        assert_eq!(queue.pop().unwrap().stage.0, vec![1]);
    }
}
