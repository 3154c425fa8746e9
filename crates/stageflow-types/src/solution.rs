//! Solution fragments and their composition.
//!
//! A solution always connects two interface states. Leaf solutions carry an
//! optional trajectory; containers compose children into sequences or wrap
//! a single child under a rescored cost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::properties::Properties;
use crate::scene::TrajectoryRef;
use crate::state::StateRef;

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub enum SolutionKind {
    /// Atomic motion segment produced by a single stage compute.
    Trajectory {
        trajectory: Option<TrajectoryRef>,
        properties: Properties,
    },
    /// Concatenation of child fragments across a serial container.
    Sequence { children: Vec<SolutionRef> },
    /// A child solution lifted through a container boundary, possibly with
    /// a different cost.
    Wrapped { inner: SolutionRef },
}

#[derive(Debug)]
pub struct Solution {
    seq: u64,
    creator: String,
    cost: f64,
    comment: Option<String>,
    start: StateRef,
    end: StateRef,
    kind: SolutionKind,
}

pub type SolutionRef = Arc<Solution>;

impl Solution {
    pub fn segment(
        creator: impl Into<String>,
        start: StateRef,
        end: StateRef,
        trajectory: Option<TrajectoryRef>,
        cost: f64,
        comment: Option<String>,
    ) -> SolutionRef {
        Self::segment_with(creator, start, end, trajectory, cost, comment, Properties::new())
    }

    pub fn segment_with(
        creator: impl Into<String>,
        start: StateRef,
        end: StateRef,
        trajectory: Option<TrajectoryRef>,
        cost: f64,
        comment: Option<String>,
        properties: Properties,
    ) -> SolutionRef {
        Arc::new(Self {
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            creator: creator.into(),
            cost,
            comment,
            start,
            end,
            kind: SolutionKind::Trajectory {
                trajectory,
                properties,
            },
        })
    }

    /// Compose child fragments into one solution spanning the whole chain.
    /// Children must be non-empty and connected end to start.
    pub fn sequence(
        creator: impl Into<String>,
        children: Vec<SolutionRef>,
        comment: Option<String>,
    ) -> SolutionRef {
        let cost = children.iter().map(|c| c.cost).sum();
        let start = children
            .first()
            .expect("sequence requires at least one child")
            .start
            .clone();
        let end = children
            .last()
            .expect("sequence requires at least one child")
            .end
            .clone();
        Arc::new(Self {
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            creator: creator.into(),
            cost,
            comment,
            start,
            end,
            kind: SolutionKind::Sequence { children },
        })
    }

    pub fn wrapped(
        creator: impl Into<String>,
        inner: SolutionRef,
        cost: f64,
        comment: Option<String>,
    ) -> SolutionRef {
        Arc::new(Self {
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            creator: creator.into(),
            cost,
            comment,
            start: inner.start.clone(),
            end: inner.end.clone(),
            kind: SolutionKind::Wrapped { inner },
        })
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn creator(&self) -> &str {
        &self.creator
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn start(&self) -> &StateRef {
        &self.start
    }

    pub fn end(&self) -> &StateRef {
        &self.end
    }

    pub fn kind(&self) -> &SolutionKind {
        &self.kind
    }

    /// Infinite cost marks a recorded failure, kept for introspection but
    /// never part of a task result.
    pub fn is_failure(&self) -> bool {
        !self.cost.is_finite()
    }

    /// Visit every leaf segment in execution order.
    pub fn for_each_sub_trajectory(&self, f: &mut dyn FnMut(&Solution)) {
        match &self.kind {
            SolutionKind::Trajectory { .. } => f(self),
            SolutionKind::Sequence { children } => {
                for child in children {
                    child.for_each_sub_trajectory(f);
                }
            }
            SolutionKind::Wrapped { inner } => inner.for_each_sub_trajectory(f),
        }
    }
}
