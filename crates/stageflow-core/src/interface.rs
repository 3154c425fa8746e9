//! Ordered state lists at stage boundaries.

use std::sync::{Arc, Mutex};

use stageflow_types::{InterfaceId, StateRef};

/// One boundary between adjacent stages. Holds the states published there,
/// kept sorted by priority so consumers always see the cheapest work first.
#[derive(Debug)]
pub struct Interface {
    id: InterfaceId,
    states: Vec<StateRef>,
    closed: bool,
}

pub type InterfaceRef = Arc<Mutex<Interface>>;

impl Interface {
    pub fn shared(id: InterfaceId) -> InterfaceRef {
        Arc::new(Mutex::new(Self {
            id,
            states: Vec::new(),
            closed: false,
        }))
    }

    pub fn id(&self) -> InterfaceId {
        self.id
    }

    /// Insert a state, preserving ascending priority order. Equal
    /// priorities keep arrival order.
    pub fn push(&mut self, state: StateRef) {
        state.set_owner(self.id);
        let priority = state.priority();
        let idx = self
            .states
            .partition_point(|existing| existing.priority() <= priority);
        self.states.insert(idx, state);
    }

    pub fn states(&self) -> &[StateRef] {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// No further states will ever arrive here. Returns true when the
    /// interface was open before the call.
    pub fn close(&mut self) -> bool {
        let newly = !self.closed;
        self.closed = true;
        newly
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
