//! Static analysis of the stage tree: direction resolution, boundary
//! checks, and interface wiring.
//!
//! Runs once at task initialization. Catches every structural mistake
//! before any compute call happens, so the scheduler never has to deal
//! with a half-wired graph.

use std::collections::HashMap;

use stageflow_types::{InterfaceId, Result, StageflowError};

use crate::interface::{Interface, InterfaceRef};
use crate::stage::{PropagationDirection, Stage, StageKind, StagePath};

/// Which boundaries a stage reads from and writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterfaceShape {
    pub reads_start: bool,
    pub writes_start: bool,
    pub reads_end: bool,
    pub writes_end: bool,
}

/// Compute the boundary shape of a stage. Fails on unresolved `EitherWay`
/// propagators and on malformed containers.
pub fn shape_of(stage: &Stage) -> Result<InterfaceShape> {
    match &stage.kind {
        StageKind::Generator(_) => Ok(InterfaceShape {
            writes_start: true,
            writes_end: true,
            ..InterfaceShape::default()
        }),
        StageKind::Propagator(slot) => {
            if slot.direction == PropagationDirection::EitherWay {
                return Err(StageflowError::Validation(format!(
                    "stage '{}': propagation direction could not be resolved",
                    stage.name()
                )));
            }
            Ok(InterfaceShape {
                reads_start: slot.forward_enabled,
                writes_end: slot.forward_enabled,
                reads_end: slot.backward_enabled,
                writes_start: slot.backward_enabled,
            })
        }
        StageKind::Connector(_) => Ok(InterfaceShape {
            reads_start: true,
            reads_end: true,
            ..InterfaceShape::default()
        }),
        StageKind::Serial(children) => {
            let first = children.first().ok_or_else(|| {
                StageflowError::Validation(format!("container '{}' is empty", stage.name()))
            })?;
            let last = children.last().ok_or_else(|| {
                StageflowError::Validation(format!("container '{}' is empty", stage.name()))
            })?;
            let first_shape = shape_of(first)?;
            let last_shape = shape_of(last)?;
            Ok(InterfaceShape {
                reads_start: first_shape.reads_start,
                writes_start: first_shape.writes_start,
                reads_end: last_shape.reads_end,
                writes_end: last_shape.writes_end,
            })
        }
        StageKind::Parallel(children) => {
            let first = children.first().ok_or_else(|| {
                StageflowError::Validation(format!("container '{}' is empty", stage.name()))
            })?;
            let reference = shape_of(first)?;
            for child in &children[1..] {
                if shape_of(child)? != reference {
                    return Err(StageflowError::Validation(format!(
                        "parallel container '{}': child '{}' differs in boundary shape",
                        stage.name(),
                        child.name()
                    )));
                }
            }
            Ok(reference)
        }
    }
}

/// Resolve `EitherWay` propagators from their siblings and verify every
/// boundary of every container.
pub fn resolve_shapes(root: &mut Stage) -> Result<()> {
    resolve_stage(root)?;

    // The task's outer boundaries have no environment: writers there define
    // the task endpoints, readers would wait forever.
    let shape = shape_of(root)?;
    if shape.reads_start || !shape.writes_start {
        return Err(StageflowError::Validation(
            "task start boundary must be written by the first stage and read by nothing".into(),
        ));
    }
    if shape.reads_end || !shape.writes_end {
        return Err(StageflowError::Validation(
            "task end boundary must be written by the last stage and read by nothing".into(),
        ));
    }
    Ok(())
}

fn resolve_stage(stage: &mut Stage) -> Result<()> {
    let name = stage.name().to_owned();
    match &mut stage.kind {
        StageKind::Serial(children) => {
            for child in children.iter_mut() {
                resolve_stage(child)?;
            }
            resolve_either_way(children)?;
            check_serial_boundaries(&name, children)?;
            Ok(())
        }
        StageKind::Parallel(children) => {
            for child in children.iter_mut() {
                resolve_stage(child)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Fixpoint pass over the children of a serial container. A child declared
/// `EitherWay` adopts the direction its neighbors imply.
fn resolve_either_way(children: &mut [Stage]) -> Result<()> {
    loop {
        let mut progressed = false;
        for i in 0..children.len() {
            let unresolved = matches!(
                &children[i].kind,
                StageKind::Propagator(slot) if slot.direction == PropagationDirection::EitherWay
            );
            if !unresolved {
                continue;
            }
            let left = i
                .checked_sub(1)
                .and_then(|j| shape_of(&children[j]).ok());
            let right = children.get(i + 1).and_then(|c| shape_of(c).ok());

            let resolved = if left.map_or(false, |s| s.writes_end)
                || right.map_or(false, |s| s.reads_start)
            {
                Some(PropagationDirection::Forward)
            } else if right.map_or(false, |s| s.writes_start)
                || left.map_or(false, |s| s.reads_end)
            {
                Some(PropagationDirection::Backward)
            } else {
                None
            };

            if let Some(direction) = resolved {
                if let StageKind::Propagator(slot) = &mut children[i].kind {
                    slot.direction = direction;
                    slot.forward_enabled = direction == PropagationDirection::Forward;
                    slot.backward_enabled = direction == PropagationDirection::Backward;
                }
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    for child in children.iter() {
        if let StageKind::Propagator(slot) = &child.kind {
            if slot.direction == PropagationDirection::EitherWay {
                return Err(StageflowError::Validation(format!(
                    "stage '{}': neither neighbor determines a propagation direction",
                    child.name()
                )));
            }
        }
    }
    Ok(())
}

/// Every internal boundary needs exactly one writer and at least one
/// reader, otherwise states pile up unread or a reader starves.
fn check_serial_boundaries(container: &str, children: &[Stage]) -> Result<()> {
    for i in 1..children.len() {
        let left = shape_of(&children[i - 1])?;
        let right = shape_of(&children[i])?;
        let writers = usize::from(left.writes_end) + usize::from(right.writes_start);
        let readers = usize::from(left.reads_end) + usize::from(right.reads_start);
        if writers != 1 {
            return Err(StageflowError::Validation(format!(
                "container '{}': boundary between '{}' and '{}' has {} writers, expected 1",
                container,
                children[i - 1].name(),
                children[i].name(),
                writers
            )));
        }
        if readers == 0 {
            return Err(StageflowError::Validation(format!(
                "container '{}': boundary between '{}' and '{}' has no reader",
                container,
                children[i - 1].name(),
                children[i].name()
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// How a stage consumes states arriving at an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConsumerRole {
    PropagateForward,
    PropagateBackward,
    ConnectStart,
    ConnectEnd,
}

#[derive(Debug, Clone)]
pub(crate) struct Consumer {
    pub(crate) path: StagePath,
    pub(crate) role: ConsumerRole,
}

/// The wired graph: interfaces, who writes them, who reads them, and which
/// container owns each boundary.
#[derive(Debug, Default)]
pub(crate) struct Wiring {
    pub(crate) interfaces: HashMap<InterfaceId, InterfaceRef>,
    pub(crate) consumers: HashMap<InterfaceId, Vec<Consumer>>,
    pub(crate) writers: HashMap<InterfaceId, Vec<StagePath>>,
    pub(crate) scope: HashMap<InterfaceId, StagePath>,
    pub(crate) root_start: InterfaceId,
    pub(crate) root_end: InterfaceId,
}

impl Wiring {
    pub(crate) fn interface(&self, id: InterfaceId) -> Option<&InterfaceRef> {
        self.interfaces.get(&id)
    }

    pub(crate) fn consumers_of(&self, id: InterfaceId) -> &[Consumer] {
        self.consumers.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn writers_of(&self, id: InterfaceId) -> &[StagePath] {
        self.writers.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Path of the container that owns the boundary.
    pub(crate) fn scope_of(&self, id: InterfaceId) -> Option<&StagePath> {
        self.scope.get(&id)
    }
}

struct Wirer {
    wiring: Wiring,
    next_id: u32,
}

impl Wirer {
    fn fresh(&mut self, scope: StagePath) -> InterfaceId {
        let id = InterfaceId(self.next_id);
        self.next_id += 1;
        self.wiring.interfaces.insert(id, Interface::shared(id));
        self.wiring.scope.insert(id, scope);
        id
    }

    fn wire(&mut self, stage: &mut Stage, path: StagePath, left: InterfaceId, right: InterfaceId) {
        match &mut stage.kind {
            StageKind::Generator(slot) => {
                slot.prev = self.wiring.interfaces.get(&left).cloned();
                slot.next = self.wiring.interfaces.get(&right).cloned();
                self.wiring.writers.entry(left).or_default().push(path.clone());
                self.wiring.writers.entry(right).or_default().push(path);
            }
            StageKind::Propagator(slot) => {
                slot.start = self.wiring.interfaces.get(&left).cloned();
                slot.end = self.wiring.interfaces.get(&right).cloned();
                if slot.forward_enabled {
                    self.wiring.consumers.entry(left).or_default().push(Consumer {
                        path: path.clone(),
                        role: ConsumerRole::PropagateForward,
                    });
                    self.wiring.writers.entry(right).or_default().push(path.clone());
                }
                if slot.backward_enabled {
                    self.wiring.consumers.entry(right).or_default().push(Consumer {
                        path: path.clone(),
                        role: ConsumerRole::PropagateBackward,
                    });
                    self.wiring.writers.entry(left).or_default().push(path);
                }
            }
            StageKind::Connector(slot) => {
                slot.start = self.wiring.interfaces.get(&left).cloned();
                slot.end = self.wiring.interfaces.get(&right).cloned();
                self.wiring.consumers.entry(left).or_default().push(Consumer {
                    path: path.clone(),
                    role: ConsumerRole::ConnectStart,
                });
                self.wiring.consumers.entry(right).or_default().push(Consumer {
                    path,
                    role: ConsumerRole::ConnectEnd,
                });
            }
            StageKind::Serial(children) => {
                let count = children.len();
                let mut boundaries = Vec::with_capacity(count + 1);
                boundaries.push(left);
                for _ in 1..count {
                    boundaries.push(self.fresh(path.clone()));
                }
                boundaries.push(right);
                for (i, child) in children.iter_mut().enumerate() {
                    self.wire(child, path.child(i), boundaries[i], boundaries[i + 1]);
                }
            }
            StageKind::Parallel(children) => {
                for (i, child) in children.iter_mut().enumerate() {
                    self.wire(child, path.child(i), left, right);
                }
            }
        }
    }
}

/// Attach interfaces to an already-resolved stage tree.
pub(crate) fn build_wiring(root: &mut Stage) -> Result<Wiring> {
    let mut wirer = Wirer {
        wiring: Wiring::default(),
        next_id: 0,
    };
    let root_path = StagePath::root();
    let root_start = wirer.fresh(root_path.clone());
    let root_end = wirer.fresh(root_path.clone());
    wirer.wire(root, root_path, root_start, root_end);
    wirer.wiring.root_start = root_start;
    wirer.wiring.root_end = root_end;
    Ok(wirer.wiring)
}
