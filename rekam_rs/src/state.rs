use std::sync::Arc;

use bitvec::vec::BitVec;

use crate::circuit::{Component, ComponentId};
use crate::error::{Error, RekamResult};

/// The narrow contract the trace engine consumes from the simulation
/// collaborator: a queryable current value per loggable component, and
/// descent into the nested state behind a subcircuit component.
pub trait SimAccess: Send + Sync {
    /// Current value of a loggable component in this state. `None` when the
    /// component cannot supply a value for the given sub-option.
    fn fetch(&self, component: ComponentId, option: Option<&str>) -> Option<BitVec<u32>>;

    /// The nested state owned by a subcircuit component.
    fn substate(&self, component: ComponentId) -> Option<&dyn SimAccess>;
}

/// Walks `path` down through nested substates and fetches the leaf value.
/// A host inconsistency (mid-path component that is no subcircuit, missing
/// substate) is an error; a leaf without the loggable capability or without a
/// value for the option is `Ok(None)`.
pub fn resolve_path(
    root: &dyn SimAccess,
    path: &[Arc<Component>],
    option: Option<&str>,
) -> RekamResult<Option<BitVec<u32>>> {
    let (leaf, stem) = path.split_last().ok_or(Error::EmptyPath)?;
    let mut state = root;
    for step in stem {
        if step.subcircuit().is_none() {
            return Err(Error::NotASubcircuit(step.display_name(None)));
        }
        state = state
            .substate(step.id())
            .ok_or_else(|| Error::MissingSubstate(step.display_name(None)))?;
    }
    if leaf.capability().is_none() {
        return Ok(None);
    }
    Ok(state.fetch(leaf.id(), option))
}
