use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::circuit::{CircuitId, Component, ComponentId};

/// Record of one committed edit to a single circuit: which components were
/// removed, which were added, and which additions succeed which removals.
#[derive(Default)]
pub struct ReplacementMap {
    removed: HashSet<ComponentId>,
    added: Vec<Arc<Component>>,
    successors: HashMap<ComponentId, Vec<Arc<Component>>>,
}

/// One committed structural edit, keyed by circuit identity. Delivered once
/// per edit to every interested party, which looks up the circuits on its own
/// path; this replaces per-level listener subscriptions up the hierarchy.
#[derive(Default)]
pub struct EditResult {
    changes: HashMap<CircuitId, ReplacementMap>,
    cleared: HashSet<CircuitId>,
}

impl ReplacementMap {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }

    pub fn record_remove(&mut self, component: &Arc<Component>) {
        self.removed.insert(component.id());
    }

    pub fn record_add(&mut self, component: &Arc<Component>) {
        self.added.push(component.clone());
    }

    pub fn record_replace(&mut self, old: &Arc<Component>, new: &Arc<Component>) {
        self.removed.insert(old.id());
        self.added.push(new.clone());
        self.successors.entry(old.id()).or_default().push(new.clone());
    }

    pub fn removes(&self, id: ComponentId) -> bool {
        self.removed.contains(&id)
    }

    pub fn successors_of(&self, id: ComponentId) -> &[Arc<Component>] {
        self.successors.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn added(&self) -> impl Iterator<Item = &Arc<Component>> {
        self.added.iter()
    }

    /// Additions that do not replace anything: genuinely new components.
    pub fn fresh_additions(&self) -> Vec<Arc<Component>> {
        let succeeded: HashSet<ComponentId> = self
            .successors
            .values()
            .flatten()
            .map(|c| c.id())
            .collect();
        self.added
            .iter()
            .filter(|c| !succeeded.contains(&c.id()))
            .cloned()
            .collect()
    }
}

impl EditResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn change_for(&mut self, circuit: CircuitId) -> &mut ReplacementMap {
        self.changes.entry(circuit).or_default()
    }

    pub fn record_clear(&mut self, circuit: CircuitId) {
        self.cleared.insert(circuit);
    }

    pub fn for_circuit(&self, circuit: CircuitId) -> Option<&ReplacementMap> {
        self.changes.get(&circuit)
    }

    pub fn was_cleared(&self, circuit: CircuitId) -> bool {
        self.cleared.contains(&circuit)
    }

    pub fn is_empty(&self) -> bool {
        self.cleared.is_empty() && self.changes.values().all(ReplacementMap::is_empty)
    }
}
