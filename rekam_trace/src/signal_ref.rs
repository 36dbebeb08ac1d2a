use std::sync::{Arc, RwLock};

use bitvec::vec::BitVec;

use rekam_rs::circuit::{Circuit, CircuitId, ClockSpec, Component, Location};
use rekam_rs::edit::EditResult;
use rekam_rs::error::Error as RekamError;
use rekam_rs::radix::{self, Radix};
use rekam_rs::state::{self, SimAccess};

use crate::error::{RekamTraceError, RekamTraceResult};

// A SignalRef identifies one observable point within a top-level circuit or
// one of the subcircuits nested below it. `path` leads from the top circuit
// to the observed component; `circs` holds, in parallel, the circuit that
// contains each path element (so circs[0] is the top-level circuit and
// circs[i] is the circuit behind the subcircuit component path[i-1]).
//
// Identity is the id sequence of the path plus the sub-option selector. The
// path can be re-pointed at same-factory successor components when the host
// commits an edit; anything else retires the reference for good.
pub struct SignalRef {
    option: Option<String>,
    inner: RwLock<Inner>,
}

struct Inner {
    path: Vec<Arc<Component>>,
    circs: Vec<Arc<Circuit>>,
    short_name: String,
    full_name: String,
    width: usize,
    radix: Radix,
    obsolete: bool,
}

/// What one committed edit did to a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefChange {
    Unchanged,
    Renamed,
    Obsoleted,
}

impl SignalRef {
    pub fn new(
        root: &Arc<Circuit>,
        path: Vec<Arc<Component>>,
        option: Option<String>,
    ) -> RekamTraceResult<Arc<Self>> {
        if path.is_empty() {
            return Err(RekamError::EmptyPath.into());
        }
        let mut circs = Vec::with_capacity(path.len());
        circs.push(root.clone());
        for step in &path[..path.len() - 1] {
            let sub = step
                .subcircuit()
                .ok_or_else(|| RekamError::NotASubcircuit(step.display_name(None)))?;
            circs.push(sub.clone());
        }
        let mut inner = Inner {
            path,
            circs,
            short_name: String::new(),
            full_name: String::new(),
            width: 0,
            radix: Radix::default(),
            obsolete: false,
        };
        compute_name(&mut inner, option.as_deref());
        Ok(Arc::new(Self {
            option,
            inner: RwLock::new(inner),
        }))
    }

    pub fn top_level(
        root: &Arc<Circuit>,
        component: &Arc<Component>,
        option: Option<String>,
    ) -> RekamTraceResult<Arc<Self>> {
        Self::new(root, vec![component.clone()], option)
    }

    pub fn option(&self) -> Option<&str> {
        self.option.as_deref()
    }

    pub fn display_name(&self) -> String {
        self.inner.read().unwrap().full_name.clone()
    }

    pub fn short_name(&self) -> String {
        self.inner.read().unwrap().short_name.clone()
    }

    pub fn width(&self) -> usize {
        self.inner.read().unwrap().width
    }

    pub fn depth(&self) -> usize {
        self.inner.read().unwrap().path.len()
    }

    pub fn top_circuit(&self) -> CircuitId {
        self.inner.read().unwrap().circs[0].id()
    }

    pub fn location(&self) -> Location {
        self.leaf().location()
    }

    pub fn is_input(&self) -> bool {
        self.leaf().capability().map(|cap| cap.input).unwrap_or(false)
    }

    pub fn is_clock(&self) -> bool {
        self.leaf().is_clock()
    }

    pub fn clock_spec(&self) -> Option<ClockSpec> {
        self.leaf().capability().and_then(|cap| cap.clock)
    }

    pub fn is_obsolete(&self) -> bool {
        self.inner.read().unwrap().obsolete
    }

    pub fn radix(&self) -> Radix {
        self.inner.read().unwrap().radix
    }

    /// Presentation only; the model is responsible for announcing the change.
    pub fn set_radix(&self, radix: Radix) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.radix == radix {
            return false;
        }
        inner.radix = radix;
        true
    }

    pub fn format(&self, value: &BitVec<u32>) -> String {
        let inner = self.inner.read().unwrap();
        radix::format(value, inner.radix, inner.width)
    }

    /// Current value of the observed point, by descending the path through
    /// nested substates. A retired reference is rejected, never silently
    /// stale; a live point that cannot supply a value yields `None`.
    pub fn resolve_value(&self, sim: &dyn SimAccess) -> RekamTraceResult<Option<BitVec<u32>>> {
        let inner = self.inner.read().unwrap();
        if inner.obsolete {
            return Err(RekamTraceError::Obsolete(inner.full_name.clone()));
        }
        Ok(state::resolve_path(sim, &inner.path, self.option.as_deref())?)
    }

    /// Reconciles the reference with one committed edit. Per path level: an
    /// untouched component is a no-op; a removal with a same-factory
    /// successor is spliced in (names recomputed); a removal with no such
    /// successor, a cleared ancestor circuit, or a mid-path successor whose
    /// nested circuit identity changed retires the reference permanently.
    /// `Obsoleted` is reported exactly once.
    pub fn structural_change(&self, edit: &EditResult) -> RefChange {
        let mut inner = self.inner.write().unwrap();
        if inner.obsolete {
            return RefChange::Unchanged;
        }
        if inner.circs.iter().any(|c| edit.was_cleared(c.id())) {
            inner.obsolete = true;
            return RefChange::Obsoleted;
        }
        let n = inner.path.len();
        let mut spliced = false;
        for i in 0..n {
            let map = match edit.for_circuit(inner.circs[i].id()) {
                Some(map) if !map.is_empty() => map,
                _ => continue,
            };
            let component = inner.path[i].clone();
            if !map.removes(component.id()) {
                continue;
            }
            let successor = map
                .successors_of(component.id())
                .iter()
                .find(|c| c.id() == component.id() || c.factory() == component.factory())
                .cloned();
            match successor {
                Some(next) if next.id() == component.id() => {
                    // replaced by itself
                    continue;
                }
                Some(next) => {
                    if i + 1 < n {
                        // the circuit behind a mid-path component must keep
                        // its identity, or recorded history would silently
                        // continue against a different circuit
                        match next.subcircuit() {
                            Some(sub) if sub.id() == inner.circs[i + 1].id() => {}
                            _ => {
                                inner.obsolete = true;
                                return RefChange::Obsoleted;
                            }
                        }
                    }
                    inner.path[i] = next;
                    spliced = true;
                }
                None => {
                    inner.obsolete = true;
                    return RefChange::Obsoleted;
                }
            }
        }
        if spliced {
            compute_name(&mut inner, self.option.as_deref());
            RefChange::Renamed
        } else {
            RefChange::Unchanged
        }
    }

    fn leaf(&self) -> Arc<Component> {
        self.inner
            .read()
            .unwrap()
            .path
            .last()
            .expect("path is never empty")
            .clone()
    }
}

fn compute_name(inner: &mut Inner, option: Option<&str>) -> bool {
    let (width, short, mut full) = {
        let leaf = inner.path.last().expect("path is never empty");
        let cap = leaf.capability();
        let width = cap
            .and_then(|c| c.width_of(option))
            .or_else(|| cap.map(|c| c.width))
            .unwrap_or(1);
        let short = leaf.display_name(option);
        let mut full = String::new();
        for step in &inner.path[..inner.path.len() - 1] {
            full.push_str(&step.display_name(None));
            full.push('/');
        }
        (width, short, full)
    };
    full.push_str(&short);
    if width > 1 {
        full.push_str(&format!("[{}..0]", width - 1));
    }
    let changed = width != inner.width || short != inner.short_name || full != inner.full_name;
    inner.width = width;
    inner.short_name = short;
    inner.full_name = full;
    changed
}

impl PartialEq for SignalRef {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        if self.option != other.option {
            return false;
        }
        let a = self.inner.read().unwrap();
        let b = other.inner.read().unwrap();
        a.path.len() == b.path.len()
            && a.path
                .iter()
                .zip(b.path.iter())
                .all(|(x, y)| x.id() == y.id())
    }
}

impl Eq for SignalRef {}

impl std::fmt::Display for SignalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.inner.read().unwrap().full_name)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use rekam_rs::circuit::Circuit;
    use rekam_rs::edit::EditResult;

    use crate::fixture::{bits, pin, subcircuit, FakeSim};

    use super::{RefChange, SignalRef};

    #[test]
    fn test_names_include_path_and_width_suffix() {
        let leaf = pin("data", 8, false, 0, 0);
        let inner = Circuit::new("inner", vec![leaf.clone()]);
        let sub = subcircuit("u0", &inner, 0);
        let top = Circuit::new("top", vec![sub.clone()]);

        let item = SignalRef::new(&top, vec![sub, leaf], None).unwrap();
        assert_eq!(item.short_name(), "data");
        assert_eq!(item.display_name(), "u0/data[7..0]");
        assert_eq!(item.width(), 8);
    }

    #[test]
    fn test_resolve_value_descends_substates() {
        let leaf = pin("q", 1, false, 0, 0);
        let inner = Circuit::new("inner", vec![leaf.clone()]);
        let sub = subcircuit("u0", &inner, 0);
        let top = Circuit::new("top", vec![sub.clone()]);

        let mut sim = FakeSim::default();
        let inner_sim = FakeSim::default();
        inner_sim.set(&leaf, bits("1"));
        sim.add_substate(&sub, inner_sim);

        let item = SignalRef::new(&top, vec![sub, leaf], None).unwrap();
        assert_eq!(item.resolve_value(&sim).unwrap(), Some(bits("1")));
    }

    #[test]
    fn test_same_factory_successor_keeps_identity() {
        let old = pin("a", 1, true, 0, 0);
        let top = Circuit::new("top", vec![old.clone()]);
        let item = SignalRef::top_level(&top, &old, None).unwrap();

        // moved: same factory, new label
        let new = pin("a2", 1, true, 10, 0);
        let mut edit = EditResult::new();
        edit.change_for(top.id()).record_replace(&old, &new);

        assert_eq!(item.structural_change(&edit), RefChange::Renamed);
        assert!(!item.is_obsolete());
        assert_eq!(item.short_name(), "a2");

        // identity now follows the successor
        let same = SignalRef::top_level(&top, &new, None).unwrap();
        assert!(*item == *same);
    }

    #[test]
    fn test_unrelated_edit_is_a_noop() {
        let tracked = pin("a", 1, true, 0, 0);
        let other = pin("b", 1, true, 10, 0);
        let top = Circuit::new("top", vec![tracked.clone(), other.clone()]);
        let item = SignalRef::top_level(&top, &tracked, None).unwrap();

        let mut edit = EditResult::new();
        edit.change_for(top.id()).record_remove(&other);

        assert_eq!(item.structural_change(&edit), RefChange::Unchanged);
        assert_eq!(item.short_name(), "a");
    }

    #[test]
    fn test_removal_obsoletes_exactly_once() {
        let comp = pin("a", 1, true, 0, 0);
        let top = Circuit::new("top", vec![comp.clone()]);
        let item = SignalRef::top_level(&top, &comp, None).unwrap();

        let mut edit = EditResult::new();
        edit.change_for(top.id()).record_remove(&comp);

        assert_eq!(item.structural_change(&edit), RefChange::Obsoleted);
        assert!(item.is_obsolete());
        // a second delivery of the same event stays quiet
        assert_eq!(item.structural_change(&edit), RefChange::Unchanged);

        let sim = FakeSim::default();
        assert!(item.resolve_value(&sim).is_err());
    }

    #[test]
    fn test_different_factory_successor_obsoletes() {
        let comp = pin("a", 1, true, 0, 0);
        let top = Circuit::new("top", vec![comp.clone()]);
        let item = SignalRef::top_level(&top, &comp, None).unwrap();

        let gate = crate::fixture::clock("not_a_pin", 0);
        let mut edit = EditResult::new();
        edit.change_for(top.id()).record_replace(&comp, &gate);

        assert_eq!(item.structural_change(&edit), RefChange::Obsoleted);
    }

    #[test]
    fn test_mid_path_subcircuit_identity_change_obsoletes() {
        let leaf = pin("q", 1, false, 0, 0);
        let inner = Circuit::new("inner", vec![leaf.clone()]);
        let sub = subcircuit("u0", &inner, 0);
        let top = Circuit::new("top", vec![sub.clone()]);
        let item = SignalRef::new(&top, vec![sub.clone(), leaf], None).unwrap();

        // successor points at a freshly made circuit of the same shape
        let other_inner = Circuit::new("inner", vec![pin("q", 1, false, 0, 0)]);
        let replacement = subcircuit("u0", &other_inner, 0);
        let mut edit = EditResult::new();
        edit.change_for(top.id()).record_replace(&sub, &replacement);

        assert_eq!(item.structural_change(&edit), RefChange::Obsoleted);
    }

    #[test]
    fn test_cleared_ancestor_obsoletes() {
        let leaf = pin("q", 1, false, 0, 0);
        let inner = Circuit::new("inner", vec![leaf.clone()]);
        let sub = subcircuit("u0", &inner, 0);
        let top = Circuit::new("top", vec![sub.clone()]);
        let item = SignalRef::new(&top, vec![sub, leaf], None).unwrap();

        let mut edit = EditResult::new();
        edit.record_clear(inner.id());

        assert_eq!(item.structural_change(&edit), RefChange::Obsoleted);
    }

    #[test]
    fn test_equality_is_path_and_option() {
        let comp = pin("a", 1, true, 0, 0);
        let top = Circuit::new("top", vec![comp.clone()]);
        let plain = SignalRef::top_level(&top, &comp, None).unwrap();
        let plain2 = SignalRef::top_level(&top, &comp, None).unwrap();
        let with_option = SignalRef::top_level(&top, &comp, Some("q".into())).unwrap();

        assert!(*plain == *plain2);
        assert!(*plain != *with_option);
        let _ = Arc::clone(&plain);
    }
}
