//! Shared builders for the in-crate tests: a handful of component shapes and
//! a table-backed stand-in for the simulation collaborator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bitvec::order::Lsb0;
use bitvec::vec::BitVec;

use rekam_rs::circuit::{
    Circuit, ClockSpec, Component, ComponentId, ComponentKind, Location, LogCapability,
};
use rekam_rs::state::SimAccess;

pub fn bits(s: &str) -> BitVec<u32> {
    let mut v = bitvec::bitvec![u32, Lsb0;];
    for c in s.chars().rev() {
        v.push(c == '1');
    }
    v
}

pub fn pin(label: &str, width: usize, input: bool, x: i32, y: i32) -> Arc<Component> {
    Component::new(
        "pin",
        Some(label),
        Location { x, y },
        ComponentKind::Loggable(LogCapability {
            width,
            input,
            log_name: None,
            options: vec![],
            clock: None,
        }),
    )
}

pub fn clock(label: &str, x: i32) -> Arc<Component> {
    Component::new(
        "clock",
        Some(label),
        Location { x, y: 0 },
        ComponentKind::Loggable(LogCapability {
            width: 1,
            input: true,
            log_name: None,
            options: vec![],
            clock: Some(ClockSpec::default()),
        }),
    )
}

pub fn subcircuit(label: &str, circuit: &Arc<Circuit>, x: i32) -> Arc<Component> {
    Component::new(
        "subcircuit",
        Some(label),
        Location { x, y: 0 },
        ComponentKind::Subcircuit(circuit.clone()),
    )
}

#[derive(Default)]
pub struct FakeSim {
    values: Mutex<HashMap<ComponentId, BitVec<u32>>>,
    substates: HashMap<ComponentId, Box<FakeSim>>,
}

impl FakeSim {
    pub fn set(&self, component: &Arc<Component>, value: BitVec<u32>) {
        self.values.lock().unwrap().insert(component.id(), value);
    }

    pub fn add_substate(&mut self, component: &Arc<Component>, substate: FakeSim) {
        self.substates.insert(component.id(), Box::new(substate));
    }
}

impl SimAccess for FakeSim {
    fn fetch(&self, component: ComponentId, _option: Option<&str>) -> Option<BitVec<u32>> {
        self.values.lock().unwrap().get(&component).cloned()
    }

    fn substate(&self, component: ComponentId) -> Option<&dyn SimAccess> {
        self.substates
            .get(&component)
            .map(|s| &**s as &dyn SimAccess)
    }
}
