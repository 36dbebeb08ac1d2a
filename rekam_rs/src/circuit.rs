use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};

use crate::edit::ReplacementMap;

static NEXT_COMPONENT_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CIRCUIT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one component snapshot. Components are immutable; every edit
/// produces successors with fresh ids, related through a [`ReplacementMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CircuitId(u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location {
    pub x: i32,
    pub y: i32,
}

/// What a component must expose to be traceable: a bit-width, an input flag,
/// optional discrete sub-options, and optionally a clock cycle description.
#[derive(Clone)]
pub struct LogCapability {
    pub width: usize,
    pub input: bool,
    pub log_name: Option<String>,
    pub options: Vec<LogOption>,
    pub clock: Option<ClockSpec>,
}

#[derive(Clone)]
pub struct LogOption {
    pub name: String,
    pub width: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSpec {
    pub hi_ticks: u64,
    pub lo_ticks: u64,
}

pub enum ComponentKind {
    Subcircuit(Arc<Circuit>),
    Loggable(LogCapability),
    Plain,
}

pub struct Component {
    id: ComponentId,
    factory: String,
    label: Option<String>,
    location: Location,
    kind: ComponentKind,
}

pub struct Circuit {
    id: CircuitId,
    name: String,
    components: RwLock<Vec<Arc<Component>>>,
}

impl LogCapability {
    pub fn width_of(&self, option: Option<&str>) -> Option<usize> {
        match option {
            None => Some(self.width),
            Some(name) => self
                .options
                .iter()
                .find(|o| o.name == name)
                .map(|o| o.width),
        }
    }
}

impl Default for ClockSpec {
    fn default() -> Self {
        Self {
            hi_ticks: 1,
            lo_ticks: 1,
        }
    }
}

impl ClockSpec {
    pub fn period_ticks(&self) -> u64 {
        self.hi_ticks + self.lo_ticks
    }
}

impl Component {
    pub fn new(
        factory: impl Into<String>,
        label: Option<&str>,
        location: Location,
        kind: ComponentKind,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ComponentId(NEXT_COMPONENT_ID.fetch_add(1, Ordering::Relaxed)),
            factory: factory.into(),
            label: label.map(str::to_string),
            location,
            kind,
        })
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn factory(&self) -> &str {
        &self.factory
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn capability(&self) -> Option<&LogCapability> {
        match &self.kind {
            ComponentKind::Loggable(cap) => Some(cap),
            _ => None,
        }
    }

    pub fn subcircuit(&self) -> Option<&Arc<Circuit>> {
        match &self.kind {
            ComponentKind::Subcircuit(circuit) => Some(circuit),
            _ => None,
        }
    }

    pub fn is_clock(&self) -> bool {
        self.capability().is_some_and(|cap| cap.clock.is_some())
    }

    /// Name used in signal lists and log headers: the capability's own log
    /// name when it has one, else the label, else factory plus location; the
    /// sub-option selector is appended to the two fallback forms.
    pub fn display_name(&self, option: Option<&str>) -> String {
        if let Some(cap) = self.capability() {
            if let Some(name) = cap.log_name.as_ref().filter(|n| !n.is_empty()) {
                return name.clone();
            }
        }
        let base = match self.label.as_ref().filter(|l| !l.is_empty()) {
            Some(label) => label.clone(),
            None => format!("{}({},{})", self.factory, self.location.x, self.location.y),
        };
        match option {
            Some(o) => format!("{base}.{o}"),
            None => base,
        }
    }
}

impl Circuit {
    pub fn new(name: impl Into<String>, components: Vec<Arc<Component>>) -> Arc<Self> {
        Arc::new(Self {
            id: CircuitId(NEXT_CIRCUIT_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            components: RwLock::new(components),
        })
    }

    pub fn id(&self) -> CircuitId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn components(&self) -> Vec<Arc<Component>> {
        self.components.read().unwrap().clone()
    }

    /// Applies one committed edit to the component list, the way a host
    /// editor would before broadcasting the corresponding [`ReplacementMap`].
    pub fn apply(&self, map: &ReplacementMap) {
        let mut components = self.components.write().unwrap();
        components.retain(|c| !map.removes(c.id()));
        components.extend(map.added().cloned());
    }

    /// Every clock component reachable from this circuit, each as the full
    /// path of components leading to it.
    pub fn find_clocks(&self) -> Vec<Vec<Arc<Component>>> {
        let mut found = vec![];
        self.collect_clocks(&mut vec![], &mut found);
        found
    }

    fn collect_clocks(
        &self,
        prefix: &mut Vec<Arc<Component>>,
        out: &mut Vec<Vec<Arc<Component>>>,
    ) {
        for component in self.components.read().unwrap().iter() {
            if component.is_clock() {
                let mut path = prefix.clone();
                path.push(component.clone());
                out.push(path);
            } else if let Some(sub) = component.subcircuit() {
                prefix.push(component.clone());
                sub.collect_clocks(prefix, out);
                prefix.pop();
            }
        }
    }
}
