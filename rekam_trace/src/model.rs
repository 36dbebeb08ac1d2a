use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Instant;

use bitvec::vec::BitVec;
use tracing::{debug, warn};

use rekam_rs::circuit::{Circuit, ClockSpec, Component};
use rekam_rs::edit::EditResult;
use rekam_rs::radix::Radix;
use rekam_rs::state::SimAccess;

use crate::signal::Signal;
use crate::signal_ref::{RefChange, SignalRef};
use crate::writer::TraceWriter;

pub const DEFAULT_TIME_SCALE: u64 = 5_000;
pub const DEFAULT_GATE_DELAY: u64 = 200;
pub const DEFAULT_HISTORY_LIMIT: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// One record per propagation step, a fixed time-scale apart.
    Step,
    /// Durations follow wall-clock time, scaled.
    Real,
    /// Durations follow an observed clock source.
    Clocked(ClockDiscipline),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockDiscipline {
    Dual,
    Rising,
    Falling,
    High,
    Low,
}

/// Whether intermediate propagation fluctuations are recorded (fine) or only
/// settled values (coarse).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Coarse,
    Fine,
}

/// Change notifications fanned out by the model. Listeners are held weakly;
/// a dropped listener never blocks the rest.
pub trait ModelListener: Send + Sync {
    fn signals_reset(&self) {}
    fn signals_extended(&self) {}
    fn file_property_changed(&self) {}
    fn selection_changed(&self) {}
    fn mode_changed(&self) {}
    fn history_limit_changed(&self) {}
}

/// The ordered set of tracked signals over one simulation state: parallel
/// reference and history lists (a signal's index always equals its list
/// position), the shared time base, the capture-mode configuration, and the
/// optional background file writer.
///
/// Structural APIs are single-writer; concurrent mutation must be serialized
/// by the caller (see [`crate::ModelCache`]).
pub struct TraceModel {
    circuit: Arc<Circuit>,
    sim: Arc<dyn SimAccess>,
    refs: Vec<Arc<SignalRef>>,
    signals: Vec<Signal>,
    time_end: u64,
    spotlight: Option<Arc<SignalRef>>,
    clock_source: Option<Arc<SignalRef>>,
    cur_clock: Option<BitVec<u32>>,
    listeners: Vec<Weak<dyn ModelListener>>,
    mode: CaptureMode,
    granularity: Granularity,
    time_scale: u64,
    gate_delay: u64,
    history_limit: usize,
    elapsed_since_trigger: u64,
    last_realtime_update: Option<Instant>,
    file: Option<PathBuf>,
    file_enabled: bool,
    file_header: bool,
    selected: bool,
    writer: Option<TraceWriter>,
}

fn is_hi(v: &BitVec<u32>) -> bool {
    v.len() == 1 && v[0]
}

fn is_lo(v: &BitVec<u32>) -> bool {
    v.len() == 1 && !v[0]
}

impl TraceModel {
    /// Seeds the tracked list from every top-level loggable component without
    /// sub-options, inputs before outputs then by canvas position; adopts a
    /// clock source (and the clocked mode) when the circuit has one.
    pub fn new(circuit: Arc<Circuit>, sim: Arc<dyn SimAccess>) -> Self {
        let mut model = TraceModel {
            circuit,
            sim,
            refs: vec![],
            signals: vec![],
            time_end: 0,
            spotlight: None,
            clock_source: None,
            cur_clock: None,
            listeners: vec![],
            mode: CaptureMode::Step,
            granularity: Granularity::Coarse,
            time_scale: DEFAULT_TIME_SCALE,
            gate_delay: DEFAULT_GATE_DELAY,
            history_limit: DEFAULT_HISTORY_LIMIT,
            elapsed_since_trigger: 0,
            last_realtime_update: None,
            file: None,
            file_enabled: false,
            file_header: true,
            selected: false,
            writer: None,
        };

        let mut refs: Vec<Arc<SignalRef>> = vec![];
        for component in model.circuit.components() {
            if let Some(item) = model.make_if_default(&component) {
                refs.push(item);
            }
        }
        refs.sort_by_key(|r| r.location());
        let (inputs, outputs): (Vec<_>, Vec<_>) = refs.into_iter().partition(|r| r.is_input());
        let mut refs = inputs;
        refs.extend(outputs);

        if let Some(path) = model.circuit.find_clocks().into_iter().next() {
            if let Ok(item) = SignalRef::new(&model.circuit, path, None) {
                let item = match refs.iter().position(|r| **r == *item) {
                    Some(i) => refs.remove(i),
                    None => item,
                };
                refs.insert(0, item.clone());
                model.cur_clock = item.resolve_value(&*model.sim).ok().flatten();
                model.clock_source = Some(item);
                model.mode = CaptureMode::Clocked(ClockDiscipline::Dual);
            }
        }

        let duration = if model.capture_continuous() {
            model.gate_delay
        } else {
            model.time_scale
        };
        for (i, item) in refs.iter().enumerate() {
            let value = model.fetch(item);
            model
                .signals
                .push(Signal::new(i, item.clone(), value, duration, 0, model.history_limit));
        }
        model.refs = refs;
        model.time_end = duration;
        model
    }

    pub fn circuit(&self) -> &Arc<Circuit> {
        &self.circuit
    }

    pub fn signal_count(&self) -> usize {
        self.signals.len()
    }

    pub fn signals(&self) -> &[Signal] {
        &self.signals
    }

    pub fn get_signal(&self, idx: usize) -> Option<&Signal> {
        self.signals.get(idx)
    }

    pub fn get_item(&self, idx: usize) -> Option<&Arc<SignalRef>> {
        self.refs.get(idx)
    }

    pub fn index_of(&self, item: &SignalRef) -> Option<usize> {
        self.position(item)
    }

    pub fn end_time(&self) -> u64 {
        self.time_end
    }

    /// Earliest time still retained by every tracked signal; signals whose
    /// ring has wrapped push this forward.
    pub fn start_time(&self) -> u64 {
        self.signals
            .iter()
            .map(Signal::omitted_data_time)
            .max()
            .unwrap_or(0)
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn time_scale(&self) -> u64 {
        self.time_scale
    }

    pub fn gate_delay(&self) -> u64 {
        self.gate_delay
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    pub fn clock_source(&self) -> Option<&Arc<SignalRef>> {
        self.clock_source.as_ref()
    }

    fn position(&self, item: &SignalRef) -> Option<usize> {
        self.refs.iter().position(|r| **r == *item)
    }

    fn make_if_default(&self, component: &Arc<Component>) -> Option<Arc<SignalRef>> {
        if component.subcircuit().is_some() {
            return None;
        }
        let cap = component.capability()?;
        if !cap.options.is_empty() {
            return None;
        }
        SignalRef::top_level(&self.circuit, component, None).ok()
    }

    fn fetch(&self, item: &SignalRef) -> BitVec<u32> {
        match item.resolve_value(&*self.sim) {
            Ok(Some(value)) => value,
            Ok(None) => BitVec::new(),
            Err(e) => {
                debug!(error = %e, "value fetch failed");
                BitVec::new()
            }
        }
    }

    fn query_values(&self) -> Vec<BitVec<u32>> {
        self.refs.iter().map(|r| self.fetch(r)).collect()
    }

    fn renumber(&mut self) {
        for (i, s) in self.signals.iter_mut().enumerate() {
            s.set_index(i);
        }
    }

    /// Inserts untracked items at `idx` and moves already-tracked ones there;
    /// an item already in place is a no-op. One selection-changed total.
    pub fn add_or_move(&mut self, items: Vec<Arc<SignalRef>>, mut idx: usize) {
        let mut changed = false;
        for item in items {
            match self.position(&item) {
                None => {
                    idx = idx.min(self.refs.len());
                    let value = self.fetch(&item);
                    self.refs.insert(idx, item.clone());
                    self.signals.insert(
                        idx,
                        Signal::new(
                            idx,
                            item,
                            value,
                            1,
                            self.time_end.saturating_sub(1),
                            self.history_limit,
                        ),
                    );
                    idx += 1;
                    changed = true;
                }
                Some(i) if i > idx => {
                    let r = self.refs.remove(i);
                    self.refs.insert(idx, r);
                    let s = self.signals.remove(i);
                    self.signals.insert(idx, s);
                    idx += 1;
                    changed = true;
                }
                Some(i) if i < idx => {
                    let r = self.refs.remove(i);
                    self.refs.insert(idx - 1, r);
                    let s = self.signals.remove(i);
                    self.signals.insert(idx - 1, s);
                    changed = true;
                }
                Some(_) => {}
            }
        }
        if changed {
            self.renumber();
            self.fire_selection_changed();
        }
    }

    pub fn remove(&mut self, items: &[Arc<SignalRef>]) -> usize {
        let mut count = 0;
        for item in items {
            if let Some(i) = self.position(item) {
                if self.spotlight.as_ref().is_some_and(|s| **s == **item) {
                    self.spotlight = None;
                }
                self.refs.remove(i);
                self.signals.remove(i);
                count += 1;
            }
        }
        if count > 0 {
            self.renumber();
            self.fire_selection_changed();
        }
        count
    }

    pub fn remove_at(&mut self, idx: usize) {
        if idx >= self.refs.len() {
            return;
        }
        if self
            .spotlight
            .as_ref()
            .is_some_and(|s| **s == *self.refs[idx])
        {
            self.spotlight = None;
        }
        self.refs.remove(idx);
        self.signals.remove(idx);
        self.renumber();
        self.fire_selection_changed();
    }

    pub fn move_signals(&mut self, from: &[usize], to: usize) {
        if from.is_empty() {
            return;
        }
        let mut from = from.to_vec();
        from.sort_unstable();
        let (a, b) = (from[0], from[from.len() - 1]);
        if b >= self.refs.len() || to > self.refs.len() {
            return;
        }
        if a <= to && to <= b && b - a + 1 == from.len() {
            return;
        }
        let mut to = to;
        let mut items = Vec::with_capacity(from.len());
        let mut vals = Vec::with_capacity(from.len());
        for &i in from.iter().rev() {
            if i < to {
                to -= 1;
            }
            items.push(self.refs.remove(i));
            vals.push(self.signals.remove(i));
        }
        for (r, s) in items.into_iter().rev().zip(vals.into_iter().rev()) {
            self.refs.insert(to, r);
            self.signals.insert(to, s);
            to += 1;
        }
        self.renumber();
        self.fire_selection_changed();
    }

    pub fn set_history_limit(&mut self, limit: usize) {
        if self.history_limit == limit {
            return;
        }
        self.history_limit = limit;
        for s in &mut self.signals {
            s.resize(limit);
        }
        self.fire_history_limit_changed();
    }

    pub fn set_radix(&mut self, item: &Arc<SignalRef>, radix: Radix) {
        if item.set_radix(radix) {
            self.fire_selection_changed();
        }
    }

    pub fn spotlight(&self) -> Option<&Signal> {
        let item = self.spotlight.as_ref()?;
        let i = self.position(item)?;
        self.signals.get(i)
    }

    pub fn set_spotlight(&mut self, item: Option<Arc<SignalRef>>) -> Option<Arc<SignalRef>> {
        let old = self.spotlight.take();
        self.spotlight = item.filter(|i| self.position(i).is_some());
        old
    }

    fn capture_continuous(&self) -> bool {
        if self.granularity == Granularity::Fine {
            return true;
        }
        match (self.mode, &self.cur_clock) {
            (CaptureMode::Clocked(ClockDiscipline::High), Some(v)) => is_hi(v),
            (CaptureMode::Clocked(ClockDiscipline::Low), Some(v)) => is_lo(v),
            _ => false,
        }
    }

    // Mode setters are pure configuration: a transition only changes how the
    // next propagation computes its duration, never recorded history. A gate
    // delay of zero selects coarse granularity.

    pub fn set_step_mode(&mut self, time_scale: u64, gate_delay: u64) {
        let g = granularity_for(gate_delay);
        if self.mode == CaptureMode::Step
            && self.granularity == g
            && self.time_scale == time_scale
            && (gate_delay == 0 || self.gate_delay == gate_delay)
        {
            return;
        }
        self.time_scale = time_scale;
        if gate_delay > 0 {
            self.gate_delay = gate_delay;
        }
        self.set_mode(CaptureMode::Step, g);
    }

    pub fn set_real_mode(&mut self, time_scale: u64, gate_delay: u64) {
        let g = granularity_for(gate_delay);
        if self.mode == CaptureMode::Real
            && self.granularity == g
            && self.time_scale == time_scale
            && (gate_delay == 0 || self.gate_delay == gate_delay)
        {
            return;
        }
        self.time_scale = time_scale;
        if gate_delay > 0 {
            self.gate_delay = gate_delay;
        }
        self.set_mode(CaptureMode::Real, g);
    }

    pub fn set_clock_mode(&mut self, discipline: ClockDiscipline, time_scale: u64, gate_delay: u64) {
        let g = granularity_for(gate_delay);
        if self.clock_source.is_some()
            && self.mode == CaptureMode::Clocked(discipline)
            && self.granularity == g
            && self.time_scale == time_scale
            && (gate_delay == 0 || self.gate_delay == gate_delay)
        {
            return;
        }
        if self.clock_source.is_none() {
            let Some(path) = self.circuit.find_clocks().into_iter().next() else {
                debug!("no clock source available, staying in {} mode", self.mode);
                return;
            };
            let Ok(item) = SignalRef::new(&self.circuit, path, None) else {
                return;
            };
            self.cur_clock = item.resolve_value(&*self.sim).ok().flatten();
            if self.position(&item).is_none() {
                // track the clock as a courtesy, at the top of the list
                let value = self.fetch(&item);
                self.refs.insert(0, item.clone());
                self.signals.insert(
                    0,
                    Signal::new(
                        0,
                        item.clone(),
                        value,
                        1,
                        self.time_end.saturating_sub(1),
                        self.history_limit,
                    ),
                );
                self.renumber();
                self.clock_source = Some(item);
                self.fire_selection_changed();
            } else {
                self.clock_source = Some(item);
            }
        }
        self.time_scale = time_scale;
        if gate_delay > 0 {
            self.gate_delay = gate_delay;
        }
        self.set_mode(CaptureMode::Clocked(discipline), g);
    }

    /// Explicit clock-source override, for circuits with more than one clock.
    pub fn set_clock_source(&mut self, item: Option<Arc<SignalRef>>) {
        match (&self.clock_source, &item) {
            (Some(a), Some(b)) if **a == **b => return,
            (None, None) => return,
            _ => {}
        }
        self.cur_clock = item
            .as_ref()
            .and_then(|i| i.resolve_value(&*self.sim).ok().flatten());
        self.clock_source = item;
        self.fire_mode_changed();
    }

    fn set_mode(&mut self, mode: CaptureMode, granularity: Granularity) {
        self.mode = mode;
        self.granularity = granularity;
        if mode == CaptureMode::Real {
            self.last_realtime_update = Some(Instant::now());
        }
        self.fire_mode_changed();
    }

    /// Records the values reached by one completed propagation. `stepped`
    /// marks that the simulation advanced at all, `propagated` that it
    /// settled; transient fluctuations only register in fine granularity.
    pub fn propagation_completed(&mut self, _ticked: bool, stepped: bool, propagated: bool) {
        if !stepped && !propagated {
            return;
        }
        if self.granularity == Granularity::Coarse && !propagated {
            return;
        }
        match self.mode {
            CaptureMode::Step => {
                let duration = if propagated {
                    self.time_scale
                } else {
                    self.gate_delay
                };
                self.extend_with_new_values(duration);
            }
            CaptureMode::Real => {
                let now = Instant::now();
                let elapsed = self
                    .last_realtime_update
                    .map(|t| now.duration_since(t))
                    .unwrap_or_default();
                let duration = ((elapsed.as_nanos() as u64).saturating_mul(self.time_scale)
                    / 1_000_000_000)
                    .max(1);
                self.extend_with_new_values(duration);
                self.last_realtime_update = Some(now);
            }
            CaptureMode::Clocked(discipline) => self.clocked_update(discipline),
        }
    }

    // Capture keyed off observed transitions or levels of the clock source,
    // not off the simulator's own notion of a tick.
    fn clocked_update(&mut self, discipline: ClockDiscipline) {
        let Some(source) = self.clock_source.clone() else {
            let duration = self.time_scale;
            self.extend_with_new_values(duration);
            return;
        };
        let v = source
            .resolve_value(&*self.sim)
            .ok()
            .flatten()
            .unwrap_or_default();
        let cc = source.clock_spec().unwrap_or_default();
        let fine = self.granularity == Granularity::Fine;
        let changed = self.cur_clock.as_ref() != Some(&v);
        match discipline {
            ClockDiscipline::High | ClockDiscipline::Low => {
                let active_now = if discipline == ClockDiscipline::High {
                    is_hi(&v)
                } else {
                    is_lo(&v)
                };
                let (active_ticks, stable_ticks) = if discipline == ClockDiscipline::High {
                    (cc.hi_ticks, cc.lo_ticks)
                } else {
                    (cc.lo_ticks, cc.hi_ticks)
                };
                let active_duration = active_ticks * self.time_scale;
                let stable_duration = stable_ticks * self.time_scale;
                if active_now {
                    // active level records continuously, one gate delay at a
                    // time; first finish out the stable period just left
                    if changed {
                        if self.elapsed_since_trigger < active_duration {
                            let fill = stable_duration.saturating_sub(self.elapsed_since_trigger);
                            self.extend_with_old_values(fill);
                        }
                        self.elapsed_since_trigger = 0;
                        self.cur_clock = Some(v);
                    }
                    let duration = self.gate_delay;
                    self.extend_with_new_values(duration);
                } else if changed {
                    // just went inactive: finish out the active period, then
                    // open the stable one
                    if self.elapsed_since_trigger < active_duration {
                        let fill = active_duration.saturating_sub(self.elapsed_since_trigger);
                        self.extend_with_old_values(fill);
                    }
                    self.elapsed_since_trigger = 0;
                    self.cur_clock = Some(v);
                    let duration = if fine { self.gate_delay } else { stable_duration };
                    self.extend_with_new_values(duration);
                } else if !fine {
                    // back-date transients to the start of the stable period
                    self.replace_with_new_values(stable_duration);
                } else {
                    let duration = self.gate_delay;
                    self.extend_with_new_values(duration);
                }
            }
            ClockDiscipline::Dual | ClockDiscipline::Rising | ClockDiscipline::Falling => {
                let dual = discipline == ClockDiscipline::Dual;
                let ticks = if dual {
                    if is_lo(&v) {
                        cc.lo_ticks
                    } else {
                        cc.hi_ticks
                    }
                } else {
                    cc.period_ticks()
                };
                let prev_ticks = if dual {
                    if is_lo(&v) {
                        cc.hi_ticks
                    } else {
                        cc.lo_ticks
                    }
                } else {
                    cc.period_ticks()
                };
                let stable_duration = self.time_scale * ticks;
                let prev_duration = self.time_scale * prev_ticks;
                let duration = if fine { self.gate_delay } else { stable_duration };
                let was_hi = self.cur_clock.as_ref().is_some_and(|c| is_hi(c));
                let was_lo = self.cur_clock.as_ref().is_some_and(|c| is_lo(c));
                let triggered = if dual {
                    changed
                } else if discipline == ClockDiscipline::Rising {
                    is_hi(&v) && !was_hi
                } else {
                    is_lo(&v) && !was_lo
                };
                self.cur_clock = Some(v);
                if triggered {
                    // finish out the previous stable period, then start a new
                    // one
                    if fine && self.elapsed_since_trigger < prev_duration {
                        let fill = prev_duration - self.elapsed_since_trigger;
                        self.extend_with_old_values(fill);
                    }
                    self.elapsed_since_trigger = 0;
                    self.extend_with_new_values(duration);
                } else if !fine {
                    self.replace_with_new_values(stable_duration);
                } else {
                    self.extend_with_new_values(duration);
                }
            }
        }
    }

    fn extend_with_new_values(&mut self, duration: u64) {
        if duration == 0 {
            return;
        }
        let values = self.query_values();
        for (s, v) in self.signals.iter_mut().zip(values) {
            s.extend(v, duration);
        }
        self.elapsed_since_trigger += duration;
        self.time_end += duration;
        self.fire_signals_extended();
    }

    fn extend_with_old_values(&mut self, duration: u64) {
        if duration == 0 {
            return;
        }
        for s in &mut self.signals {
            s.extend_duration(duration);
        }
        self.elapsed_since_trigger += duration;
        self.time_end += duration;
        self.fire_signals_extended();
    }

    fn replace_with_new_values(&mut self, duration: u64) {
        let values = self.query_values();
        for (s, v) in self.signals.iter_mut().zip(values) {
            s.replace_recent(v, duration);
        }
        self.fire_signals_extended();
    }

    /// The simulation restarted: every signal collapses to one base-unit
    /// entry and the time base restarts behind it.
    pub fn simulator_reset(&mut self) {
        let duration = match self.mode {
            CaptureMode::Clocked(discipline) => {
                let (v, cc) = match &self.clock_source {
                    Some(source) => (
                        source
                            .resolve_value(&*self.sim)
                            .ok()
                            .flatten()
                            .unwrap_or_default(),
                        source.clock_spec().unwrap_or_default(),
                    ),
                    None => (BitVec::new(), ClockSpec::default()),
                };
                self.cur_clock = Some(v.clone());
                if self.capture_continuous() {
                    self.gate_delay
                } else if matches!(discipline, ClockDiscipline::High | ClockDiscipline::Low) {
                    let stable_ticks = if discipline == ClockDiscipline::High {
                        cc.lo_ticks
                    } else {
                        cc.hi_ticks
                    };
                    stable_ticks * self.time_scale
                } else {
                    let ticks = if discipline == ClockDiscipline::Dual {
                        if is_lo(&v) {
                            cc.lo_ticks
                        } else {
                            cc.hi_ticks
                        }
                    } else {
                        cc.period_ticks()
                    };
                    ticks * self.time_scale
                }
            }
            CaptureMode::Step => self.time_scale,
            CaptureMode::Real => self.gate_delay,
        };
        if self.mode == CaptureMode::Real {
            self.last_realtime_update = Some(Instant::now());
        }
        let values = self.query_values();
        for (s, v) in self.signals.iter_mut().zip(values) {
            s.reset(v, duration);
        }
        self.elapsed_since_trigger = duration;
        self.time_end = duration;
        self.fire_signals_reset();
    }

    /// Reconciles every tracked reference with one committed edit, removes
    /// the ones that retired (one batched selection-changed), auto-tracks
    /// newly added top-level observables, and promotes a stepped model to
    /// clocked capture when a clock first appears.
    pub fn circuit_edited(&mut self, edit: &EditResult) {
        let mut renamed = false;
        let mut dropped: Vec<Arc<SignalRef>> = vec![];
        for item in &self.refs {
            match item.structural_change(edit) {
                RefChange::Renamed => renamed = true,
                RefChange::Obsoleted => dropped.push(item.clone()),
                RefChange::Unchanged => {}
            }
        }
        if let Some(source) = self.clock_source.clone() {
            if self.position(&source).is_none() {
                // an untracked source still follows edits
                let _ = source.structural_change(edit);
            }
            if source.is_obsolete() {
                debug!(clock = %source, "clock source retired, falling back to step capture");
                self.clock_source = None;
                self.cur_clock = None;
                if matches!(self.mode, CaptureMode::Clocked(_)) {
                    self.set_mode(CaptureMode::Step, self.granularity);
                }
            }
        }
        if !dropped.is_empty() {
            self.remove(&dropped);
        } else if renamed {
            self.fire_selection_changed();
        }
        if let Some(map) = edit.for_circuit(self.circuit.id()) {
            for component in map.fresh_additions() {
                let Some(item) = self.make_if_default(&component) else {
                    continue;
                };
                self.add_and_initialize(item.clone());
                if component.is_clock() && self.clock_source.is_none() {
                    self.cur_clock = item.resolve_value(&*self.sim).ok().flatten();
                    self.clock_source = Some(item);
                    if self.mode == CaptureMode::Step {
                        self.set_mode(
                            CaptureMode::Clocked(ClockDiscipline::Dual),
                            self.granularity,
                        );
                    }
                }
            }
        }
    }

    fn add_and_initialize(&mut self, item: Arc<SignalRef>) -> usize {
        if let Some(i) = self.position(&item) {
            return i;
        }
        let idx = self.refs.len();
        let value = self.fetch(&item);
        self.refs.push(item.clone());
        self.signals.push(Signal::new(
            idx,
            item,
            value,
            1,
            self.time_end.saturating_sub(1),
            self.history_limit,
        ));
        self.fire_selection_changed();
        idx
    }

    pub fn file(&self) -> Option<&PathBuf> {
        self.file.as_ref()
    }

    pub fn set_file(&mut self, file: Option<PathBuf>) {
        if self.file == file {
            return;
        }
        self.file = file;
        self.file_enabled = self.file.is_some();
        self.fire_file_property_changed();
    }

    pub fn is_file_enabled(&self) -> bool {
        self.file_enabled
    }

    pub fn set_file_enabled(&mut self, enabled: bool) {
        if self.file_enabled == enabled {
            return;
        }
        self.file_enabled = enabled;
        self.fire_file_property_changed();
    }

    pub fn file_header(&self) -> bool {
        self.file_header
    }

    pub fn set_file_header(&mut self, header: bool) {
        if self.file_header == header {
            return;
        }
        self.file_header = header;
        self.fire_file_property_changed();
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    /// The selected flag owns the writer: selecting spawns it, deselecting
    /// cancels it and drops file capture.
    pub fn set_selected(&mut self, selected: bool) {
        if self.selected == selected {
            return;
        }
        self.selected = selected;
        if selected {
            self.writer = Some(TraceWriter::spawn(self.file.clone(), self.file_enabled));
        } else {
            if let Some(writer) = self.writer.take() {
                writer.cancel();
            }
            self.file_enabled = false;
        }
        self.fire_file_property_changed();
    }

    pub fn add_listener(&mut self, listener: &Arc<dyn ModelListener>) {
        self.listeners.push(Arc::downgrade(listener));
    }

    pub fn remove_listener(&mut self, listener: &Arc<dyn ModelListener>) {
        let target = Arc::downgrade(listener);
        self.listeners.retain(|w| !w.ptr_eq(&target));
    }

    fn each_listener(&mut self, f: impl Fn(&dyn ModelListener)) {
        self.listeners.retain(|w| w.strong_count() > 0);
        for weak in &self.listeners {
            if let Some(listener) = weak.upgrade() {
                f(&*listener);
            }
        }
    }

    pub fn mode_description(&self) -> String {
        format!(
            "{} {}, {} ns scale, {} ns gate",
            self.mode, self.granularity, self.time_scale, self.gate_delay
        )
    }

    fn writer_append(&mut self) {
        let failed = match &self.writer {
            Some(writer) if self.selected && self.file_enabled && self.file.is_some() => {
                writer.append(
                    &self.signals,
                    self.time_end,
                    self.file_header,
                    &self.mode_description(),
                );
                writer.take_failed()
            }
            _ => false,
        };
        if failed {
            warn!("log destination not writable, disabling file capture");
            self.file_enabled = false;
            self.fire_file_property_changed();
        }
    }

    fn fire_signals_extended(&mut self) {
        self.writer_append();
        self.each_listener(|l| l.signals_extended());
    }

    fn fire_signals_reset(&mut self) {
        if let Some(writer) = &self.writer {
            writer.signals_reset();
        }
        self.each_listener(|l| l.signals_reset());
    }

    fn fire_selection_changed(&mut self) {
        if let Some(writer) = &self.writer {
            writer.selection_changed();
        }
        self.each_listener(|l| l.selection_changed());
    }

    fn fire_mode_changed(&mut self) {
        if let Some(writer) = &self.writer {
            writer.mode_changed();
        }
        self.each_listener(|l| l.mode_changed());
    }

    fn fire_history_limit_changed(&mut self) {
        self.each_listener(|l| l.history_limit_changed());
    }

    fn fire_file_property_changed(&mut self) {
        if let Some(writer) = &self.writer {
            writer.file_changed(self.file_enabled, self.file.as_deref());
        }
        self.each_listener(|l| l.file_property_changed());
    }
}

impl Drop for TraceModel {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.cancel();
        }
    }
}

fn granularity_for(gate_delay: u64) -> Granularity {
    if gate_delay > 0 {
        Granularity::Fine
    } else {
        Granularity::Coarse
    }
}

/// Human-scaled duration: ns up to values that do not divide evenly, then
/// us/ms/s with one decimal place.
pub fn format_duration(t: u64) -> String {
    if t < 1_000 || t % 100 != 0 {
        format!("{t} ns")
    } else if t < 1_000_000 || t % 100_000 != 0 {
        format!("{:.1} us", t as f64 / 1_000.0)
    } else if t < 100_000_000 || t % 100_000_000 != 0 {
        format!("{:.1} ms", t as f64 / 1_000_000.0)
    } else {
        format!("{:.1} s", t as f64 / 1_000_000_000.0)
    }
}

impl std::fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureMode::Step => f.write_str("step"),
            CaptureMode::Real => f.write_str("real"),
            CaptureMode::Clocked(ClockDiscipline::Dual) => f.write_str("clock-dual"),
            CaptureMode::Clocked(ClockDiscipline::Rising) => f.write_str("clock-rising"),
            CaptureMode::Clocked(ClockDiscipline::Falling) => f.write_str("clock-falling"),
            CaptureMode::Clocked(ClockDiscipline::High) => f.write_str("clock-high"),
            CaptureMode::Clocked(ClockDiscipline::Low) => f.write_str("clock-low"),
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Granularity::Coarse => f.write_str("coarse"),
            Granularity::Fine => f.write_str("fine"),
        }
    }
}
