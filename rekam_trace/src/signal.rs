use std::sync::Arc;

use bitvec::vec::BitVec;
use tracing::warn;

use crate::signal_ref::SignalRef;

// Run-length entries live in fixed-capacity blocks: entry p sits at
// blocks[slot/CHUNK][slot%CHUNK]. Appends never move existing entries, and
// when a retention cap is set the oldest slot is overwritten in place.
pub(crate) const CHUNK: usize = 512;

/// One signal's bounded, run-length-encoded history: `(value, duration)`
/// entries starting at `time_start`, never empty after construction, with no
/// two consecutive entries holding the same value.
pub struct Signal {
    idx: usize,
    info: Arc<SignalRef>,
    time_start: u64,
    blocks: Vec<Vec<(BitVec<u32>, u64)>>,
    len: usize,
    cap: usize,
    first: usize,
    last: Option<BitVec<u32>>,
}

impl Signal {
    /// `cap` is the retention cap in entries, zero for unbounded.
    pub fn new(
        idx: usize,
        info: Arc<SignalRef>,
        initial: BitVec<u32>,
        duration: u64,
        time_start: u64,
        cap: usize,
    ) -> Self {
        let mut signal = Signal {
            idx,
            info,
            time_start,
            blocks: vec![],
            len: 0,
            cap,
            first: 0,
            last: None,
        };
        signal.extend(initial, duration.max(1));
        signal
    }

    pub fn index(&self) -> usize {
        self.idx
    }

    pub(crate) fn set_index(&mut self, idx: usize) {
        self.idx = idx;
    }

    pub fn reference(&self) -> &Arc<SignalRef> {
        &self.info
    }

    pub fn name(&self) -> String {
        self.info.display_name()
    }

    pub fn width(&self) -> usize {
        self.info.width()
    }

    pub fn entry_count(&self) -> usize {
        self.len
    }

    pub fn time_start(&self) -> u64 {
        self.time_start
    }

    pub fn end_time(&self) -> u64 {
        let mut t = self.time_start;
        for p in 0..self.len {
            t += self.entry(p).1;
        }
        t
    }

    /// Start of the retained window once the ring has begun evicting, zero
    /// while nothing has been dropped yet.
    pub fn omitted_data_time(&self) -> u64 {
        if self.cap > 0 && self.len == self.cap {
            self.time_start
        } else {
            0
        }
    }

    // The ring wraps only once len has reached cap, so the slot modulus is
    // only ever needed while first != 0.
    fn slot(&self, p: usize) -> usize {
        if self.first == 0 {
            p
        } else {
            (self.first + p) % self.cap
        }
    }

    fn entry(&self, p: usize) -> &(BitVec<u32>, u64) {
        let s = self.slot(p);
        &self.blocks[s / CHUNK][s % CHUNK]
    }

    fn entry_mut(&mut self, p: usize) -> &mut (BitVec<u32>, u64) {
        let s = self.slot(p);
        &mut self.blocks[s / CHUNK][s % CHUNK]
    }

    // Appends at the next logical position, growing a block or reusing a
    // vacated ring slot.
    fn put(&mut self, value: BitVec<u32>, duration: u64) {
        let s = self.slot(self.len);
        if s / CHUNK == self.blocks.len() {
            let room = if self.cap == 0 {
                CHUNK
            } else {
                CHUNK.min(self.cap - s)
            };
            self.blocks.push(Vec::with_capacity(room));
        }
        let block = &mut self.blocks[s / CHUNK];
        if s % CHUNK == block.len() {
            block.push((value, duration));
        } else {
            block[s % CHUNK] = (value, duration);
        }
        self.len += 1;
    }

    pub fn extend(&mut self, value: BitVec<u32>, duration: u64) {
        if duration == 0 {
            return;
        }
        let width = self.info.width();
        if !value.is_empty() && value.len() != width {
            // tolerated; readers normalize to the declared width
            warn!(
                signal = %self.info,
                declared = width,
                stored = value.len(),
                "value width mismatch"
            );
        }
        if self.last.as_ref() == Some(&value) {
            self.entry_mut(self.len - 1).1 += duration;
            return;
        }
        self.last = Some(value.clone());
        if self.cap > 0 && self.len == self.cap {
            // full: overwrite the oldest slot and advance the window
            let first = self.first;
            let entry = &mut self.blocks[first / CHUNK][first % CHUNK];
            self.time_start += entry.1;
            *entry = (value, duration);
            self.first = (self.first + 1) % self.cap;
        } else {
            self.put(value, duration);
        }
    }

    /// Lengthens the most recent entry without supplying a value; a signal
    /// with no data yet just shifts its start forward. Used to keep a signal
    /// in step with the shared time base.
    pub fn extend_duration(&mut self, duration: u64) {
        if duration == 0 {
            return;
        }
        if self.last.is_none() {
            self.time_start += duration;
        } else {
            self.entry_mut(self.len - 1).1 += duration;
        }
    }

    /// Back-dates the tail `duration` of history to `value`: same-length tail
    /// entries are swapped (and merged into an equal predecessor), longer
    /// ones are split, and a lone entry may borrow from the start time.
    pub fn replace_recent(&mut self, value: BitVec<u32>, duration: u64) {
        if duration == 0 {
            return;
        }
        if self.len == 0 || self.last.is_none() {
            warn!(signal = %self.info, "replace_recent on a signal without history");
            return;
        }
        let tail = self.entry(self.len - 1).1;
        if tail == duration {
            self.entry_mut(self.len - 1).0 = value.clone();
            self.last = Some(value.clone());
            if self.len > 1 && self.entry(self.len - 2).0 == value {
                self.entry_mut(self.len - 2).1 += duration;
                self.drop_last();
            }
        } else if tail > duration {
            self.entry_mut(self.len - 1).1 = tail - duration;
            self.extend(value, duration);
        } else if self.len == 1 && tail + self.time_start >= duration {
            self.time_start -= duration - tail;
            let entry = self.entry_mut(0);
            entry.0 = value.clone();
            entry.1 = duration;
            self.last = Some(value);
        } else {
            warn!(
                signal = %self.info,
                wanted = duration,
                recorded = tail,
                "replace_recent reaches past recorded history"
            );
        }
    }

    fn drop_last(&mut self) {
        let s = self.slot(self.len - 1);
        self.len -= 1;
        if self.first == 0 {
            let block = &mut self.blocks[s / CHUNK];
            block.pop();
            if block.is_empty() && self.blocks.len() > 1 {
                self.blocks.pop();
            }
        }
        // with a wrapped ring the slot stays allocated and is overwritten by
        // the next put
    }

    /// Collapses history to exactly one entry; the series restarts at time
    /// zero so total recorded duration equals the new end time.
    pub fn reset(&mut self, value: BitVec<u32>, duration: u64) {
        self.blocks.clear();
        self.len = 0;
        self.first = 0;
        self.last = None;
        self.time_start = 0;
        self.extend(value, duration.max(1));
    }

    /// Changes the retention cap. Growing (or unlimiting) keeps everything;
    /// shrinking below the current count discards the oldest entries and
    /// advances the window start by what they covered.
    pub fn resize(&mut self, cap: usize) {
        if cap == self.cap {
            return;
        }
        if cap == 0 || (self.cap != 0 && cap > self.cap) {
            if self.first != 0 {
                self.linearize();
            }
        } else if self.len > cap {
            let discard = self.len - cap;
            for p in 0..discard {
                self.time_start += self.entry(p).1;
            }
            let kept: Vec<(BitVec<u32>, u64)> =
                (discard..self.len).map(|p| self.entry(p).clone()).collect();
            self.rebuild(kept);
        } else if self.first != 0 {
            self.linearize();
        }
        self.cap = cap;
    }

    fn linearize(&mut self) {
        let entries: Vec<(BitVec<u32>, u64)> =
            (0..self.len).map(|p| self.entry(p).clone()).collect();
        self.rebuild(entries);
    }

    fn rebuild(&mut self, entries: Vec<(BitVec<u32>, u64)>) {
        self.blocks.clear();
        self.first = 0;
        self.len = 0;
        let last = entries.last().map(|e| e.0.clone());
        for (value, duration) in entries {
            self.put(value, duration);
        }
        self.last = last;
    }

    /// Value held at time `t`, normalized to the declared width; `None`
    /// before the retained window or past the end.
    pub fn value_at(&self, t: u64) -> Option<BitVec<u32>> {
        if t < self.time_start {
            return None;
        }
        let width = self.info.width();
        let mut at = self.time_start;
        for p in 0..self.len {
            let (value, duration) = self.entry(p);
            if t < at + duration {
                let mut value = value.clone();
                if !value.is_empty() {
                    value.resize(width, false);
                }
                return Some(value);
            }
            at += duration;
        }
        None
    }

    pub fn cursor(&self) -> Cursor<'_> {
        Cursor::new(self)
    }

    pub fn cursor_at(&self, time: u64) -> Cursor<'_> {
        let mut cursor = Cursor::new(self);
        if time > cursor.time {
            cursor.advance(time - cursor.time);
        }
        cursor
    }
}

/// Replay over a signal's retained history: the current `(value, duration)`
/// window, advanced entry by entry or by an arbitrary forward delta. Powers
/// both display and persistence.
pub struct Cursor<'a> {
    signal: &'a Signal,
    position: usize,
    time: u64,
    duration: u64,
    value: Option<BitVec<u32>>,
}

impl<'a> Cursor<'a> {
    fn new(signal: &'a Signal) -> Self {
        let (value, duration) = signal.entry(0);
        let mut value = value.clone();
        if !value.is_empty() {
            value.resize(signal.info.width(), false);
        }
        Cursor {
            signal,
            position: 0,
            time: signal.time_start,
            duration: *duration,
            value: Some(value),
        }
    }

    /// Start of the remaining window within the current entry.
    pub fn time(&self) -> u64 {
        self.time
    }

    /// What is left of the current entry.
    pub fn duration(&self) -> u64 {
        self.duration
    }

    /// `None` once the cursor has run off the end of the history.
    pub fn value(&self) -> Option<&BitVec<u32>> {
        self.value.as_ref()
    }

    pub fn formatted(&self) -> String {
        match &self.value {
            Some(value) => self.signal.info.format(value),
            None => "-".to_string(),
        }
    }

    /// Moves to the next entry; `false` once exhausted.
    pub fn step(&mut self) -> bool {
        if self.position + 1 >= self.signal.len {
            self.value = None;
            self.duration = 0;
            return false;
        }
        self.position += 1;
        self.time += self.duration;
        let (value, duration) = self.signal.entry(self.position);
        let mut value = value.clone();
        if !value.is_empty() {
            value.resize(self.signal.info.width(), false);
        }
        self.value = Some(value);
        self.duration = *duration;
        true
    }

    /// Moves forward by `delta`, crossing entries as needed; `false` once the
    /// target lies past the recorded end.
    pub fn advance(&mut self, delta: u64) -> bool {
        if self.value.is_none() {
            return false;
        }
        if delta == 0 {
            return true;
        }
        let target = self.time + delta;
        while target >= self.time + self.duration {
            if !self.step() {
                return false;
            }
        }
        self.duration -= target - self.time;
        self.time = target;
        true
    }
}

#[cfg(test)]
mod test {
    use bitvec::vec::BitVec;

    use rekam_rs::circuit::Circuit;

    use crate::fixture::{bits, pin};
    use crate::signal_ref::SignalRef;

    use super::Signal;

    fn one_bit(initial: &str, duration: u64, cap: usize) -> Signal {
        let comp = pin("s0", 1, true, 0, 0);
        let top = Circuit::new("top", vec![comp.clone()]);
        let info = SignalRef::top_level(&top, &comp, None).unwrap();
        Signal::new(0, info, bits(initial), duration, 0, cap)
    }

    #[test]
    fn test_equal_runs_compress() {
        let mut s = one_bit("0", 5, 0);
        s.extend(bits("1"), 10);
        s.extend(bits("1"), 5);
        s.extend(bits("0"), 20);
        s.extend(bits("0"), 1);
        s.extend(bits("1"), 4);

        assert_eq!(s.entry_count(), 4);
        assert_eq!(s.end_time(), 45);
        assert_eq!(s.value_at(12), Some(bits("1")));
        assert_eq!(s.value_at(20), Some(bits("0")));
    }

    #[test]
    fn test_single_signal_history_end_to_end() {
        let mut s = one_bit("1", 10, 0);
        s.extend(bits("1"), 5);
        s.extend(bits("0"), 20);

        assert_eq!(s.entry_count(), 2);
        assert_eq!(s.end_time(), 35);
        assert_eq!(s.value_at(12), Some(bits("1")));
        assert_eq!(s.value_at(20), Some(bits("0")));

        let mut c = s.cursor();
        assert_eq!((c.value().cloned(), c.duration()), (Some(bits("1")), 15));
        assert!(c.step());
        assert_eq!((c.value().cloned(), c.duration()), (Some(bits("0")), 20));
        assert!(!c.step());
    }

    #[test]
    fn test_zero_duration_is_a_noop() {
        let mut s = one_bit("0", 5, 0);
        s.extend(bits("1"), 0);
        assert_eq!(s.entry_count(), 1);
        assert_eq!(s.end_time(), 5);
    }

    #[test]
    fn test_capped_signal_evicts_oldest() {
        let mut s = one_bit("0", 1, 3);
        s.extend(bits("1"), 2);
        s.extend(bits("0"), 3);
        // cap reached; each further run evicts the oldest entry
        s.extend(bits("1"), 4);
        assert_eq!(s.entry_count(), 3);
        assert_eq!(s.time_start(), 1);
        assert_eq!(s.omitted_data_time(), 1);
        s.extend(bits("0"), 5);
        assert_eq!(s.entry_count(), 3);
        assert_eq!(s.time_start(), 3);
        // end time still covers every supplied duration
        assert_eq!(s.end_time(), 1 + 2 + 3 + 4 + 5);
        // evicted data is gone
        assert_eq!(s.value_at(0), None);
        assert_eq!(s.value_at(3), Some(bits("0")));
    }

    #[test]
    fn test_ring_slots_are_reused_in_place() {
        let mut s = one_bit("0", 1, 4);
        for i in 1..20u64 {
            let v = if i % 2 == 0 { bits("0") } else { bits("1") };
            s.extend(v, i);
        }
        assert_eq!(s.entry_count(), 4);
        let total: u64 = (1..20u64).sum::<u64>() + 1;
        assert_eq!(s.end_time(), total);
        // the retained window is exactly the last four runs
        assert_eq!(s.time_start(), total - (16 + 17 + 18 + 19));
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut s = one_bit("0", 5, 0);
        s.extend(bits("1"), 10);
        s.reset(bits("1"), 7);
        assert_eq!(s.entry_count(), 1);
        assert_eq!(s.time_start(), 0);
        assert_eq!(s.end_time(), 7);
        s.reset(bits("1"), 7);
        assert_eq!(s.entry_count(), 1);
        assert_eq!(s.end_time(), 7);
        assert_eq!(s.value_at(3), Some(bits("1")));
    }

    #[test]
    fn test_cursor_replays_exactly() {
        let mut s = one_bit("0", 5, 0);
        s.extend(bits("1"), 10);
        s.extend(bits("0"), 3);

        let mut c = s.cursor();
        let mut replayed = vec![];
        let mut total = 0;
        loop {
            let value = match c.value() {
                Some(v) => v.clone(),
                None => break,
            };
            replayed.push(value);
            total += c.duration();
            if !c.step() {
                break;
            }
        }
        assert_eq!(replayed, vec![bits("0"), bits("1"), bits("0")]);
        assert_eq!(total, s.end_time());
    }

    #[test]
    fn test_cursor_advances_across_entries() {
        let mut s = one_bit("0", 5, 0);
        s.extend(bits("1"), 10);
        s.extend(bits("0"), 3);

        let mut c = s.cursor();
        assert!(c.advance(7));
        assert_eq!(c.value(), Some(&bits("1")));
        assert_eq!(c.time(), 7);
        assert_eq!(c.duration(), 8);
        assert!(c.advance(8));
        assert_eq!(c.value(), Some(&bits("0")));
        assert!(!c.advance(10));
        assert_eq!(c.value(), None);
        assert_eq!(c.formatted(), "-");
    }

    #[test]
    fn test_cursor_at_seeks_forward() {
        let mut s = one_bit("0", 5, 0);
        s.extend(bits("1"), 10);
        let c = s.cursor_at(9);
        assert_eq!(c.value(), Some(&bits("1")));
        assert_eq!(c.duration(), 6);
    }

    #[test]
    fn test_replace_recent_swaps_equal_tail() {
        let mut s = one_bit("0", 5, 0);
        s.extend(bits("1"), 10);
        s.replace_recent(bits("0"), 10);
        // the swap merged into the equal predecessor
        assert_eq!(s.entry_count(), 1);
        assert_eq!(s.end_time(), 15);
        assert_eq!(s.value_at(12), Some(bits("0")));
    }

    #[test]
    fn test_replace_recent_splits_longer_tail() {
        let mut s = one_bit("0", 20, 0);
        s.replace_recent(bits("1"), 5);
        assert_eq!(s.entry_count(), 2);
        assert_eq!(s.end_time(), 20);
        assert_eq!(s.value_at(14), Some(bits("0")));
        assert_eq!(s.value_at(15), Some(bits("1")));
    }

    #[test]
    fn test_replace_recent_borrows_from_start() {
        let mut s = one_bit("0", 5, 0);
        s.time_start = 10;
        s.replace_recent(bits("1"), 8);
        assert_eq!(s.entry_count(), 1);
        assert_eq!(s.time_start(), 7);
        assert_eq!(s.end_time(), 15);
    }

    #[test]
    fn test_resize_shrink_discards_oldest() {
        let mut s = one_bit("0", 1, 0);
        s.extend(bits("1"), 2);
        s.extend(bits("0"), 3);
        s.extend(bits("1"), 4);
        s.resize(2);
        assert_eq!(s.entry_count(), 2);
        assert_eq!(s.time_start(), 3);
        assert_eq!(s.end_time(), 10);
        // and the cap now holds
        s.extend(bits("0"), 5);
        assert_eq!(s.entry_count(), 2);
    }

    #[test]
    fn test_resize_grow_keeps_wrapped_data() {
        let mut s = one_bit("0", 1, 2);
        s.extend(bits("1"), 2);
        s.extend(bits("0"), 3);
        s.extend(bits("1"), 4);
        assert_eq!(s.entry_count(), 2);
        s.resize(0);
        assert_eq!(s.entry_count(), 2);
        assert_eq!(s.end_time(), 10);
        s.extend(bits("0"), 5);
        s.extend(bits("1"), 6);
        assert_eq!(s.entry_count(), 4);
    }

    #[test]
    fn test_width_mismatch_is_tolerated_and_normalized() {
        let comp = pin("bus", 4, true, 0, 0);
        let top = Circuit::new("top", vec![comp.clone()]);
        let info = SignalRef::top_level(&top, &comp, None).unwrap();
        let mut s = Signal::new(0, info, bits("0000"), 5, 0, 0);
        s.extend(bits("1"), 5);
        assert_eq!(s.value_at(7), Some(bits("0001")));
    }

    #[test]
    fn test_undefined_values_are_recorded() {
        let mut s = one_bit("0", 5, 0);
        s.extend(BitVec::new(), 5);
        assert_eq!(s.entry_count(), 2);
        let c = s.cursor_at(7);
        assert_eq!(c.formatted(), "-");
    }
}
