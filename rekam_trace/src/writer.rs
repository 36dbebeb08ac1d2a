use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::model::format_duration;
use crate::signal::Signal;

pub(crate) const FLUSH_PERIOD: Duration = Duration::from_millis(500);
pub(crate) const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Mirrors recorded data to the log destination, decoupled from the capture
/// rate. The model appends rows synchronously (an in-memory buffer write
/// under one mutex); a background thread flushes the buffer every
/// [`FLUSH_PERIOD`] and lets go of the file handle after [`IDLE_TIMEOUT`]
/// without new data. The handle is reopened, in append mode, on the next
/// write. Cancellation is cooperative: a stop flag plus closing the handle
/// under the lock; the next wake exits without further I/O.
pub struct TraceWriter {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    flush_period: Duration,
    idle_timeout: Duration,
}

struct State {
    path: Option<PathBuf>,
    enabled: bool,
    out: Option<BufWriter<File>>,
    header_dirty: bool,
    mode_dirty: bool,
    next_time: u64,
    unflushed: bool,
    last_write: Instant,
    stop: bool,
    failed: bool,
}

impl TraceWriter {
    pub(crate) fn spawn(path: Option<PathBuf>, enabled: bool) -> Self {
        Self::spawn_with(path, enabled, FLUSH_PERIOD, IDLE_TIMEOUT)
    }

    pub(crate) fn spawn_with(
        path: Option<PathBuf>,
        enabled: bool,
        flush_period: Duration,
        idle_timeout: Duration,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                path,
                enabled,
                out: None,
                header_dirty: true,
                mode_dirty: true,
                next_time: 0,
                unflushed: false,
                last_write: Instant::now(),
                stop: false,
                failed: false,
            }),
            flush_period,
            idle_timeout,
        });
        let worker = Arc::clone(&shared);
        thread::spawn(move || run(worker));
        TraceWriter { shared }
    }

    /// Appends everything recorded since the last append, up to `time_end`.
    /// Called on the simulation thread whenever signals were extended; emits
    /// the pending mode comment and header row first when they are due.
    pub(crate) fn append(&self, signals: &[Signal], time_end: u64, header: bool, mode_line: &str) {
        let mut st = self.shared.state.lock().unwrap();
        if st.stop || st.failed || !st.enabled {
            return;
        }
        let Some(path) = st.path.clone() else {
            return;
        };
        if st.out.is_none() {
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => st.out = Some(BufWriter::new(file)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot open log destination");
                    st.failed = true;
                    return;
                }
            }
        }
        if let Err(e) = write_pending(&mut st, signals, time_end, header, mode_line) {
            warn!(path = %path.display(), error = %e, "log write failed");
            st.out = None;
            st.failed = true;
            return;
        }
        st.next_time = time_end;
        st.unflushed = true;
        st.last_write = Instant::now();
    }

    /// Removed signals lose their cursors implicitly (rows are rebuilt from
    /// the current list); the header row becomes due again.
    pub(crate) fn selection_changed(&self) {
        self.shared.state.lock().unwrap().header_dirty = true;
    }

    pub(crate) fn mode_changed(&self) {
        self.shared.state.lock().unwrap().mode_dirty = true;
    }

    /// History restarted at time zero; follow it.
    pub(crate) fn signals_reset(&self) {
        self.shared.state.lock().unwrap().next_time = 0;
    }

    /// Target or enabled flag changed: release the handle and adopt the new
    /// destination, which also clears a previous failure.
    pub(crate) fn file_changed(&self, enabled: bool, path: Option<&Path>) {
        let mut st = self.shared.state.lock().unwrap();
        if let Some(mut out) = st.out.take() {
            let _ = out.flush();
        }
        st.path = path.map(Path::to_path_buf);
        st.enabled = enabled;
        st.header_dirty = true;
        st.mode_dirty = true;
        st.unflushed = false;
        st.failed = false;
    }

    pub(crate) fn cancel(&self) {
        let mut st = self.shared.state.lock().unwrap();
        st.stop = true;
        if let Some(mut out) = st.out.take() {
            let _ = out.flush();
        }
        st.unflushed = false;
    }

    pub(crate) fn take_failed(&self) -> bool {
        let mut st = self.shared.state.lock().unwrap();
        std::mem::take(&mut st.failed)
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        self.shared.state.lock().unwrap().out.is_some()
    }
}

fn write_pending(
    st: &mut State,
    signals: &[Signal],
    time_end: u64,
    header: bool,
    mode_line: &str,
) -> std::io::Result<()> {
    let mode_dirty = std::mem::take(&mut st.mode_dirty);
    let header_dirty = std::mem::take(&mut st.header_dirty);
    let next_time = st.next_time;
    let out = st.out.as_mut().expect("destination was just opened");
    if mode_dirty {
        writeln!(out, "# {mode_line}")?;
    }
    if header_dirty && header && !signals.is_empty() {
        let names: Vec<String> = signals.iter().map(Signal::name).collect();
        writeln!(out, "{}", names.join("\t"))?;
    }
    // advance all cursors in lockstep by the smallest remaining run
    let mut cursors: Vec<_> = signals.iter().map(|s| s.cursor_at(next_time)).collect();
    let mut t = next_time;
    while t < time_end {
        let mut step = u64::MAX;
        for cursor in &cursors {
            if cursor.value().is_some() && cursor.duration() > 0 {
                step = step.min(cursor.duration());
            }
        }
        if step == u64::MAX {
            break;
        }
        let step = step.min(time_end - t);
        let row: Vec<String> = cursors.iter().map(|c| c.formatted()).collect();
        writeln!(out, "{}\t# {}", row.join("\t"), format_duration(step))?;
        for cursor in &mut cursors {
            cursor.advance(step);
        }
        t += step;
    }
    Ok(())
}

fn run(shared: Arc<Shared>) {
    loop {
        thread::sleep(shared.flush_period);
        let mut st = shared.state.lock().unwrap();
        if st.stop {
            return;
        }
        if st.unflushed {
            if let Some(out) = st.out.as_mut() {
                if let Err(e) = out.flush() {
                    warn!(error = %e, "log flush failed");
                    st.out = None;
                    st.failed = true;
                }
            }
            st.unflushed = false;
        } else if st.out.is_some() && st.last_write.elapsed() >= shared.idle_timeout {
            // idle: let go of the handle until the next write
            if let Some(mut out) = st.out.take() {
                let _ = out.flush();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use rekam_rs::circuit::Circuit;
    use rekam_rs::radix::Radix;

    use crate::fixture::{bits, pin};
    use crate::signal::Signal;
    use crate::signal_ref::SignalRef;

    use super::TraceWriter;

    fn two_signals() -> (Vec<Signal>, u64) {
        let a = pin("a", 1, true, 0, 0);
        let b = pin("bus", 4, false, 10, 0);
        let top = Circuit::new("top", vec![a.clone(), b.clone()]);
        let ra = SignalRef::top_level(&top, &a, None).unwrap();
        let rb = SignalRef::top_level(&top, &b, None).unwrap();
        rb.set_radix(Radix::Hexadecimal);

        let mut sa = Signal::new(0, ra, bits("0"), 10, 0, 0);
        let mut sb = Signal::new(1, rb, bits("0000"), 5, 0, 0);
        sa.extend(bits("1"), 10);
        sb.extend(bits("1010"), 15);
        (vec![sa, sb], 20)
    }

    fn spawn_fast(path: &std::path::Path) -> TraceWriter {
        TraceWriter::spawn_with(
            Some(path.to_path_buf()),
            true,
            Duration::from_millis(10),
            Duration::from_millis(60),
        )
    }

    #[test]
    fn test_rows_advance_in_lockstep() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");
        let (signals, time_end) = two_signals();

        let writer = spawn_fast(&path);
        writer.append(&signals, time_end, true, "step coarse");
        writer.cancel();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "# step coarse");
        assert_eq!(lines[1], "a\tbus[3..0]");
        // runs: a = 0(10) 1(10), bus = 0(5) A(15); sync points at 5, 10, 20
        assert_eq!(lines[2], "0\t0\t# 5 ns");
        assert_eq!(lines[3], "0\tA\t# 5 ns");
        assert_eq!(lines[4], "1\tA\t# 10 ns");
        assert_eq!(lines.len(), 5);
    }

    #[test]
    fn test_header_is_reemitted_after_selection_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");
        let (mut signals, time_end) = two_signals();

        let writer = spawn_fast(&path);
        writer.append(&signals, time_end, true, "step coarse");

        signals.remove(1);
        writer.selection_changed();
        signals[0].extend(bits("0"), 10);
        writer.append(&signals, time_end + 10, true, "step coarse");
        writer.cancel();

        let text = fs::read_to_string(&path).unwrap();
        let headers: Vec<&str> = text.lines().filter(|l| l.starts_with('a')).collect();
        assert_eq!(headers, vec!["a\tbus[3..0]", "a"]);
        assert!(text.lines().last().unwrap().starts_with("0\t# 10 ns"));
    }

    #[test]
    fn test_header_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");
        let (signals, time_end) = two_signals();

        let writer = spawn_fast(&path);
        writer.append(&signals, time_end, false, "step coarse");
        writer.cancel();

        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("bus[3..0]\n"));
        assert!(text.starts_with("# step coarse"));
    }

    #[test]
    fn test_idle_close_then_append_reopens_without_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");
        let (mut signals, time_end) = two_signals();

        let writer = spawn_fast(&path);
        writer.append(&signals, time_end, false, "step coarse");
        assert!(writer.is_open());

        // wait past the idle threshold (flush every 10ms, close after 60ms)
        thread::sleep(Duration::from_millis(200));
        assert!(!writer.is_open());
        let before = fs::read_to_string(&path).unwrap();
        assert!(!before.is_empty());

        signals[0].extend(bits("0"), 10);
        signals[1].extend(bits("0000"), 10);
        writer.append(&signals, time_end + 10, false, "step coarse");
        assert!(writer.is_open());
        writer.cancel();

        let after = fs::read_to_string(&path).unwrap();
        assert!(after.starts_with(&before));
        assert!(after.len() > before.len());
    }

    #[test]
    fn test_unwritable_destination_marks_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("trace.log");
        let (signals, time_end) = two_signals();

        let writer = spawn_fast(&path);
        writer.append(&signals, time_end, false, "step coarse");
        assert!(writer.take_failed());
        assert!(!writer.take_failed());
        writer.cancel();
    }

    #[test]
    fn test_cancel_stops_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");
        let (signals, time_end) = two_signals();

        let writer = spawn_fast(&path);
        writer.append(&signals, time_end, false, "step coarse");
        writer.cancel();
        let len = fs::read_to_string(&path).unwrap().len();

        // a late append after cancellation does nothing
        writer.append(&signals, time_end, false, "step coarse");
        thread::sleep(Duration::from_millis(50));
        assert_eq!(fs::read_to_string(&path).unwrap().len(), len);

        let worker = Arc::strong_count(&writer.shared);
        // the worker thread observes the stop flag and lets its handle go
        thread::sleep(Duration::from_millis(50));
        assert!(Arc::strong_count(&writer.shared) <= worker);
    }
}
