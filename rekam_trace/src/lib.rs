pub mod cache;
pub mod error;
pub mod model;
pub mod signal;
pub mod signal_ref;
pub mod writer;

#[cfg(test)]
pub(crate) mod fixture;

pub use cache::ModelCache;
pub use error::{RekamTraceError, RekamTraceResult};
pub use model::{format_duration, CaptureMode, ClockDiscipline, Granularity, ModelListener, TraceModel};
pub use signal::{Cursor, Signal};
pub use signal_ref::{RefChange, SignalRef};
pub use writer::TraceWriter;

pub use rekam_rs::circuit::{
    Circuit, ClockSpec, Component, ComponentKind, Location, LogCapability, LogOption,
};
pub use rekam_rs::edit::{EditResult, ReplacementMap};
pub use rekam_rs::radix::Radix;
pub use rekam_rs::state::SimAccess;
