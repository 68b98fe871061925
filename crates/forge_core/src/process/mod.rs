//! External process inspection.

mod probe;

pub use probe::{NullProbe, ProcessProbe, SystemProcessProbe};
