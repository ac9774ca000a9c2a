//! Records produced by tracking: captured arguments, measured operations, and traces.

mod arguments;
mod operation;
pub mod special;
mod trace;

pub use arguments::{ArgValue, Arguments};
pub use operation::MeasuredOperation;
pub use special::{SpecialOperations, BATCH_SIZES_KEY};
pub use trace::Trace;
