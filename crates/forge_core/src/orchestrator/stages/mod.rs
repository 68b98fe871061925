//! Stage operation adapters.
//!
//! - `CommandStage`: wraps an external program invocation
//! - `FnStage`: wraps an async closure (embedder and test seam)

mod command;
mod function;

pub use command::CommandStage;
pub use function::FnStage;
