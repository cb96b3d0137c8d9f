//! Protocol definitions shared between the execution manager and its workers.

pub mod messages;
pub mod output;

pub use messages::*;
pub use output::*;
