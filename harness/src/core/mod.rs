//! Pure harness logic: document model, injection, collection, step rules.
//!
//! Nothing here touches the filesystem or spawns processes.

pub mod collect;
pub mod document;
pub mod inject;
pub mod outcome;
pub mod step;
