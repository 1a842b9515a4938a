//! I/O for the harness: configuration, processes, kernels, files.

pub mod artifacts;
pub mod config;
pub mod document_store;
pub mod executor;
pub mod interpreter;
pub mod kernel;
pub mod process;
