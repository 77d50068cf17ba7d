//! Batch render queue that drives an external renderer one project at a
//! time and tracks its progress from the process output.

pub mod cache;
pub mod config;
pub mod error;
pub mod extract;
pub mod frame_spec;
pub mod hooks;
pub mod invocation;
pub mod logging;
pub mod orchestrator;
pub mod process;
pub mod progress;
pub mod project;
pub mod protocol;
pub mod queue;
pub mod run_state;
pub mod save_file;
pub mod settings;

pub use error::{QueueError, QueueResult};
