//! A minimal page engine.
//!
//! [`EngineRegistry`] owns the comm table and the client sessions, the [`Allocator`] resolves
//! page requests. Both share one mutex with the control plane dispatcher, see the `paged` binary
//! for how they are wired up.
mod allocator;
mod registry;

#[cfg(test)]
mod tests;

pub use allocator::Allocator;
pub use registry::{EngineRegistry, Session, COMM_FILE_NAME};

/// Where the engine keeps its comm file unless configured otherwise.
pub const DEFAULT_BASE_DIR: &str = "/tmp/paged";
