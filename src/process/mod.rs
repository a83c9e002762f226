//! Process Module
//!
//! Forwarding subprocess supervision and process-tree teardown.

pub mod registry;
pub mod supervisor;
pub mod tree;

#[cfg(test)]
pub(crate) mod fake;

pub use registry::ProcessRegistry;
pub use supervisor::{
    ForwardRequest, Forwarding, ForwardingProcess, Launcher, ProcessLauncher, SessionOutcome,
};
