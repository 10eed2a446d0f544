//! Host side of the light-node desktop shell.
//!
//! Downloads the node executable, runs it as supervised child processes and
//! correlates their output with named channels the UI listens on.

pub mod api;
pub mod bridge;
pub mod channel;
pub mod config;
pub mod handlers;
pub mod networks;
pub mod platform;
pub mod provisioner;
pub mod registry;
pub mod session;
pub mod state;
pub mod supervisor;

#[cfg(test)]
mod test_support;

pub use state::AppState;
