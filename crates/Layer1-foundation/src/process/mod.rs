//! Process execution
//!
//! Every external tool the pools drive (docker, ssh-agent, ssh-add, kill, ps)
//! is reached through a [`CommandRunner`]. The core never spawns processes
//! directly, so a node can be backed by the local host, a remote channel, or
//! a simulation.
//!
//! - `runner` - `CommandSpec`, `CommandOutput` and the `CommandRunner` trait
//! - `local` - `LocalCommandRunner` on top of `tokio::process`

mod local;
mod runner;

pub use local::{LocalCommandRunner, LocalRunnerConfig};
pub use runner::{CommandOutput, CommandRunner, CommandSpec};
